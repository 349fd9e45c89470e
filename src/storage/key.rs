//! External key routing.
//!
//! External keys start with an ASCII partition tag. `-account` keys live in
//! the main tree; `-storage` keys carry a 20-byte partition name followed by
//! the key local to that partition's sub-tree.

use std::fmt;

use crate::types::{Result, StrataError};

/// Tag for top-level account keys.
pub const ACCOUNT_PREFIX: &[u8] = b"-account";
/// Tag for partitioned storage keys.
pub const STORAGE_PREFIX: &[u8] = b"-storage";
/// Tag reserved for contract code.
pub const CODE_PREFIX: &[u8] = b"-code";
/// Tag reserved for code hashes.
pub const CODE_HASH_PREFIX: &[u8] = b"-codeHash";
/// Tag reserved for root records.
pub const ROOT_PREFIX: &[u8] = b"-root";

/// Length of a sub-tree name.
pub const SUBTREE_NAME_LEN: usize = 20;

/// Fixed-length sub-tree name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubTreeName(pub [u8; SUBTREE_NAME_LEN]);

impl SubTreeName {
    /// Reads a name from exactly [`SUBTREE_NAME_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SUBTREE_NAME_LEN] = bytes
            .try_into()
            .map_err(|_| StrataError::InvalidKey("sub-tree name must be 20 bytes"))?;
        Ok(Self(arr))
    }

    /// Key of this sub-tree's descriptor in the main tree.
    pub fn descriptor_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(STORAGE_PREFIX.len() + SUBTREE_NAME_LEN);
        key.extend_from_slice(STORAGE_PREFIX);
        key.extend_from_slice(&self.0);
        key
    }

    /// Raw name bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SubTreeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SubTreeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubTreeName({self})")
    }
}

/// Partition kind selected by a key's tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partition {
    /// Main-tree account key.
    Account,
    /// Sub-tree storage key.
    Storage,
}

/// A parsed external key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedKey<'a> {
    /// Partition kind.
    pub partition: Partition,
    /// Target sub-tree, absent for main-tree keys.
    pub subtree: Option<SubTreeName>,
    /// Key within the target tree.
    pub local: &'a [u8],
}

impl RoutedKey<'_> {
    /// Key under which the entry is stored in its tree.
    ///
    /// Main-tree entries keep their full external key so account keys and
    /// sub-tree descriptors share one ordered key space.
    pub fn tree_key(&self, external: &[u8]) -> Vec<u8> {
        match self.subtree {
            Some(_) => self.local.to_vec(),
            None => external.to_vec(),
        }
    }
}

/// Splits an external key into partition, sub-tree name and local key.
pub fn route(key: &[u8]) -> Result<RoutedKey<'_>> {
    // Longer tags first: "-codeHash" shares a prefix with "-code".
    if key.starts_with(CODE_HASH_PREFIX) || key.starts_with(CODE_PREFIX) {
        return Err(StrataError::InvalidKey("code keys are not supported"));
    }
    if key.starts_with(ROOT_PREFIX) {
        return Err(StrataError::InvalidKey("root keys are not supported"));
    }
    if let Some(rest) = key.strip_prefix(ACCOUNT_PREFIX) {
        if rest.is_empty() {
            return Err(StrataError::InvalidKey("empty account key"));
        }
        if rest.starts_with(STORAGE_PREFIX) {
            return Err(StrataError::InvalidKey("account key collides with sub-tree descriptors"));
        }
        return Ok(RoutedKey {
            partition: Partition::Account,
            subtree: None,
            local: rest,
        });
    }
    if let Some(rest) = key.strip_prefix(STORAGE_PREFIX) {
        if rest.len() < SUBTREE_NAME_LEN {
            return Err(StrataError::InvalidKey("storage key shorter than partition name"));
        }
        let (name, local) = rest.split_at(SUBTREE_NAME_LEN);
        if local.is_empty() {
            return Err(StrataError::InvalidKey("empty storage key"));
        }
        return Ok(RoutedKey {
            partition: Partition::Storage,
            subtree: Some(SubTreeName::from_slice(name)?),
            local,
        });
    }
    Err(StrataError::InvalidKey("unknown key prefix"))
}

/// Builds an external account key.
pub fn account_key(local: &[u8]) -> Vec<u8> {
    [ACCOUNT_PREFIX, local].concat()
}

/// Builds an external storage key.
pub fn storage_key(name: &SubTreeName, local: &[u8]) -> Vec<u8> {
    [STORAGE_PREFIX, &name.0[..], local].concat()
}
