#![forbid(unsafe_code)]

use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};

/// Length of a content digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// Fixed-width content digest stored with every entry and page.
pub type Digest = [u8; DIGEST_LEN];

/// Digest of nothing; used for empty nodes and absent roots.
pub const ZERO_DIGEST: Digest = [0u8; DIGEST_LEN];

const POOL_RETAIN: usize = 64;

/// CRC32 over a page, salted with its page number.
pub fn page_crc32(page_no: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Pool of reusable digest states.
///
/// Digests are SHA-256 truncated to [`DIGEST_LEN`] bytes. Hasher states are
/// recycled across calls so hot paths (leaf merges, page flushes) do not
/// allocate a fresh state per entry.
#[derive(Default)]
pub struct HashPool {
    idle: Mutex<Vec<Sha256>>,
}

impl HashPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Digests the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Digest {
        let mut state = self.idle.lock().pop().unwrap_or_default();
        for part in parts {
            state.update(part);
        }
        let full = state.finalize_reset();
        let mut out = ZERO_DIGEST;
        out.copy_from_slice(&full[..DIGEST_LEN]);
        let mut idle = self.idle.lock();
        if idle.len() < POOL_RETAIN {
            idle.push(state);
        }
        out
    }

    /// Number of idle hasher states currently pooled.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_concatenation_of_parts() {
        let pool = HashPool::new();
        let split = pool.digest(&[b"hello", b" world"]);
        let joined = pool.digest(&[b"hello world"]);
        assert_eq!(split, joined);
        assert_ne!(split, pool.digest(&[b"hello"]));
        assert_ne!(split, ZERO_DIGEST);
    }

    #[test]
    fn states_are_recycled() {
        let pool = HashPool::new();
        assert_eq!(pool.idle(), 0);
        pool.digest(&[b"a"]);
        pool.digest(&[b"b"]);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.digest(&[b"a"]), pool.digest(&[b"a"]));
    }

    #[test]
    fn page_crc32_changes_with_components() {
        let payload = vec![0u8; 16];
        let crc_a = page_crc32(1, &payload);
        assert_eq!(crc_a, page_crc32(1, &payload));

        let mut different = payload.clone();
        different[0] = 1;
        assert_ne!(crc_a, page_crc32(1, &different));
        assert_ne!(crc_a, page_crc32(3, &payload));
    }
}
