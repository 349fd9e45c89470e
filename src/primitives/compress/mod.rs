#![forbid(unsafe_code)]
//! Page payload codecs.

use serde::{Deserialize, Serialize};

use crate::types::{Result, StrataError};

/// Compresses and decompresses page payloads.
pub trait Compressor: Send + Sync {
    /// Appends the encoding of `src` to `dst`.
    fn encode(&self, dst: &mut Vec<u8>, src: &[u8]) -> Result<()>;
    /// Appends the decoding of `src` to `dst`.
    fn decode(&self, dst: &mut Vec<u8>, src: &[u8]) -> Result<()>;
    /// Returns true if encoded payloads differ from their input.
    fn compresses(&self) -> bool;
}

/// Codec selection for a tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// Pages are stored as-is.
    #[default]
    None,
    /// Pages are compressed with raw Snappy.
    Snappy,
}

impl CompressionKind {
    /// Builds the codec for this kind.
    pub fn compressor(self) -> Box<dyn Compressor> {
        match self {
            CompressionKind::None => Box::new(PassThrough),
            CompressionKind::Snappy => Box::new(Snappy),
        }
    }
}

/// Copies bytes unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl Compressor for PassThrough {
    fn encode(&self, dst: &mut Vec<u8>, src: &[u8]) -> Result<()> {
        dst.extend_from_slice(src);
        Ok(())
    }

    fn decode(&self, dst: &mut Vec<u8>, src: &[u8]) -> Result<()> {
        dst.extend_from_slice(src);
        Ok(())
    }

    fn compresses(&self) -> bool {
        false
    }
}

/// Raw (unframed) Snappy.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snappy;

impl Compressor for Snappy {
    fn encode(&self, dst: &mut Vec<u8>, src: &[u8]) -> Result<()> {
        let encoded = snap::raw::Encoder::new()
            .compress_vec(src)
            .map_err(|_| StrataError::Invalid("snappy input too large"))?;
        dst.extend_from_slice(&encoded);
        Ok(())
    }

    fn decode(&self, dst: &mut Vec<u8>, src: &[u8]) -> Result<()> {
        let decoded = snap::raw::Decoder::new()
            .decompress_vec(src)
            .map_err(|_| StrataError::Corruption("snappy payload malformed"))?;
        dst.extend_from_slice(&decoded);
        Ok(())
    }

    fn compresses(&self) -> bool {
        true
    }
}
