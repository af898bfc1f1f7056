//! Value Codec
//!
//! Every value persisted by the disk tier goes through [`CacheCodec`]. Any
//! serde type gets a JSON codec for free.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Encode/decode capability required of disk-cacheable values
pub trait CacheCodec: Sized {
    /// Encode the value into a blob
    fn encode(&self) -> Result<Vec<u8>>;

    /// Decode a blob produced by [`CacheCodec::encode`]
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl<T> CacheCodec for T
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Codec(format!("encode failed: {}", e)))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(format!("decode failed: {}", e)))
    }
}
