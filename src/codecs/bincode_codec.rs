//! Bincode Codec using `bincode`

use crate::error::{CacheError, Result};
use crate::traits::CacheCodec;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bincode Codec using `bincode`
///
/// Smallest and fastest of the built-in codecs. The format is not self-describing:
/// it cannot decode `serde_json::Value` payloads, so only use it with concrete types.
#[cfg_attr(docsrs, doc(cfg(feature = "bincode")))]
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl CacheCodec for BincodeCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "bincode"
    }
}
