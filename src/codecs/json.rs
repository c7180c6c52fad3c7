//! JSON Codec using `serde_json`

use crate::error::{CacheError, Result};
use crate::traits::CacheCodec;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON Codec using `serde_json`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl CacheCodec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(CacheError::from)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(CacheError::from)
    }

    fn name(&self) -> &'static str {
        "serde_json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_bytes_are_a_serialization_error() {
        let err = JsonCodec
            .deserialize::<serde_json::Value>(b"{not json")
            .err()
            .unwrap_or_else(|| panic!("expected error"));
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
