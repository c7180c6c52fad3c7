//! MessagePack Codec using `rmp-serde`

use crate::error::{CacheError, Result};
use crate::traits::CacheCodec;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// MessagePack Codec using `rmp-serde`
///
/// Compact binary encoding that keeps field names, so values written by one version of
/// a struct still decode after fields are added.
#[cfg_attr(docsrs, doc(cfg(feature = "msgpack")))]
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl CacheCodec for MsgPackCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }
}
