//! Cache Codec Implementations
//!
//! This module provides built-in implementations of the [`CacheCodec`](crate::traits::CacheCodec) trait
//! for different serialization backends, and the [`Codec`] enum the store dispatches through.

mod json;
pub use json::JsonCodec;

#[cfg(feature = "msgpack")]
mod msgpack_codec;
#[cfg(feature = "msgpack")]
#[cfg_attr(docsrs, doc(cfg(feature = "msgpack")))]
pub use msgpack_codec::MsgPackCodec;

#[cfg(feature = "bincode")]
mod bincode_codec;
#[cfg(feature = "bincode")]
#[cfg_attr(docsrs, doc(cfg(feature = "bincode")))]
pub use bincode_codec::BincodeCodec;

use crate::error::Result;
use crate::traits::CacheCodec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Codec selected for a store
///
/// `CacheCodec` has generic methods and is therefore not object safe; this enum lets the
/// store pick a codec at runtime without boxing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Json,
    #[cfg(feature = "msgpack")]
    MsgPack,
    #[cfg(feature = "bincode")]
    Bincode,
}

impl CacheCodec for Codec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => JsonCodec.serialize(value),
            #[cfg(feature = "msgpack")]
            Self::MsgPack => MsgPackCodec.serialize(value),
            #[cfg(feature = "bincode")]
            Self::Bincode => BincodeCodec.serialize(value),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => JsonCodec.deserialize(bytes),
            #[cfg(feature = "msgpack")]
            Self::MsgPack => MsgPackCodec.deserialize(bytes),
            #[cfg(feature = "bincode")]
            Self::Bincode => BincodeCodec.deserialize(bytes),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Json => JsonCodec.name(),
            #[cfg(feature = "msgpack")]
            Self::MsgPack => MsgPackCodec.name(),
            #[cfg(feature = "bincode")]
            Self::Bincode => BincodeCodec.name(),
        }
    }
}
