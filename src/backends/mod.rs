//! Key-Value Store Implementations
//!
//! # Available Backends
//!
//! - **Memory** - Concurrent `DashMap` store with per-key expiry (always available)
//! - **Redis** - Distributed store with automatic reconnection (feature: `redis`, default)
//!
//! # Usage
//!
//! ```rust,no_run
//! use resilient_cache::backends::MemoryStore;
//! # #[cfg(feature = "redis")]
//! use resilient_cache::backends::RedisStore;
//!
//! # async fn example() -> resilient_cache::Result<()> {
//! let memory = MemoryStore::new();
//! # #[cfg(feature = "redis")]
//! let redis = RedisStore::with_url("redis://127.0.0.1:6379", 32).await?;
//! # Ok(())
//! # }
//! ```

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
