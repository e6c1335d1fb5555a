//! Versioned cache generations for intercepted responses.
//!
//! This module provides the storage side of the gateway:
//! - Named, versioned generations (`{prefix}-{logical}-{version}`)
//! - Request keys canonicalized and hashed for stable lookups
//! - Atomic writes and whole-generation deletion
//! - An optional per-generation entry bound for the runtime stores

mod key;
mod manager;
mod storage;
mod traits;

pub use key::CacheKey;
pub use manager::{CacheHandle, CacheLimits, CacheStoreManager, LogicalCache};
pub use storage::{CacheStorage, CachedEntry, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
