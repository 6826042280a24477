//! Named response caches and the fetch strategies built on them.
//!
//! This module provides:
//! - Named caches (a versioned shell cache and a runtime cache) in SQLite
//! - Request identity keyed on method + URL, GET only
//! - Network-first and cache-first strategies with offline fallbacks

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedEntry, RequestKey, ResponseSource, Served};
