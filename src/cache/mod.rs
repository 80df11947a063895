//! Named cache stores for the offline gateway.
//!
//! This module provides:
//! - Named stores mapping request URLs to captured responses
//! - SQLite persistence shared by every gateway process of an origin
//! - A cache-first lookup with fill-on-miss for eligible responses

mod layer;
mod storage;
pub mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::CacheSource;
