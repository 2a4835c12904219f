//! Key-value cache with TTL expiry, stale-while-revalidate reads and
//! single-flight fetches.
//!
//! This crate provides:
//! - `CacheManager` - TTL reads, `get_or_fetch`, pattern invalidation, sweeps
//! - `Storage` - pluggable persistence (`MemoryStorage`, `FileStorage`)
//! - `Clock` - pluggable time source (`SystemClock`, `ManualClock`)
//! - `SingleFlight` - at most one outstanding fetch per key
//! - `KeyPattern` - glob matching over keys
//!
//! TTLs are a read-time concern: the same entry can be fresh for one caller
//! and stale for another.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use swr_cache::{CacheManager, FetchError, MemoryStorage};
//!
//! let cache = CacheManager::new(MemoryStorage::new());
//!
//! // Fresh for a minute, served stale (and refreshed) for five.
//! let fetched = cache
//!     .get_or_fetch(
//!         "issue_types",
//!         || async { fetch_issue_types().await.map_err(FetchError::new) },
//!         Duration::from_secs(60),
//!         Duration::from_secs(300),
//!     )
//!     .await?;
//!
//! if fetched.from_cache {
//!     // possibly stale, a refresh may be running
//! }
//!
//! cache.invalidate_pattern("issue_*").await;
//! ```

mod clock;
mod config;
mod entry;
mod error;
mod flight;
mod fs;
mod manager;
mod pattern;
mod stats;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{CacheConfig, TtlPolicy};
pub use entry::{CacheEntry, EntryInfo, Freshness};
pub use error::{CacheError, FetchError};
pub use flight::{Acquire, Flight, FlightOutcome, SingleFlight, Ticket};
pub use fs::FileStorage;
pub use manager::{CacheManager, CacheStatus, Fetched};
pub use pattern::{glob_to_regex, KeyPattern};
pub use stats::{CacheStats, StatsSnapshot};
pub use storage::{MemoryStorage, Storage, StorageError};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        CacheError, CacheManager, CacheStatus, FetchError, Fetched, MemoryStorage, Storage,
    };
}
