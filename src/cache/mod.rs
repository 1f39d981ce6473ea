//! Query Cache
//!
//! Transparent read-through caching in front of a [`QueryExecutor`]:
//!
//! - **Keys**: canonical text of a query's shape, hashed to 40 hex chars
//! - **Tags**: one per entity a query touches; writes flush them
//! - **Cooldown**: after a write, reads of the entity skip cached results
//!   until its window has elapsed
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! namespace = "querycache"
//! cooldown_ms = 0
//! max_entries = 10000
//! ```
//!
//! [`QueryExecutor`]: crate::application::QueryExecutor

mod builder;
mod config;
mod cooldown;
mod decorator;
mod error;
mod keys;
mod lock;
mod registry;
mod store;
mod tags;

pub use builder::{CacheState, CachedQuery};
pub use config::CacheConfig;
pub use cooldown::{
    Clock, CooldownMarker, CooldownStore, CooldownTracker, InMemoryCooldownStore, ManualClock,
    SystemClock,
};
pub use decorator::{CacheLookup, CachingDecorator};
pub use error::{CacheError, KeyError, StoreError};
pub use keys::{CacheKey, HashedKey, KeyCodec, KeyHasher, KeyPrefix, Sha256KeyHasher};
pub use registry::{EntryKey, TagRegistry};
pub use store::{CacheStore, MemoryStore, StoredRecord};
pub use tags::{TagIndex, TagSet};

pub(crate) mod metric_names {
    pub(crate) use super::decorator::{
        METRIC_BYPASS, METRIC_COLLISION, METRIC_DEGRADED, METRIC_DELEGATE_MS, METRIC_FLUSH,
        METRIC_HIT, METRIC_MISS,
    };
    pub(crate) use super::lock::METRIC_LOCK_POISONED;
    pub(crate) use super::store::METRIC_STORE_EVICT;
}
