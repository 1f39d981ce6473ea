//! Tagged key/value storage for query results.

use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tracing::debug;

use crate::domain::QueryOutput;

use super::config::CacheConfig;
use super::error::StoreError;
use super::keys::{CacheKey, HashedKey};
use super::lock::{rw_read, rw_write};
use super::registry::{EntryKey, TagRegistry};
use super::tags::TagSet;

const SOURCE: &str = "cache::store";
pub(crate) const METRIC_STORE_EVICT: &str = "querycache_store_evict_total";

/// The persisted value: the canonical key it was stored for plus the
/// serialized result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    pub payload: Bytes,
}

impl StoredRecord {
    pub fn encode(key: &CacheKey, output: &QueryOutput) -> Result<Self, serde_json::Error> {
        Ok(Self {
            key: key.as_str().to_string(),
            payload: Bytes::from(serde_json::to_vec(output)?),
        })
    }

    pub fn decode(&self) -> Result<QueryOutput, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// False when the record was stored for a different query whose hashed
    /// key collides with `key`.
    pub fn matches(&self, key: &CacheKey) -> bool {
        self.key == key.as_str()
    }
}

/// A tagged cache backend.
///
/// Records are filed under all of their tags at once; flushing any one of
/// those tags removes the record.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(
        &self,
        tags: &TagSet,
        key: &HashedKey,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Store without expiry.
    async fn put_forever(
        &self,
        tags: &TagSet,
        key: &HashedKey,
        record: StoredRecord,
    ) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn forget(&self, tags: &TagSet, key: &HashedKey) -> Result<bool, StoreError>;

    /// Remove every record filed under any of `tags`. Returns how many were
    /// removed.
    async fn flush(&self, tags: &TagSet) -> Result<usize, StoreError>;

    async fn flush_all(&self) -> Result<(), StoreError>;
}

/// In-process store with LRU eviction.
///
/// Lock order is always entries first, then the registry, so a flush cannot
/// interleave with a store between its insert and its registration.
pub struct MemoryStore {
    entries: RwLock<LruCache<EntryKey, StoredRecord>>,
    registry: TagRegistry,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.max_entries_non_zero())),
            registry: TagRegistry::new(),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tags: &TagSet, key: &HashedKey) -> bool {
        rw_read(&self.entries, SOURCE, "contains").contains(&EntryKey::new(tags, key))
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(
        &self,
        tags: &TagSet,
        key: &HashedKey,
    ) -> Result<Option<StoredRecord>, StoreError> {
        Ok(rw_write(&self.entries, SOURCE, "get")
            .get(&EntryKey::new(tags, key))
            .cloned())
    }

    async fn put_forever(
        &self,
        tags: &TagSet,
        key: &HashedKey,
        record: StoredRecord,
    ) -> Result<(), StoreError> {
        let entry = EntryKey::new(tags, key);
        let mut entries = rw_write(&self.entries, SOURCE, "put_forever");

        if let Some((evicted, _)) = entries.push(entry.clone(), record)
            && evicted != entry
        {
            self.registry.unregister(&evicted);
            counter!(METRIC_STORE_EVICT).increment(1);
            debug!(
                hashed_key = %evicted.hashed_key,
                tags = %evicted.scope,
                "Evicted least recently used record"
            );
        }
        self.registry.register(entry, tags);
        Ok(())
    }

    async fn forget(&self, tags: &TagSet, key: &HashedKey) -> Result<bool, StoreError> {
        let entry = EntryKey::new(tags, key);
        let mut entries = rw_write(&self.entries, SOURCE, "forget");
        let removed = entries.pop(&entry).is_some();
        self.registry.unregister(&entry);
        Ok(removed)
    }

    async fn flush(&self, tags: &TagSet) -> Result<usize, StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "flush");
        let mut removed = 0;
        for tag in tags.iter() {
            for entry in self.registry.drain_tag(tag) {
                if entries.pop(&entry).is_some() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut entries = rw_write(&self.entries, SOURCE, "flush_all");
        entries.clear();
        self.registry.clear();
        Ok(())
    }
}
