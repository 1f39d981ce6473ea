//! The caching decorator around a [`QueryExecutor`].
//!
//! Reads are served from the store when the canonical key matches and the
//! entity is outside its cooldown window; everything else falls through to
//! the executor. Writes flush the entity's tags, start its cooldown and only
//! then reach the executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::application::{
    ExecutorError, Grammar, QueryExecutor, RelationGraph, StandardGrammar, StaticRelationGraph,
};
use crate::domain::{
    ConnectionId, Entity, QueryDescriptor, QueryOutput, ReadOperation, WriteOperation,
};

use super::builder::{CacheState, CachedQuery};
use super::config::CacheConfig;
use super::cooldown::CooldownTracker;
use super::error::{CacheError, KeyError};
use super::keys::{CacheKey, HashedKey, KeyCodec, KeyHasher, KeyPrefix, Sha256KeyHasher};
use super::store::{CacheStore, MemoryStore, StoredRecord};
use super::tags::{TagIndex, TagSet};

pub(crate) const METRIC_HIT: &str = "querycache_hit_total";
pub(crate) const METRIC_MISS: &str = "querycache_miss_total";
pub(crate) const METRIC_BYPASS: &str = "querycache_bypass_total";
pub(crate) const METRIC_COLLISION: &str = "querycache_collision_total";
pub(crate) const METRIC_FLUSH: &str = "querycache_flush_total";
pub(crate) const METRIC_DEGRADED: &str = "querycache_degraded_total";
pub(crate) const METRIC_DELEGATE_MS: &str = "querycache_delegate_ms";

/// Everything derived for one cached read.
#[derive(Debug, Clone, Serialize)]
pub struct CacheLookup {
    pub key: CacheKey,
    pub hashed_key: HashedKey,
    pub tags: TagSet,
}

pub struct CachingDecorator {
    executor: Arc<dyn QueryExecutor>,
    store: Arc<dyn CacheStore>,
    prefix: KeyPrefix,
    codec: KeyCodec,
    tags: TagIndex,
    hasher: Arc<dyn KeyHasher>,
    cooldown: Arc<CooldownTracker>,
    connection: ConnectionId,
    enabled: AtomicBool,
}

impl CachingDecorator {
    /// A decorator with an in-memory store and cooldown tracker, the standard
    /// grammar and no declared relations.
    pub fn new(executor: Arc<dyn QueryExecutor>, config: &CacheConfig) -> Self {
        let prefix = KeyPrefix::from_config(config);
        Self {
            executor,
            store: Arc::new(MemoryStore::new(config)),
            codec: KeyCodec::new(prefix.clone(), Arc::new(StandardGrammar)),
            tags: TagIndex::new(prefix.clone(), Arc::new(StaticRelationGraph::new())),
            prefix,
            hasher: Arc::new(Sha256KeyHasher),
            cooldown: Arc::new(CooldownTracker::in_memory(config.cooldown())),
            connection: ConnectionId::default(),
            enabled: AtomicBool::new(config.enabled),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_grammar(mut self, grammar: Arc<dyn Grammar>) -> Self {
        self.codec = KeyCodec::new(self.prefix.clone(), grammar);
        self
    }

    pub fn with_relations(mut self, graph: Arc<dyn RelationGraph>) -> Self {
        self.tags = TagIndex::new(self.prefix.clone(), graph);
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn KeyHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Arc<CooldownTracker>) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Connection used by queries started with [`CachingDecorator::query`].
    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = connection;
        self
    }

    /// Start a cachable query against `entity`.
    pub fn query(self: &Arc<Self>, entity: Entity) -> CachedQuery {
        CachedQuery::new(
            Arc::clone(self),
            QueryDescriptor::new(self.connection.clone(), entity),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "Query cache toggled");
    }

    pub fn cooldown(&self) -> &CooldownTracker {
        &self.cooldown
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// Derive key, hashed key and tags for a read without touching the store.
    pub fn lookup(
        &self,
        query: &QueryDescriptor,
        operation: &ReadOperation,
    ) -> Result<CacheLookup, KeyError> {
        let key = self.codec.make_key(query, operation)?;
        let tags = self.tags.make_tags(query)?;
        let hashed_key = self.hasher.hash(&key);
        Ok(CacheLookup {
            key,
            hashed_key,
            tags,
        })
    }

    /// Run a read-type operation, through the cache when `state` allows.
    pub async fn read(
        &self,
        query: &QueryDescriptor,
        operation: &ReadOperation,
        state: CacheState,
    ) -> Result<QueryOutput, ExecutorError> {
        if !self.is_enabled() {
            return self.bypass(query, operation, "disabled").await;
        }
        if state.is_bypass() {
            return self.bypass(query, operation, "query").await;
        }
        if query.has_random_order() {
            return self.bypass(query, operation, "random_order").await;
        }

        let lookup = match self.lookup(query, operation) {
            Ok(lookup) => lookup,
            Err(err) => {
                self.degraded(&CacheError::from(err), query, operation);
                return self.delegate_read(query, operation).await;
            }
        };

        match self.cooldown.is_trusted(&query.connection, &query.entity).await {
            Ok(true) => {}
            Ok(false) => {
                counter!(METRIC_BYPASS, "reason" => "cooldown").increment(1);
                debug!(
                    hashed_key = %lookup.hashed_key,
                    entity = %query.entity.model,
                    operation = operation.name(),
                    outcome = "cooldown",
                    "Entity in cooldown; refreshing record"
                );
                self.forget(&lookup).await;
                return self.populate(&lookup, query, operation).await;
            }
            Err(err) => {
                self.degraded(&CacheError::from(err), query, operation);
                return self.delegate_read(query, operation).await;
            }
        }

        let record = match self.store.get(&lookup.tags, &lookup.hashed_key).await {
            Ok(record) => record,
            Err(err) => {
                self.degraded(&CacheError::from(err), query, operation);
                return self.delegate_read(query, operation).await;
            }
        };

        let Some(record) = record else {
            counter!(METRIC_MISS).increment(1);
            debug!(
                hashed_key = %lookup.hashed_key,
                entity = %query.entity.model,
                operation = operation.name(),
                outcome = "miss",
                "Cache miss"
            );
            return self.populate(&lookup, query, operation).await;
        };

        if !record.matches(&lookup.key) {
            counter!(METRIC_COLLISION).increment(1);
            let err = CacheError::Collision {
                hashed_key: lookup.hashed_key.to_string(),
            };
            warn!(
                hashed_key = %lookup.hashed_key,
                entity = %query.entity.model,
                operation = operation.name(),
                outcome = "collision",
                error = %err,
                "Stored record belongs to a different query; recomputing"
            );
            self.forget(&lookup).await;
            return self.populate(&lookup, query, operation).await;
        }

        match record.decode() {
            Ok(output) => {
                counter!(METRIC_HIT).increment(1);
                debug!(
                    hashed_key = %lookup.hashed_key,
                    entity = %query.entity.model,
                    operation = operation.name(),
                    outcome = "hit",
                    "Cache hit"
                );
                Ok(output)
            }
            Err(err) => {
                self.degraded(&CacheError::from(err), query, operation);
                self.forget(&lookup).await;
                self.populate(&lookup, query, operation).await
            }
        }
    }

    /// Run a write-type operation. The entity's tags are flushed and its
    /// cooldown started before the executor runs, and again once it
    /// succeeds.
    pub async fn write(
        &self,
        query: &QueryDescriptor,
        operation: &WriteOperation,
    ) -> Result<u64, ExecutorError> {
        self.invalidate(&query.connection, &query.entity, operation.name())
            .await;

        let started = Instant::now();
        let result = self.executor.write(query, operation).await;
        histogram!(METRIC_DELEGATE_MS, "operation" => operation.name())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        let affected = result?;

        self.invalidate(&query.connection, &query.entity, operation.name())
            .await;
        Ok(affected)
    }

    /// Flush every record tagged with `entity` on the default connection.
    pub async fn flush_entity(&self, entity: &Entity) -> Result<usize, CacheError> {
        self.flush_entity_on(&self.connection, entity).await
    }

    pub async fn flush_entity_on(
        &self,
        connection: &ConnectionId,
        entity: &Entity,
    ) -> Result<usize, CacheError> {
        let mut tags = TagSet::new();
        tags.insert(self.tags.entity_tag(connection, entity)?);
        let removed = self.store.flush(&tags).await?;
        counter!(METRIC_FLUSH).increment(1);
        info!(
            entity = %entity.model,
            tags = %tags,
            removed,
            "Flushed entity cache"
        );
        Ok(removed)
    }

    pub async fn flush_all(&self) -> Result<(), CacheError> {
        self.store.flush_all().await?;
        counter!(METRIC_FLUSH).increment(1);
        info!("Flushed entire query cache");
        Ok(())
    }

    async fn bypass(
        &self,
        query: &QueryDescriptor,
        operation: &ReadOperation,
        reason: &'static str,
    ) -> Result<QueryOutput, ExecutorError> {
        counter!(METRIC_BYPASS, "reason" => reason).increment(1);
        debug!(
            entity = %query.entity.model,
            operation = operation.name(),
            outcome = "bypass",
            reason,
            "Cache bypassed"
        );
        self.delegate_read(query, operation).await
    }

    /// Delegate, strip pivot parents, store. Never retries.
    async fn populate(
        &self,
        lookup: &CacheLookup,
        query: &QueryDescriptor,
        operation: &ReadOperation,
    ) -> Result<QueryOutput, ExecutorError> {
        let mut output = self.delegate_read(query, operation).await?;

        let stripped = output.strip_pivot_parents();
        if stripped > 0 {
            debug!(
                hashed_key = %lookup.hashed_key,
                stripped,
                "Removed pivot parent references before storing"
            );
        }

        let stored = match StoredRecord::encode(&lookup.key, &output) {
            Ok(record) => self
                .store
                .put_forever(&lookup.tags, &lookup.hashed_key, record)
                .await
                .map_err(CacheError::from),
            Err(err) => Err(CacheError::from(err)),
        };
        if let Err(err) = stored {
            self.degraded(&err, query, operation);
        }
        Ok(output)
    }

    async fn delegate_read(
        &self,
        query: &QueryDescriptor,
        operation: &ReadOperation,
    ) -> Result<QueryOutput, ExecutorError> {
        let started = Instant::now();
        let result = self.executor.read(query, operation).await;
        histogram!(METRIC_DELEGATE_MS, "operation" => operation.name())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn forget(&self, lookup: &CacheLookup) {
        if let Err(err) = self.store.forget(&lookup.tags, &lookup.hashed_key).await {
            counter!(METRIC_DEGRADED, "cause" => "store_unavailable").increment(1);
            warn!(
                hashed_key = %lookup.hashed_key,
                error = %err,
                "Failed to forget cached record"
            );
        }
    }

    /// Flush the tags of `entity` and its cooldown dependents, then mark
    /// them written. Failures are logged; the write goes ahead regardless.
    async fn invalidate(&self, connection: &ConnectionId, entity: &Entity, operation: &str) {
        let mut tags = TagSet::new();
        let targets =
            std::iter::once(entity.clone()).chain(self.cooldown.dependents_of(entity));
        for target in targets {
            match self.tags.entity_tag(connection, &target) {
                Ok(tag) => {
                    tags.insert(tag);
                }
                Err(err) => warn!(
                    entity = %target.model,
                    error = %err,
                    "Cannot derive tag for written entity"
                ),
            }
        }

        match self.store.flush(&tags).await {
            Ok(removed) => {
                counter!(METRIC_FLUSH).increment(1);
                info!(
                    entity = %entity.model,
                    operation,
                    tags = %tags,
                    removed,
                    "Flushed tags for write"
                );
            }
            Err(err) => {
                counter!(METRIC_DEGRADED, "cause" => "store_unavailable").increment(1);
                warn!(
                    entity = %entity.model,
                    operation,
                    error = %err,
                    "Failed to flush tags for write"
                );
            }
        }

        if let Err(err) = self.cooldown.mark_written(connection, entity).await {
            counter!(METRIC_DEGRADED, "cause" => "cooldown_unavailable").increment(1);
            warn!(
                entity = %entity.model,
                operation,
                error = %err,
                "Failed to mark cooldown for write"
            );
        }
    }

    fn degraded(&self, err: &CacheError, query: &QueryDescriptor, operation: &ReadOperation) {
        counter!(METRIC_DEGRADED, "cause" => err.cause()).increment(1);
        warn!(
            entity = %query.entity.model,
            operation = operation.name(),
            outcome = "degraded",
            cause = err.cause(),
            error = %err,
            "Cache unavailable for this call; using executor directly"
        );
    }
}

impl std::fmt::Debug for CachingDecorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingDecorator")
            .field("prefix", &self.prefix)
            .field("connection", &self.connection)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
