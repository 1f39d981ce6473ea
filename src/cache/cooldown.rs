//! Post-write trust windows.
//!
//! After a write to an entity, cached reads of it are not trusted until its
//! cooldown window has elapsed. Writes also mark every entity that declared a
//! dependency on the written one, transitively.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::{ConnectionId, Entity};

use super::error::StoreError;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::cooldown";

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = rw_write(&self.now, SOURCE, "clock.advance");
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        *rw_write(&self.now, SOURCE, "clock.set") = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *rw_read(&self.now, SOURCE, "clock.now")
    }
}

/// Most recent write to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CooldownMarker {
    /// Monotonic per-store write counter.
    pub version: u64,
    pub written_at: OffsetDateTime,
}

/// Shared storage for cooldown markers. Markers are never deleted
/// explicitly.
#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn marker(&self, entity_key: &str) -> Result<Option<CooldownMarker>, StoreError>;

    async fn mark(
        &self,
        entity_key: &str,
        written_at: OffsetDateTime,
    ) -> Result<CooldownMarker, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCooldownStore {
    markers: DashMap<String, CooldownMarker>,
    epoch: AtomicU64,
}

impl InMemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[async_trait]
impl CooldownStore for InMemoryCooldownStore {
    async fn marker(&self, entity_key: &str) -> Result<Option<CooldownMarker>, StoreError> {
        Ok(self.markers.get(entity_key).map(|marker| *marker))
    }

    async fn mark(
        &self,
        entity_key: &str,
        written_at: OffsetDateTime,
    ) -> Result<CooldownMarker, StoreError> {
        let marker = CooldownMarker {
            version: self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
            written_at,
        };
        self.markers.insert(entity_key.to_string(), marker);
        Ok(marker)
    }
}

pub struct CooldownTracker {
    store: Arc<dyn CooldownStore>,
    clock: Arc<dyn Clock>,
    default_window: Duration,
    /// Entity slug -> entities whose cooldown follows it.
    dependents: RwLock<HashMap<String, Vec<Entity>>>,
}

impl CooldownTracker {
    pub fn new(
        store: Arc<dyn CooldownStore>,
        clock: Arc<dyn Clock>,
        default_window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            default_window,
            dependents: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory(default_window: Duration) -> Self {
        Self::new(
            Arc::new(InMemoryCooldownStore::new()),
            Arc::new(SystemClock),
            default_window,
        )
    }

    /// Writes to `on` also start the cooldown of `dependent`.
    pub fn declare_dependency(&self, dependent: Entity, on: &Entity) {
        let mut dependents = rw_write(&self.dependents, SOURCE, "declare_dependency");
        let entry = dependents.entry(on.slug()).or_default();
        if !entry.iter().any(|known| known.slug() == dependent.slug()) {
            entry.push(dependent);
        }
    }

    /// Every entity reachable through declared dependencies, excluding
    /// `entity` itself. Cycles are tolerated.
    pub fn dependents_of(&self, entity: &Entity) -> Vec<Entity> {
        let dependents = rw_read(&self.dependents, SOURCE, "dependents_of");
        let mut visited = HashSet::from([entity.slug()]);
        let mut queue = VecDeque::from([entity.slug()]);
        let mut found = Vec::new();

        while let Some(slug) = queue.pop_front() {
            for dependent in dependents.get(&slug).into_iter().flatten() {
                let dependent_slug = dependent.slug();
                if visited.insert(dependent_slug.clone()) {
                    found.push(dependent.clone());
                    queue.push_back(dependent_slug);
                }
            }
        }
        found
    }

    pub fn window_for(&self, entity: &Entity) -> Duration {
        entity
            .cooldown_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_window)
    }

    /// True when no write to `entity` happened within its window.
    pub async fn is_trusted(
        &self,
        connection: &ConnectionId,
        entity: &Entity,
    ) -> Result<bool, StoreError> {
        let window = self.window_for(entity);
        if window.is_zero() {
            return Ok(true);
        }

        let Some(marker) = self.store.marker(&marker_key(connection, entity)).await? else {
            return Ok(true);
        };
        let elapsed = self.clock.now() - marker.written_at;
        let window = time::Duration::try_from(window).unwrap_or(time::Duration::MAX);
        Ok(elapsed >= window)
    }

    /// Marks `entity` and its dependents as written now. Returns every
    /// entity that was marked, `entity` first.
    pub async fn mark_written(
        &self,
        connection: &ConnectionId,
        entity: &Entity,
    ) -> Result<Vec<Entity>, StoreError> {
        let now = self.clock.now();
        let mut marked = vec![entity.clone()];
        marked.extend(self.dependents_of(entity));

        for target in &marked {
            self.store.mark(&marker_key(connection, target), now).await?;
        }
        Ok(marked)
    }
}

impl std::fmt::Debug for CooldownTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownTracker")
            .field("default_window", &self.default_window)
            .finish_non_exhaustive()
    }
}

fn marker_key(connection: &ConnectionId, entity: &Entity) -> String {
    format!("{}:{}:{}", connection.name, connection.database, entity.slug())
}
