//! Invalidation tags.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::application::RelationGraph;
use crate::domain::{ConnectionId, Entity, QueryDescriptor};

use super::error::KeyError;
use super::keys::KeyPrefix;

/// Tags a record is filed under. Ordered so the set has one canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: impl Into<String>) -> bool {
        self.0.insert(tag.into())
    }

    pub fn extend(&mut self, other: TagSet) {
        self.0.extend(other.0);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable single-string form, used to scope entries to their tag set.
    pub fn canonical(&self) -> String {
        self.iter().collect::<Vec<_>>().join("|")
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Derives the tag set for a query: the primary entity, every relation it
/// eager loads (walking dotted paths), every joined table and every entity
/// read by a sub-query.
#[derive(Clone)]
pub struct TagIndex {
    prefix: KeyPrefix,
    graph: Arc<dyn RelationGraph>,
}

impl TagIndex {
    pub fn new(prefix: KeyPrefix, graph: Arc<dyn RelationGraph>) -> Self {
        Self { prefix, graph }
    }

    pub fn entity_tag(
        &self,
        connection: &ConnectionId,
        entity: &Entity,
    ) -> Result<String, KeyError> {
        let slug = entity.slug();
        if slug.is_empty() {
            return Err(KeyError::empty("model"));
        }
        let mut tag = self.prefix.render(connection)?;
        tag.push_str(&slug);
        Ok(tag)
    }

    pub fn make_tags(&self, query: &QueryDescriptor) -> Result<TagSet, KeyError> {
        let mut tags = TagSet::new();
        self.collect(query, &mut tags)?;
        for subquery in query.subqueries() {
            self.collect(subquery, &mut tags)?;
        }
        Ok(tags)
    }

    fn collect(&self, query: &QueryDescriptor, tags: &mut TagSet) -> Result<(), KeyError> {
        let connection = &query.connection;
        tags.insert(self.entity_tag(connection, &query.entity)?);

        for path in &query.eager_loads {
            let mut parent = query.entity.clone();
            for relation in path.split('.').filter(|segment| !segment.is_empty()) {
                let Some(related) = self.graph.related(&parent, relation) else {
                    debug!(
                        entity = %parent.model,
                        relation,
                        "Relation not declared; no tag derived"
                    );
                    break;
                };
                tags.insert(self.entity_tag(connection, &related)?);
                parent = related;
            }
        }

        for join in &query.joins {
            tags.insert(self.entity_tag(connection, join)?);
        }
        Ok(())
    }
}

impl fmt::Debug for TagIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagIndex")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
