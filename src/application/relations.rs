//! Relation graph: which entity a named relation resolves to.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::Entity;

/// Resolves relation names declared on an entity to the related entity.
pub trait RelationGraph: Send + Sync {
    fn related(&self, parent: &Entity, relation: &str) -> Option<Entity>;
}

/// A relation declaration: `parent.name` resolves to `related`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub parent: String,
    pub name: String,
    pub related: Entity,
}

/// Relation graph backed by a fixed table of declarations, keyed by the
/// parent's model slug.
#[derive(Debug, Clone, Default)]
pub struct StaticRelationGraph {
    relations: HashMap<(String, String), Entity>,
}

impl StaticRelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, parent: &Entity, name: impl Into<String>, related: Entity) -> Self {
        self.insert(parent, name, related);
        self
    }

    pub fn insert(&mut self, parent: &Entity, name: impl Into<String>, related: Entity) {
        self.relations.insert((parent.slug(), name.into()), related);
    }

    pub fn from_defs(defs: impl IntoIterator<Item = RelationDef>) -> Self {
        let mut graph = Self::new();
        for def in defs {
            let parent = Entity::new(def.parent.clone(), def.parent);
            graph.insert(&parent, def.name, def.related);
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

impl RelationGraph for StaticRelationGraph {
    fn related(&self, parent: &Entity, relation: &str) -> Option<Entity> {
        self.relations
            .get(&(parent.slug(), relation.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_by_parent_slug() {
        let book = Entity::new("books", "App\\Models\\Book");
        let author = Entity::new("authors", "App\\Models\\Author");
        let graph = StaticRelationGraph::new().with(&book, "author", author.clone());

        let same_model = Entity::new("books", "app\\models\\book");
        assert_eq!(graph.related(&same_model, "author"), Some(author));
        assert_eq!(graph.related(&book, "publisher"), None);
    }

    #[test]
    fn defs_use_parent_as_model_identifier() {
        let graph = StaticRelationGraph::from_defs([RelationDef {
            parent: "App\\Models\\Book".to_string(),
            name: "store".to_string(),
            related: Entity::table("stores"),
        }]);
        let book = Entity::new("books", "App\\Models\\Book");
        assert_eq!(graph.related(&book, "store"), Some(Entity::table("stores")));
        assert_eq!(graph.len(), 1);
    }
}
