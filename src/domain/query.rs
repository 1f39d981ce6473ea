//! The logical shape of a pending query.

use serde::{Deserialize, Serialize};

use super::entity::{ConnectionId, Entity};
use super::value::{Expression, Value};

/// How a where clause connects to the clause before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boolean {
    #[default]
    And,
    Or,
}

impl Boolean {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

/// A single predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    Basic {
        column: String,
        operator: String,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
        #[serde(default)]
        negated: bool,
    },
    InSub {
        column: String,
        query: Box<QueryDescriptor>,
        #[serde(default)]
        negated: bool,
    },
    Null {
        column: String,
        #[serde(default)]
        negated: bool,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
        #[serde(default)]
        negated: bool,
    },
    Column {
        first: String,
        operator: String,
        second: String,
    },
    Raw {
        sql: String,
        #[serde(default)]
        bindings: Vec<Value>,
    },
    Nested {
        clauses: Vec<WhereClause>,
    },
    Exists {
        query: Box<QueryDescriptor>,
        #[serde(default)]
        negated: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    #[serde(default)]
    pub boolean: Boolean,
    #[serde(flatten)]
    pub predicate: Predicate,
}

impl WhereClause {
    pub fn and(predicate: Predicate) -> Self {
        Self {
            boolean: Boolean::And,
            predicate,
        }
    }

    pub fn or(predicate: Predicate) -> Self {
        Self {
            boolean: Boolean::Or,
            predicate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderClause {
    Column {
        column: String,
        #[serde(default)]
        direction: Direction,
    },
    Raw {
        expression: Expression,
    },
    /// Non-deterministic ordering; results of such queries are never cached.
    Random {
        #[serde(default)]
        seed: Option<String>,
    },
}

/// Everything a cache key is derived from. Built once by
/// [`CachedQuery`](crate::cache::CachedQuery), then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(default)]
    pub connection: ConnectionId,
    pub entity: Entity,
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
    #[serde(default)]
    pub wheres: Vec<WhereClause>,
    #[serde(default)]
    pub orders: Vec<OrderClause>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    /// Relation names to eager load; nested relations use dots (`author.publisher`).
    #[serde(default)]
    pub eager_loads: Vec<String>,
    #[serde(default)]
    pub joins: Vec<Entity>,
}

fn default_columns() -> Vec<String> {
    vec!["*".to_string()]
}

impl QueryDescriptor {
    pub fn new(connection: ConnectionId, entity: Entity) -> Self {
        Self {
            connection,
            entity,
            columns: default_columns(),
            wheres: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
            eager_loads: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// True when any ordering is random.
    pub fn has_random_order(&self) -> bool {
        self.orders
            .iter()
            .any(|order| matches!(order, OrderClause::Random { .. }))
    }

    /// Queries nested inside predicates (sub-selects, exists checks), depth first.
    pub fn subqueries(&self) -> Vec<&QueryDescriptor> {
        let mut found = Vec::new();
        collect_subqueries(&self.wheres, &mut found);
        found
    }
}

fn collect_subqueries<'a>(clauses: &'a [WhereClause], found: &mut Vec<&'a QueryDescriptor>) {
    for clause in clauses {
        match &clause.predicate {
            Predicate::InSub { query, .. } | Predicate::Exists { query, .. } => {
                found.push(query.as_ref());
                found.extend(query.subqueries());
            }
            Predicate::Nested { clauses } => collect_subqueries(clauses, found),
            _ => {}
        }
    }
}
