//! Terminal operations issued against a query.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::{Expression, Value};

/// A column argument that may be a raw expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Column {
    Name(String),
    Raw(Expression),
}

impl From<&str> for Column {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for Column {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<Expression> for Column {
    fn from(value: Expression) -> Self {
        Self::Raw(value)
    }
}

fn default_page_name() -> String {
    "page".to_string()
}

fn default_page() -> u64 {
    1
}

fn default_columns() -> Vec<String> {
    vec!["*".to_string()]
}

/// Read-type operations. Each one is cached under its own differentiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReadOperation {
    Avg {
        column: Column,
    },
    Count {
        #[serde(default = "default_columns")]
        columns: Vec<String>,
    },
    Exists,
    Find {
        ids: Vec<Value>,
        /// `true` when called with an id list rather than a single id.
        #[serde(default)]
        many: bool,
        #[serde(default = "default_columns")]
        columns: Vec<String>,
    },
    First {
        #[serde(default = "default_columns")]
        columns: Vec<String>,
    },
    Get {
        #[serde(default = "default_columns")]
        columns: Vec<String>,
    },
    Max {
        column: Column,
    },
    Min {
        column: Column,
    },
    Paginate {
        per_page: u64,
        #[serde(default = "default_columns")]
        columns: Vec<String>,
        #[serde(default = "default_page_name")]
        page_name: String,
        #[serde(default = "default_page")]
        page: u64,
        #[serde(default)]
        total: Option<u64>,
    },
    Pluck {
        column: String,
        #[serde(default)]
        key: Option<String>,
    },
    Sum {
        column: Column,
    },
    Value {
        column: String,
    },
}

impl ReadOperation {
    /// Stable operation name, used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Avg { .. } => "avg",
            Self::Count { .. } => "count",
            Self::Exists => "exists",
            Self::Find { .. } => "find",
            Self::First { .. } => "first",
            Self::Get { .. } => "get",
            Self::Max { .. } => "max",
            Self::Min { .. } => "min",
            Self::Paginate { .. } => "paginate",
            Self::Pluck { .. } => "pluck",
            Self::Sum { .. } => "sum",
            Self::Value { .. } => "value",
        }
    }

    /// Columns that become part of the cache key.
    pub fn key_columns(&self) -> Vec<String> {
        match self {
            Self::Count { columns }
            | Self::Find { columns, .. }
            | Self::First { columns }
            | Self::Get { columns }
            | Self::Paginate { columns, .. } => columns.clone(),
            Self::Pluck { column, .. } => vec![column.clone()],
            Self::Avg { .. }
            | Self::Exists
            | Self::Max { .. }
            | Self::Min { .. }
            | Self::Sum { .. }
            | Self::Value { .. } => default_columns(),
        }
    }

    pub fn paginate(per_page: u64, page: u64) -> Self {
        Self::Paginate {
            per_page,
            columns: default_columns(),
            page_name: default_page_name(),
            page,
            total: None,
        }
    }

    pub fn get() -> Self {
        Self::Get {
            columns: default_columns(),
        }
    }
}

/// Write-type operations. Every one of them invalidates the entity's tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOperation {
    Insert {
        rows: Vec<BTreeMap<String, Value>>,
    },
    Update {
        values: BTreeMap<String, Value>,
    },
    Delete,
    ForceDelete,
    Increment {
        column: String,
        amount: Value,
        #[serde(default)]
        extra: BTreeMap<String, Value>,
    },
    Decrement {
        column: String,
        amount: Value,
        #[serde(default)]
        extra: BTreeMap<String, Value>,
    },
}

impl WriteOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete => "delete",
            Self::ForceDelete => "force_delete",
            Self::Increment { .. } => "increment",
            Self::Decrement { .. } => "decrement",
        }
    }
}
