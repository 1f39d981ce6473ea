//! Literal values, raw expressions and result rows.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};

/// A raw SQL fragment. Rendered through the grammar, never by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Expression {
    pub raw: String,
}

impl Expression {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

/// A literal bound into a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// NaN and infinities have no JSON form and refuse to serialize.
    Float(#[serde(serialize_with = "finite_float")] f64),
    Text(String),
    Raw(Expression),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Raw(expression) => f.write_str(&expression.raw),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Expression> for Value {
    fn from(value: Expression) -> Self {
        Self::Raw(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One record returned by the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot: Option<Pivot>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(column.into(), value.into());
        self
    }

    pub fn with_pivot(mut self, pivot: Pivot) -> Self {
        self.pivot = Some(pivot);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.attributes.get(column)
    }
}

/// Intermediate-table data attached to a row loaded through a many-to-many
/// relation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pivot {
    pub table: String,
    pub attributes: BTreeMap<String, Value>,
    /// Back-reference to the container the row was loaded through. Not
    /// serializable; stripped before a result is stored.
    #[serde(
        skip_deserializing,
        skip_serializing_if = "Option::is_none",
        serialize_with = "reject_pivot_parent"
    )]
    pub parent: Option<PivotParent>,
}

impl Pivot {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(column.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: PivotParent) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl PartialEq for Pivot {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.attributes == other.attributes
    }
}

/// Opaque handle to the pivot parent container.
#[derive(Clone)]
pub struct PivotParent(pub Arc<dyn Any + Send + Sync>);

impl PivotParent {
    pub fn new<T: Any + Send + Sync>(parent: T) -> Self {
        Self(Arc::new(parent))
    }
}

impl fmt::Debug for PivotParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PivotParent(..)")
    }
}

fn reject_pivot_parent<S: Serializer>(
    _parent: &Option<PivotParent>,
    _serializer: S,
) -> Result<S::Ok, S::Error> {
    Err(S::Error::custom("pivot parent back-reference is not serializable"))
}

fn finite_float<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if !value.is_finite() {
        return Err(S::Error::custom(format!("non-finite float {value} is not serializable")));
    }
    serializer.serialize_f64(*value)
}
