//! Cache key derivation.
//!
//! A [`CacheKey`] is the canonical text of a query's shape; a [`HashedKey`]
//! is its fixed-length digest used as the physical store key.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::application::{CompiledQuery, Grammar};
use crate::domain::{
    Boolean, Column, ConnectionId, OrderClause, Predicate, QueryDescriptor, ReadOperation, Value,
    WhereClause,
};

use super::config::CacheConfig;
use super::error::KeyError;

/// Canonical, human-readable key for one query + operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 40 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HashedKey(String);

impl HashedKey {
    pub const LEN: usize = 40;

    /// Wraps an already computed digest. Used by hashers other than
    /// [`Sha256KeyHasher`].
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HashedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One-way digest from canonical key to physical store key.
pub trait KeyHasher: Send + Sync {
    fn hash(&self, key: &CacheKey) -> HashedKey;
}

/// SHA-256 truncated to 160 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyHasher;

impl KeyHasher for Sha256KeyHasher {
    fn hash(&self, key: &CacheKey) -> HashedKey {
        let mut hasher = Sha256::new();
        hasher.update(key.as_str().as_bytes());
        let digest = hasher.finalize();
        HashedKey(hex::encode(&digest[..HashedKey::LEN / 2]))
    }
}

/// Leading segments shared by keys and tags:
/// `{namespace}:[{prefix}:]{connection}:[{database}:]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPrefix {
    namespace: String,
    prefix: Option<String>,
    use_database_keying: bool,
}

impl KeyPrefix {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            prefix: None,
            use_database_keying: true,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn with_database_keying(mut self, enabled: bool) -> Self {
        self.use_database_keying = enabled;
        self
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let prefix = Self::new(config.namespace.clone())
            .with_database_keying(config.use_database_keying);
        match &config.prefix {
            Some(custom) => prefix.with_prefix(custom.clone()),
            None => prefix,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn render(&self, connection: &ConnectionId) -> Result<String, KeyError> {
        if self.namespace.is_empty() {
            return Err(KeyError::empty("namespace"));
        }

        let mut out = String::new();
        out.push_str(&self.namespace);
        out.push(':');
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&connection.name);
        out.push(':');
        if self.use_database_keying {
            out.push_str(&connection.database);
            out.push(':');
        }
        Ok(out)
    }
}

impl Default for KeyPrefix {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Derives canonical cache keys from query descriptors.
///
/// Conjunctive predicates are rendered in sorted order, so
/// `where a and b` and `where b and a` share a key. Predicates joined by
/// `or` start a new group, and groups keep their written order.
#[derive(Clone)]
pub struct KeyCodec {
    prefix: KeyPrefix,
    grammar: Arc<dyn Grammar>,
}

impl KeyCodec {
    pub fn new(prefix: KeyPrefix, grammar: Arc<dyn Grammar>) -> Self {
        Self { prefix, grammar }
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    pub fn make_key(
        &self,
        query: &QueryDescriptor,
        operation: &ReadOperation,
    ) -> Result<CacheKey, KeyError> {
        if query.entity.table.is_empty() {
            return Err(KeyError::empty("table"));
        }

        let mut key = self.prefix.render(&query.connection)?;
        key.push_str(&query.entity.table);
        key.push(':');
        key.push_str(&query.entity.slug());
        key.push_str(&columns_clause(query, operation));
        key.push_str(&self.render_clauses(&query.wheres)?);

        let mut eager_loads: Vec<&str> = query.eager_loads.iter().map(String::as_str).collect();
        eager_loads.sort_unstable();
        for relation in eager_loads {
            key.push('-');
            key.push_str(relation);
        }

        let mut joins: Vec<&str> = query.joins.iter().map(|join| join.table.as_str()).collect();
        joins.sort_unstable();
        for table in joins {
            key.push_str("-join_");
            key.push_str(table);
        }

        for order in &query.orders {
            key.push_str(&self.render_order(order)?);
        }
        if let Some(offset) = query.offset {
            key.push_str(&format!("-offset_{offset}"));
        }
        if let Some(limit) = query.limit {
            key.push_str(&format!("-limit_{limit}"));
        }

        key.push_str(&self.differentiator(operation)?);
        Ok(CacheKey(key))
    }

    /// Suffix distinguishing terminal operations over the same clauses.
    pub fn differentiator(&self, operation: &ReadOperation) -> Result<String, KeyError> {
        let suffix = match operation {
            ReadOperation::Avg { column } => format!("-avg_{}", self.column_text(column)?),
            ReadOperation::Count { .. } => "-count".to_string(),
            ReadOperation::Exists => "-exists".to_string(),
            ReadOperation::Find { ids, many, .. } => {
                let label = if *many { "find_list" } else { "find" };
                format!("-{label}_{}", self.join_values(ids)?)
            }
            ReadOperation::First { .. } => "-first".to_string(),
            ReadOperation::Get { .. } => String::new(),
            ReadOperation::Max { column } => format!("-max_{}", self.column_text(column)?),
            ReadOperation::Min { column } => format!("-min_{}", self.column_text(column)?),
            ReadOperation::Paginate {
                per_page,
                page_name,
                page,
                total,
                ..
            } => {
                let mut suffix = format!("-paginate_by_{per_page}_{page_name}_{page}");
                if let Some(total) = total {
                    suffix.push_str(&format!("_{total}"));
                }
                suffix
            }
            ReadOperation::Pluck { column, key } => match key {
                Some(key) => format!("-pluck_{column}_{key}"),
                None => format!("-pluck_{column}"),
            },
            ReadOperation::Sum { column } => format!("-sum_{}", self.column_text(column)?),
            ReadOperation::Value { column } => format!("-value_{column}"),
        };
        Ok(suffix)
    }

    fn render_clauses(&self, clauses: &[WhereClause]) -> Result<String, KeyError> {
        let mut groups: Vec<Vec<String>> = Vec::new();
        for clause in clauses {
            let rendered = self.render_predicate(&clause.predicate)?;
            match groups.last_mut() {
                Some(group) if clause.boolean == Boolean::And => group.push(rendered),
                _ => groups.push(vec![rendered]),
            }
        }

        let mut out = String::new();
        for (index, mut group) in groups.into_iter().enumerate() {
            group.sort_unstable();
            for (position, rendered) in group.iter().enumerate() {
                out.push('-');
                if index > 0 && position == 0 {
                    out.push_str("or_");
                }
                out.push_str(rendered);
            }
        }
        Ok(out)
    }

    fn render_predicate(&self, predicate: &Predicate) -> Result<String, KeyError> {
        let rendered = match predicate {
            Predicate::Basic {
                column,
                operator,
                value,
            } => format!("{column}_{operator}_{}", self.literal(value)?),
            Predicate::In {
                column,
                values,
                negated,
            } => format!("{column}_{}_{}", in_label(*negated), self.join_values(values)?),
            Predicate::InSub {
                column,
                query,
                negated,
            } => format!("{column}_{}_{}", in_label(*negated), self.subquery_text(query)?),
            Predicate::Null { column, negated } => {
                let label = if *negated { "notnull" } else { "null" };
                format!("{column}_{label}")
            }
            Predicate::Between {
                column,
                low,
                high,
                negated,
            } => {
                let label = if *negated { "notbetween" } else { "between" };
                format!(
                    "{column}_{label}_{}_{}",
                    self.literal(low)?,
                    self.literal(high)?
                )
            }
            Predicate::Column {
                first,
                operator,
                second,
            } => format!("{first}_{operator}_{second}"),
            Predicate::Raw { sql, bindings } => {
                let compiled = CompiledQuery {
                    sql: sql.clone(),
                    bindings: bindings.clone(),
                };
                normalize_sql(&self.grammar.interpolate(&compiled)?)
            }
            Predicate::Nested { clauses } => {
                let inner = self.render_clauses(clauses)?;
                format!("({})", inner.strip_prefix('-').unwrap_or(&inner))
            }
            Predicate::Exists { query, negated } => {
                let label = if *negated { "notexists" } else { "exists" };
                format!("{label}_{}", self.subquery_text(query)?)
            }
        };
        Ok(rendered)
    }

    fn render_order(&self, order: &OrderClause) -> Result<String, KeyError> {
        let rendered = match order {
            OrderClause::Column { column, direction } => {
                format!("_orderBy_{column}_{}", direction.as_sql())
            }
            OrderClause::Raw { expression } => format!(
                "_orderByRaw_{}",
                normalize_sql(&self.grammar.render_expression(expression)?)
            ),
            OrderClause::Random { seed } => {
                format!("_orderByRandom_{}", seed.as_deref().unwrap_or_default())
            }
        };
        Ok(rendered)
    }

    fn subquery_text(&self, query: &QueryDescriptor) -> Result<String, KeyError> {
        let compiled = self.grammar.compile_select(query)?;
        Ok(normalize_sql(&self.grammar.interpolate(&compiled)?))
    }

    fn literal(&self, value: &Value) -> Result<String, KeyError> {
        match value {
            Value::Raw(expression) => Ok(self.grammar.render_expression(expression)?),
            Value::Float(value) => Ok(format!("{value:?}")),
            Value::Text(text) => Ok(text_literal(text)),
            other => Ok(other.to_string()),
        }
    }

    fn join_values(&self, values: &[Value]) -> Result<String, KeyError> {
        let rendered = values
            .iter()
            .map(|value| self.literal(value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rendered.join("_"))
    }

    fn column_text(&self, column: &Column) -> Result<String, KeyError> {
        match column {
            Column::Name(name) => Ok(name.clone()),
            Column::Raw(expression) => Ok(self.grammar.render_expression(expression)?),
        }
    }
}

impl fmt::Debug for KeyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCodec")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn in_label(negated: bool) -> &'static str {
    if negated { "notin" } else { "in" }
}

/// Operation columns win over the selected columns; `*` renders as nothing.
fn columns_clause(query: &QueryDescriptor, operation: &ReadOperation) -> String {
    let operation_columns = operation.key_columns();
    let columns = if is_wildcard(&operation_columns) {
        &query.columns
    } else {
        &operation_columns
    };
    if is_wildcard(columns) {
        return String::new();
    }
    format!("_{}", columns.join("_"))
}

fn is_wildcard(columns: &[String]) -> bool {
    columns.is_empty() || (columns.len() == 1 && columns[0] == "*")
}

/// Escapes the key separators, and quotes text that would otherwise read as
/// a null, boolean or number literal (or as nothing at all).
fn text_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '_' | '-' | '\'') {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    let ambiguous = text.is_empty()
        || matches!(text, "null" | "true" | "false")
        || text.parse::<f64>().is_ok();
    if ambiguous {
        format!("'{escaped}'")
    } else {
        escaped
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.chars()
        .filter(|c| !matches!(c, '\'' | '"' | '`'))
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}
