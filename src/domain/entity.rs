//! Entities (tables/models) and the connections they live on.

use serde::{Deserialize, Serialize};

/// Identifies the database connection a query runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    pub name: String,
    pub database: String,
}

impl ConnectionId {
    pub fn new(name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
        }
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new("default", "main")
    }
}

/// A logical table/model that queries read from and write to.
///
/// `model` is the model identifier (often a class-like path such as
/// `App\Models\Book`); when no model is declared the table name doubles as
/// the model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub table: String,
    pub model: String,
    /// Trust window after a write, overriding the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<u64>,
}

impl Entity {
    pub fn new(table: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            model: model.into(),
            cooldown_ms: None,
        }
    }

    /// An entity whose model identifier is its table name.
    pub fn table(table: impl Into<String>) -> Self {
        let table = table.into();
        Self::new(table.clone(), table)
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = Some(cooldown_ms);
        self
    }

    /// Normalized model identifier used in keys and tags.
    ///
    /// Lowercases and keeps only ASCII alphanumerics and `_`, so
    /// `App\Models\Book` and ` app\models\BOOK ` collapse to `appmodelsbook`.
    pub fn slug(&self) -> String {
        slugify(&self.model)
    }
}

pub(crate) fn slugify(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
