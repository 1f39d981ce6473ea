//! Cache-layer failures. None of these reach callers of decorated
//! operations: each one degrades to direct delegate execution.

use thiserror::Error;

use crate::application::GrammarError;

/// A cache key could not be derived for a query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("failed to render expression: {0}")]
    Grammar(#[from] GrammarError),
    #[error("`{field}` must not be empty")]
    EmptyIdentifier { field: &'static str },
}

impl KeyError {
    pub fn empty(field: &'static str) -> Self {
        Self::EmptyIdentifier { field }
    }
}

/// The cache backend could not serve a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    KeyDerivation(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to (de)serialize cached payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("hashed key `{hashed_key}` collides with a different query")]
    Collision { hashed_key: String },
}

impl CacheError {
    /// Label used for the `cause` dimension of degradation metrics.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::KeyDerivation(_) => "key_derivation",
            Self::Store(_) => "store_unavailable",
            Self::Serialization(_) => "serialization",
            Self::Collision { .. } => "collision",
        }
    }
}
