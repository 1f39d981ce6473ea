//! The real query executor the cache decorates.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{QueryDescriptor, QueryOutput, ReadOperation, WriteOperation};

/// Failures raised by the real data layer. Propagated unchanged by every
/// decorated operation and never cached.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("connection `{connection}` unavailable: {message}")]
    Connection { connection: String, message: String },
    #[error("unsupported operation `{operation}` on `{table}`")]
    Unsupported {
        operation: &'static str,
        table: String,
    },
    #[error("`{operation}` returned an unexpected `{kind}` result")]
    UnexpectedOutput {
        operation: &'static str,
        kind: &'static str,
    },
    #[error("database timeout")]
    Timeout,
}

impl ExecutorError {
    pub fn query(err: impl std::fmt::Display) -> Self {
        Self::Query(err.to_string())
    }

    pub fn unsupported(operation: &'static str, table: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            table: table.into(),
        }
    }
}

/// Executes queries against the backing database.
///
/// Given the same descriptor and operation with no intervening write, `read`
/// must return the same result.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn read(
        &self,
        query: &QueryDescriptor,
        operation: &ReadOperation,
    ) -> Result<QueryOutput, ExecutorError>;

    /// Runs a mutation and returns the number of affected rows.
    async fn write(
        &self,
        query: &QueryDescriptor,
        operation: &WriteOperation,
    ) -> Result<u64, ExecutorError>;
}
