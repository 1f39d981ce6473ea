//! Fluent query handle bound to a [`CachingDecorator`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::application::ExecutorError;
use crate::domain::{
    Column, Direction, Entity, Expression, OrderClause, Page, Plucked, Predicate,
    QueryDescriptor, QueryOutput, ReadOperation, Row, Value, WhereClause, WriteOperation,
};

use super::decorator::CachingDecorator;

/// Whether reads on a query instance may use the cache.
///
/// Starts `Cachable`. Once `Bypass`, it stays `Bypass` for the life of the
/// instance: there is no transition back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheState {
    #[default]
    Cachable,
    Bypass,
}

impl CacheState {
    pub fn is_bypass(self) -> bool {
        matches!(self, Self::Bypass)
    }
}

pub struct CachedQuery {
    decorator: Arc<CachingDecorator>,
    descriptor: QueryDescriptor,
    state: CacheState,
}

impl CachedQuery {
    pub fn new(decorator: Arc<CachingDecorator>, descriptor: QueryDescriptor) -> Self {
        let state = if descriptor.has_random_order() {
            CacheState::Bypass
        } else {
            CacheState::Cachable
        };
        Self {
            decorator,
            descriptor,
            state,
        }
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> QueryDescriptor {
        self.descriptor
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Every read on this instance goes straight to the executor.
    pub fn disable_cache(mut self) -> Self {
        self.state = CacheState::Bypass;
        self
    }

    // Clauses

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_cmp(column, "=", value)
    }

    pub fn where_cmp(
        self,
        column: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.push_and(Predicate::Basic {
            column: column.into(),
            operator: operator.into(),
            value: value.into(),
        })
    }

    pub fn or_where_cmp(
        self,
        column: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.push_or(Predicate::Basic {
            column: column.into(),
            operator: operator.into(),
            value: value.into(),
        })
    }

    pub fn where_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_and(in_predicate(column, values, false))
    }

    pub fn or_where_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_or(in_predicate(column, values, false))
    }

    pub fn where_not_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.push_and(in_predicate(column, values, true))
    }

    pub fn where_in_sub(self, column: impl Into<String>, query: QueryDescriptor) -> Self {
        self.push_and(Predicate::InSub {
            column: column.into(),
            query: Box::new(query),
            negated: false,
        })
    }

    pub fn where_null(self, column: impl Into<String>) -> Self {
        self.push_and(Predicate::Null {
            column: column.into(),
            negated: false,
        })
    }

    pub fn where_not_null(self, column: impl Into<String>) -> Self {
        self.push_and(Predicate::Null {
            column: column.into(),
            negated: true,
        })
    }

    pub fn where_between(
        self,
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.push_and(Predicate::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
            negated: false,
        })
    }

    pub fn where_column(
        self,
        first: impl Into<String>,
        operator: impl Into<String>,
        second: impl Into<String>,
    ) -> Self {
        self.push_and(Predicate::Column {
            first: first.into(),
            operator: operator.into(),
            second: second.into(),
        })
    }

    pub fn where_raw(self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        self.push_and(Predicate::Raw {
            sql: sql.into(),
            bindings,
        })
    }

    /// A parenthesised group of clauses.
    pub fn where_nested(self, clauses: Vec<WhereClause>) -> Self {
        self.push_and(Predicate::Nested { clauses })
    }

    pub fn or_where_nested(self, clauses: Vec<WhereClause>) -> Self {
        self.push_or(Predicate::Nested { clauses })
    }

    pub fn where_exists(self, query: QueryDescriptor) -> Self {
        self.push_and(Predicate::Exists {
            query: Box::new(query),
            negated: false,
        })
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.descriptor.orders.push(OrderClause::Column {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn order_by_raw(mut self, expression: Expression) -> Self {
        self.descriptor.orders.push(OrderClause::Raw { expression });
        self
    }

    /// Random ordering makes results non-deterministic, so the instance stops
    /// using the cache.
    pub fn in_random_order(mut self, seed: Option<String>) -> Self {
        self.descriptor.orders.push(OrderClause::Random { seed });
        self.state = CacheState::Bypass;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.descriptor.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.descriptor.offset = Some(offset);
        self
    }

    /// Eager load a relation; nested relations use dots.
    pub fn with(mut self, relation: impl Into<String>) -> Self {
        self.descriptor.eager_loads.push(relation.into());
        self
    }

    pub fn join(mut self, entity: Entity) -> Self {
        self.descriptor.joins.push(entity);
        self
    }

    fn push_and(mut self, predicate: Predicate) -> Self {
        self.descriptor.wheres.push(WhereClause::and(predicate));
        self
    }

    fn push_or(mut self, predicate: Predicate) -> Self {
        self.descriptor.wheres.push(WhereClause::or(predicate));
        self
    }

    // Reads

    /// Run any read operation and return the raw output.
    pub async fn run(&self, operation: ReadOperation) -> Result<QueryOutput, ExecutorError> {
        self.decorator
            .read(&self.descriptor, &operation, self.state)
            .await
    }

    pub async fn get(&self) -> Result<Vec<Row>, ExecutorError> {
        match self.run(ReadOperation::get()).await? {
            QueryOutput::Rows(rows) => Ok(rows),
            other => Err(unexpected("get", &other)),
        }
    }

    pub async fn first(&self) -> Result<Option<Row>, ExecutorError> {
        let operation = ReadOperation::First {
            columns: wildcard(),
        };
        match self.run(operation).await? {
            QueryOutput::Row(row) => Ok(row),
            other => Err(unexpected("first", &other)),
        }
    }

    pub async fn find(&self, id: impl Into<Value>) -> Result<Option<Row>, ExecutorError> {
        let operation = ReadOperation::Find {
            ids: vec![id.into()],
            many: false,
            columns: wildcard(),
        };
        match self.run(operation).await? {
            QueryOutput::Row(row) => Ok(row),
            other => Err(unexpected("find", &other)),
        }
    }

    pub async fn find_many<I, V>(&self, ids: I) -> Result<Vec<Row>, ExecutorError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let operation = ReadOperation::Find {
            ids: ids.into_iter().map(Into::into).collect(),
            many: true,
            columns: wildcard(),
        };
        match self.run(operation).await? {
            QueryOutput::Rows(rows) => Ok(rows),
            other => Err(unexpected("find", &other)),
        }
    }

    pub async fn count(&self) -> Result<u64, ExecutorError> {
        let operation = ReadOperation::Count {
            columns: wildcard(),
        };
        match self.run(operation).await? {
            QueryOutput::Count(count) => Ok(count),
            other => Err(unexpected("count", &other)),
        }
    }

    pub async fn exists(&self) -> Result<bool, ExecutorError> {
        match self.run(ReadOperation::Exists).await? {
            QueryOutput::Exists(exists) => Ok(exists),
            other => Err(unexpected("exists", &other)),
        }
    }

    pub async fn avg(&self, column: impl Into<Column>) -> Result<Value, ExecutorError> {
        self.scalar(ReadOperation::Avg {
            column: column.into(),
        })
        .await
    }

    pub async fn average(&self, column: impl Into<Column>) -> Result<Value, ExecutorError> {
        self.avg(column).await
    }

    pub async fn max(&self, column: impl Into<Column>) -> Result<Value, ExecutorError> {
        self.scalar(ReadOperation::Max {
            column: column.into(),
        })
        .await
    }

    pub async fn min(&self, column: impl Into<Column>) -> Result<Value, ExecutorError> {
        self.scalar(ReadOperation::Min {
            column: column.into(),
        })
        .await
    }

    pub async fn sum(&self, column: impl Into<Column>) -> Result<Value, ExecutorError> {
        self.scalar(ReadOperation::Sum {
            column: column.into(),
        })
        .await
    }

    pub async fn value(&self, column: impl Into<String>) -> Result<Value, ExecutorError> {
        self.scalar(ReadOperation::Value {
            column: column.into(),
        })
        .await
    }

    pub async fn pluck(
        &self,
        column: impl Into<String>,
        key: Option<String>,
    ) -> Result<Vec<Plucked>, ExecutorError> {
        let operation = ReadOperation::Pluck {
            column: column.into(),
            key,
        };
        match self.run(operation).await? {
            QueryOutput::Plucked(values) => Ok(values),
            other => Err(unexpected("pluck", &other)),
        }
    }

    pub async fn paginate(&self, per_page: u64, page: u64) -> Result<Page, ExecutorError> {
        match self.run(ReadOperation::paginate(per_page, page)).await? {
            QueryOutput::Page(page) => Ok(page),
            other => Err(unexpected("paginate", &other)),
        }
    }

    async fn scalar(&self, operation: ReadOperation) -> Result<Value, ExecutorError> {
        let name = operation.name();
        match self.run(operation).await? {
            QueryOutput::Scalar(value) => Ok(value),
            other => Err(unexpected(name, &other)),
        }
    }

    // Writes

    pub async fn insert(&self, rows: Vec<BTreeMap<String, Value>>) -> Result<u64, ExecutorError> {
        self.write(WriteOperation::Insert { rows }).await
    }

    pub async fn update(&self, values: BTreeMap<String, Value>) -> Result<u64, ExecutorError> {
        self.write(WriteOperation::Update { values }).await
    }

    pub async fn delete(&self) -> Result<u64, ExecutorError> {
        self.write(WriteOperation::Delete).await
    }

    pub async fn force_delete(&self) -> Result<u64, ExecutorError> {
        self.write(WriteOperation::ForceDelete).await
    }

    pub async fn increment(
        &self,
        column: impl Into<String>,
        amount: impl Into<Value>,
    ) -> Result<u64, ExecutorError> {
        self.write(WriteOperation::Increment {
            column: column.into(),
            amount: amount.into(),
            extra: BTreeMap::new(),
        })
        .await
    }

    pub async fn decrement(
        &self,
        column: impl Into<String>,
        amount: impl Into<Value>,
    ) -> Result<u64, ExecutorError> {
        self.write(WriteOperation::Decrement {
            column: column.into(),
            amount: amount.into(),
            extra: BTreeMap::new(),
        })
        .await
    }

    /// Run any write operation. Writes always invalidate, whatever the
    /// cache state of this instance.
    pub async fn write(&self, operation: WriteOperation) -> Result<u64, ExecutorError> {
        self.decorator.write(&self.descriptor, &operation).await
    }
}

impl std::fmt::Debug for CachedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedQuery")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

fn in_predicate<I, V>(column: impl Into<String>, values: I, negated: bool) -> Predicate
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Predicate::In {
        column: column.into(),
        values: values.into_iter().map(Into::into).collect(),
        negated,
    }
}

fn unexpected(operation: &'static str, output: &QueryOutput) -> ExecutorError {
    ExecutorError::UnexpectedOutput {
        operation,
        kind: output.kind(),
    }
}
