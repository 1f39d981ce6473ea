#![allow(dead_code)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use querycache::application::{ExecutorError, QueryExecutor};
use querycache::cache::{
    CacheKey, CacheStore, CooldownMarker, CooldownStore, HashedKey, KeyHasher, StoreError,
    StoredRecord, TagSet,
};
use querycache::domain::{
    Boolean, Column, Direction, Entity, OrderClause, Page, Pivot, PivotParent, Plucked, Predicate,
    QueryDescriptor, QueryOutput, ReadOperation, Row, Value, WhereClause, WriteOperation,
};
use time::OffsetDateTime;

pub fn books() -> Entity {
    Entity::new("books", "Acme\\Library\\Book")
}

pub fn authors() -> Entity {
    Entity::new("authors", "Acme\\Library\\Author")
}

pub fn stores() -> Entity {
    Entity::new("stores", "Acme\\Library\\Store")
}

pub fn book(id: i64, author_id: i64, title: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("author_id", author_id)
        .with("title", title)
        .with("price", id * 10)
}

pub fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), value.clone()))
        .collect()
}

/// In-memory executor over named tables that counts every call it receives.
#[derive(Default)]
pub struct RecordingExecutor {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    pivot_parents: AtomicBool,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: &str, rows: Vec<Row>) -> Self {
        self.tables
            .lock()
            .expect("tables lock")
            .insert(table.to_string(), rows);
        self
    }

    pub fn seeded() -> Self {
        Self::new()
            .with_table(
                "books",
                (1..=40)
                    .map(|id| book(id, (id - 1) % 5 + 1, &format!("Book {id}")))
                    .collect(),
            )
            .with_table(
                "authors",
                (1..=5)
                    .map(|id| Row::new().with("id", id).with("name", format!("Author {id}")))
                    .collect(),
            )
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Attach a pivot with a parent back-reference to every returned row.
    pub fn attach_pivot_parents(&self, attach: bool) {
        self.pivot_parents.store(attach, Ordering::SeqCst);
    }

    fn selected(&self, query: &QueryDescriptor) -> Vec<Row> {
        let tables = self.tables.lock().expect("tables lock");
        let mut rows: Vec<Row> = tables
            .get(&query.entity.table)
            .into_iter()
            .flatten()
            .filter(|row| matches_all(row, &query.wheres))
            .cloned()
            .collect();
        drop(tables);

        for order in query.orders.iter().rev() {
            if let OrderClause::Column { column, direction } = order {
                rows.sort_by(|a, b| {
                    let ordering = compare(a.get(column), b.get(column));
                    match direction {
                        Direction::Asc => ordering,
                        Direction::Desc => ordering.reverse(),
                    }
                });
            }
        }

        let offset = query.offset.unwrap_or(0) as usize;
        let rows = rows.into_iter().skip(offset);
        let mut rows: Vec<Row> = match query.limit {
            Some(limit) => rows.take(limit as usize).collect(),
            None => rows.collect(),
        };

        if self.pivot_parents.load(Ordering::SeqCst) {
            for row in &mut rows {
                row.pivot = Some(
                    Pivot::new("book_store")
                        .with("store_id", 1)
                        .with_parent(PivotParent::new(query.entity.table.clone())),
                );
            }
        }
        rows
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn read(
        &self,
        query: &QueryDescriptor,
        operation: &ReadOperation,
    ) -> Result<QueryOutput, ExecutorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ExecutorError::Timeout);
        }

        let rows = self.selected(query);
        let output = match operation {
            ReadOperation::Get { .. } => QueryOutput::Rows(rows),
            ReadOperation::First { .. } => QueryOutput::Row(rows.into_iter().next()),
            ReadOperation::Find { ids, many, .. } => {
                let found: Vec<Row> = rows
                    .into_iter()
                    .filter(|row| row.get("id").is_some_and(|id| ids.contains(id)))
                    .collect();
                if *many {
                    QueryOutput::Rows(found)
                } else {
                    QueryOutput::Row(found.into_iter().next())
                }
            }
            ReadOperation::Count { .. } => QueryOutput::Count(rows.len() as u64),
            ReadOperation::Exists => QueryOutput::Exists(!rows.is_empty()),
            ReadOperation::Paginate { per_page, page, .. } => {
                let total = rows.len() as u64;
                let skip = (page.saturating_sub(1) * per_page) as usize;
                QueryOutput::Page(Page {
                    items: rows.into_iter().skip(skip).take(*per_page as usize).collect(),
                    total,
                    per_page: *per_page,
                    current_page: *page,
                })
            }
            ReadOperation::Pluck { column, key } => QueryOutput::Plucked(
                rows.iter()
                    .map(|row| Plucked {
                        key: key
                            .as_ref()
                            .map(|key| row.get(key).cloned().unwrap_or(Value::Null)),
                        value: row.get(column).cloned().unwrap_or(Value::Null),
                    })
                    .collect(),
            ),
            ReadOperation::Value { column } => QueryOutput::Scalar(
                rows.first()
                    .and_then(|row| row.get(column).cloned())
                    .unwrap_or(Value::Null),
            ),
            ReadOperation::Sum { column }
            | ReadOperation::Avg { column }
            | ReadOperation::Max { column }
            | ReadOperation::Min { column } => {
                let Column::Name(column) = column else {
                    return Err(ExecutorError::unsupported(
                        operation.name(),
                        &query.entity.table,
                    ));
                };
                let numbers: Vec<f64> = rows
                    .iter()
                    .filter_map(|row| row.get(column).and_then(Value::as_f64))
                    .collect();
                QueryOutput::Scalar(aggregate(operation, &numbers))
            }
        };
        Ok(output)
    }

    async fn write(
        &self,
        query: &QueryDescriptor,
        operation: &WriteOperation,
    ) -> Result<u64, ExecutorError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ExecutorError::query("write rejected"));
        }

        let mut tables = self.tables.lock().expect("tables lock");
        let table = tables.entry(query.entity.table.clone()).or_default();
        let affected = match operation {
            WriteOperation::Insert { rows } => {
                for attributes in rows {
                    table.push(Row {
                        attributes: attributes.clone(),
                        pivot: None,
                    });
                }
                rows.len()
            }
            WriteOperation::Update { values } => {
                let mut affected = 0;
                for row in table.iter_mut().filter(|row| matches_all(row, &query.wheres)) {
                    row.attributes.extend(values.clone());
                    affected += 1;
                }
                affected
            }
            WriteOperation::Delete | WriteOperation::ForceDelete => {
                let before = table.len();
                table.retain(|row| !matches_all(row, &query.wheres));
                before - table.len()
            }
            WriteOperation::Increment { column, amount, .. }
            | WriteOperation::Decrement { column, amount, .. } => {
                let sign = if matches!(operation, WriteOperation::Increment { .. }) {
                    1
                } else {
                    -1
                };
                let step = amount.as_i64().unwrap_or(1) * sign;
                let mut affected = 0;
                for row in table.iter_mut().filter(|row| matches_all(row, &query.wheres)) {
                    let current = row.get(column).and_then(Value::as_i64).unwrap_or(0);
                    row.attributes
                        .insert(column.clone(), Value::Int(current + step));
                    affected += 1;
                }
                affected
            }
        };
        Ok(affected as u64)
    }
}

fn aggregate(operation: &ReadOperation, numbers: &[f64]) -> Value {
    if numbers.is_empty() {
        return match operation {
            ReadOperation::Sum { .. } => Value::Int(0),
            _ => Value::Null,
        };
    }
    let result = match operation {
        ReadOperation::Sum { .. } => numbers.iter().sum::<f64>(),
        ReadOperation::Avg { .. } => numbers.iter().sum::<f64>() / numbers.len() as f64,
        ReadOperation::Max { .. } => numbers.iter().copied().fold(f64::MIN, f64::max),
        _ => numbers.iter().copied().fold(f64::MAX, f64::min),
    };
    Value::Float(result)
}

fn matches_all(row: &Row, clauses: &[WhereClause]) -> bool {
    clauses.iter().fold(true, |acc, clause| {
        let matched = matches(row, &clause.predicate);
        match clause.boolean {
            Boolean::And => acc && matched,
            Boolean::Or => acc || matched,
        }
    })
}

fn matches(row: &Row, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Basic {
            column,
            operator,
            value,
        } => {
            let ordering = compare(row.get(column), Some(value));
            match operator.as_str() {
                "=" => ordering == CmpOrdering::Equal,
                "!=" | "<>" => ordering != CmpOrdering::Equal,
                ">" => ordering == CmpOrdering::Greater,
                ">=" => ordering != CmpOrdering::Less,
                "<" => ordering == CmpOrdering::Less,
                "<=" => ordering != CmpOrdering::Greater,
                _ => true,
            }
        }
        Predicate::In {
            column,
            values,
            negated,
        } => {
            let found = row.get(column).is_some_and(|value| values.contains(value));
            found != *negated
        }
        Predicate::Null { column, negated } => {
            let null = row.get(column).is_none_or(Value::is_null);
            null != *negated
        }
        Predicate::Between {
            column,
            low,
            high,
            negated,
        } => {
            let value = row.get(column);
            let inside = compare(value, Some(low)) != CmpOrdering::Less
                && compare(value, Some(high)) != CmpOrdering::Greater;
            inside != *negated
        }
        Predicate::Nested { clauses } => matches_all(row, clauses),
        _ => true,
    }
}

fn compare(left: Option<&Value>, right: Option<&Value>) -> CmpOrdering {
    match (left, right) {
        (Some(left), Some(right)) => match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => left.partial_cmp(&right).unwrap_or(CmpOrdering::Equal),
            _ => left.to_string().cmp(&right.to_string()),
        },
        (None, None) => CmpOrdering::Equal,
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
    }
}

/// A store whose backend is always down.
#[derive(Debug, Default)]
pub struct UnavailableStore {
    pub calls: AtomicUsize,
}

impl UnavailableStore {
    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::unavailable("connection refused"))
    }
}

#[async_trait]
impl CacheStore for UnavailableStore {
    async fn get(
        &self,
        _tags: &TagSet,
        _key: &HashedKey,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.fail()
    }

    async fn put_forever(
        &self,
        _tags: &TagSet,
        _key: &HashedKey,
        _record: StoredRecord,
    ) -> Result<(), StoreError> {
        self.fail()
    }

    async fn forget(&self, _tags: &TagSet, _key: &HashedKey) -> Result<bool, StoreError> {
        self.fail()
    }

    async fn flush(&self, _tags: &TagSet) -> Result<usize, StoreError> {
        self.fail()
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.fail()
    }
}

/// Cooldown storage whose backend is always down.
#[derive(Debug, Default)]
pub struct UnavailableCooldownStore;

#[async_trait]
impl CooldownStore for UnavailableCooldownStore {
    async fn marker(&self, _entity_key: &str) -> Result<Option<CooldownMarker>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn mark(
        &self,
        _entity_key: &str,
        _written_at: OffsetDateTime,
    ) -> Result<CooldownMarker, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
}

/// Maps every key to the same digest, forcing collisions.
#[derive(Debug, Default)]
pub struct ConstantHasher;

impl KeyHasher for ConstantHasher {
    fn hash(&self, _key: &CacheKey) -> HashedKey {
        HashedKey::from_hex("0".repeat(HashedKey::LEN))
    }
}

pub fn shared(executor: RecordingExecutor) -> Arc<RecordingExecutor> {
    Arc::new(executor)
}
