mod support;

use std::sync::Arc;
use std::time::Duration;

use querycache::application::{ExecutorError, StaticRelationGraph};
use bytes::Bytes;
use querycache::cache::{
    CacheConfig, CacheState, CacheStore, CachingDecorator, CooldownTracker,
    InMemoryCooldownStore, ManualClock, MemoryStore, StoredRecord,
};
use querycache::domain::{
    ConnectionId, Direction, Expression, Predicate, QueryDescriptor, ReadOperation, Row, Value,
    WhereClause,
};

use support::{
    ConstantHasher, RecordingExecutor, UnavailableCooldownStore, UnavailableStore, authors,
    book, books, shared, stores, values,
};

struct Harness {
    executor: Arc<RecordingExecutor>,
    store: Arc<MemoryStore>,
    cache: Arc<CachingDecorator>,
}

fn harness_with(
    config: CacheConfig,
    customize: impl FnOnce(CachingDecorator) -> CachingDecorator,
) -> Harness {
    let executor = shared(RecordingExecutor::seeded());
    let store = Arc::new(MemoryStore::new(&config));
    let decorator = CachingDecorator::new(executor.clone(), &config).with_store(store.clone());
    Harness {
        executor,
        store,
        cache: Arc::new(customize(decorator)),
    }
}

fn harness_over(executor: RecordingExecutor) -> Harness {
    let executor = shared(executor);
    let store = Arc::new(MemoryStore::default());
    let decorator = CachingDecorator::new(executor.clone(), &CacheConfig::default())
        .with_store(store.clone());
    Harness {
        executor,
        store,
        cache: Arc::new(decorator),
    }
}

fn harness() -> Harness {
    harness_with(CacheConfig::default(), |decorator| decorator)
}

fn author_books_query(connection: ConnectionId) -> QueryDescriptor {
    let mut query = QueryDescriptor::new(connection, books());
    query.wheres.push(WhereClause::and(Predicate::In {
        column: "author_id".to_string(),
        values: [1, 2, 3, 4].into_iter().map(Value::from).collect(),
        negated: false,
    }));
    query
}

#[tokio::test]
async fn repeated_reads_are_served_from_cache() {
    let h = harness();

    let first = h
        .cache
        .query(books())
        .where_in("author_id", [1, 2, 3, 4])
        .get()
        .await
        .expect("read should succeed");
    let second = h
        .cache
        .query(books())
        .where_in("author_id", [1, 2, 3, 4])
        .get()
        .await
        .expect("read should succeed");

    assert_eq!(first.len(), 32);
    assert_eq!(first, second);
    assert_eq!(h.executor.reads(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn key_for_where_in_is_readable_and_hashed() {
    let h = harness();
    let lookup = h
        .cache
        .lookup(
            &author_books_query(ConnectionId::default()),
            &ReadOperation::get(),
        )
        .expect("lookup should derive");

    assert_eq!(
        lookup.key.as_str(),
        "querycache:default:main:books:acmelibrarybook-author_id_in_1_2_3_4"
    );
    assert_eq!(lookup.hashed_key.as_str().len(), 40);
    assert!(
        lookup
            .hashed_key
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    );
    assert!(
        lookup
            .tags
            .contains("querycache:default:main:acmelibrarybook")
    );

    let again = h
        .cache
        .lookup(
            &author_books_query(ConnectionId::default()),
            &ReadOperation::get(),
        )
        .expect("lookup should derive");
    assert_eq!(again.key, lookup.key);
    assert_eq!(again.hashed_key, lookup.hashed_key);
    assert_eq!(again.tags, lookup.tags);
}

#[tokio::test]
async fn writes_flush_only_the_written_entity() {
    let h = harness();
    let read = || h.cache.query(books()).where_in("author_id", [1, 2, 3, 4]);

    read().get().await.expect("read should succeed");
    assert_eq!(h.executor.reads(), 1);

    h.cache
        .query(authors())
        .where_eq("id", 1)
        .update(values(&[("name", Value::from("Renamed"))]))
        .await
        .expect("author update should succeed");
    read().get().await.expect("read should succeed");
    assert_eq!(h.executor.reads(), 1, "author write must not evict books");

    h.cache
        .query(books())
        .insert(vec![values(&[
            ("id", Value::from(41)),
            ("author_id", Value::from(1)),
        ])])
        .await
        .expect("book insert should succeed");
    let rows = read().get().await.expect("read should succeed");
    assert_eq!(h.executor.reads(), 2, "book write must evict books");
    assert_eq!(rows.len(), 33);
}

#[tokio::test]
async fn paginated_reads_are_cached_per_page() {
    let h = harness();

    let page = h
        .cache
        .query(books())
        .paginate(15, 2)
        .await
        .expect("page should load");
    let again = h
        .cache
        .query(books())
        .paginate(15, 2)
        .await
        .expect("page should load");

    assert_eq!(page.items.len(), 15);
    assert_eq!(page.current_page, 2);
    assert_eq!(page.total, 40);
    assert_eq!(page, again);
    assert_eq!(h.executor.reads(), 1);

    let lookup = h
        .cache
        .lookup(
            h.cache.query(books()).descriptor(),
            &ReadOperation::paginate(15, 2),
        )
        .expect("lookup should derive");
    assert!(lookup.key.as_str().ends_with("-paginate_by_15_page_2"));

    h.cache
        .query(books())
        .paginate(15, 3)
        .await
        .expect("page should load");
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn reads_after_writes_observe_the_write() {
    let h = harness();

    assert_eq!(h.cache.query(books()).count().await.expect("count"), 40);
    h.cache
        .query(books())
        .insert(vec![book(41, 2, "Late Arrival").attributes])
        .await
        .expect("insert should succeed");
    assert_eq!(h.cache.query(books()).count().await.expect("count"), 41);

    h.cache
        .query(books())
        .where_eq("author_id", 2)
        .delete()
        .await
        .expect("delete should succeed");
    assert_eq!(h.cache.query(books()).count().await.expect("count"), 32);
    assert_eq!(h.executor.reads(), 3);
    assert_eq!(h.executor.writes(), 2);
}

#[tokio::test]
async fn operations_over_the_same_clauses_are_cached_separately() {
    let h = harness();
    let query = || h.cache.query(books()).where_eq("author_id", 3);

    let count = query().count().await.expect("count");
    let exists = query().exists().await.expect("exists");
    let sum = query().sum("price").await.expect("sum");
    let first = query().first().await.expect("first");
    let plucked = query().pluck("title", None).await.expect("pluck");
    assert_eq!(h.executor.reads(), 5);

    assert_eq!(query().count().await.expect("count"), count);
    assert_eq!(query().exists().await.expect("exists"), exists);
    assert_eq!(query().sum("price").await.expect("sum"), sum);
    assert_eq!(query().first().await.expect("first"), first);
    assert_eq!(query().pluck("title", None).await.expect("pluck"), plucked);
    assert_eq!(h.executor.reads(), 5);

    assert_eq!(count, 8);
    assert!(exists);
    assert_eq!(plucked.len(), 8);
}

#[tokio::test]
async fn find_distinguishes_single_and_list_lookups() {
    let h = harness();

    let one = h.cache.query(books()).find(7).await.expect("find");
    let many = h
        .cache
        .query(books())
        .find_many([7, 8])
        .await
        .expect("find many");

    assert_eq!(one.and_then(|row| row.get("id").cloned()), Some(Value::Int(7)));
    assert_eq!(many.len(), 2);
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn eager_loaded_relations_are_tagged() {
    let graph = StaticRelationGraph::new().with(&books(), "author", authors());
    let h = harness_with(CacheConfig::default(), |decorator| {
        decorator.with_relations(Arc::new(graph))
    });
    let read = || h.cache.query(books()).with("author");

    read().get().await.expect("read should succeed");
    read().get().await.expect("read should succeed");
    assert_eq!(h.executor.reads(), 1);

    h.cache
        .query(authors())
        .where_eq("id", 2)
        .update(values(&[("name", Value::from("Changed"))]))
        .await
        .expect("update should succeed");
    read().get().await.expect("read should succeed");
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn joins_and_subqueries_are_tagged() {
    let h = harness();
    let subquery = h.cache.query(authors()).select(["id"]).into_descriptor();
    let joined = || h.cache.query(books()).join(stores());
    let nested = || h.cache.query(books()).where_in_sub("author_id", subquery.clone());

    joined().get().await.expect("joined read");
    nested().get().await.expect("nested read");
    assert_eq!(h.executor.reads(), 2);

    h.cache
        .query(stores())
        .insert(vec![values(&[("id", Value::from(1))])])
        .await
        .expect("insert store");
    joined().get().await.expect("joined read");
    nested().get().await.expect("nested read");
    assert_eq!(h.executor.reads(), 3, "store write evicts only the join");

    h.cache
        .query(authors())
        .where_eq("id", 9)
        .delete()
        .await
        .expect("delete author");
    joined().get().await.expect("joined read");
    nested().get().await.expect("nested read");
    assert_eq!(h.executor.reads(), 4, "author write evicts only the subquery");
}

#[tokio::test]
async fn colliding_digests_never_return_another_querys_result() {
    let h = harness_with(CacheConfig::default(), |decorator| {
        decorator.with_hasher(Arc::new(ConstantHasher))
    });
    let by_author = |author: i64| h.cache.query(books()).where_eq("author_id", author);

    let first = by_author(1).get().await.expect("read");
    let second = by_author(2).get().await.expect("read");
    assert_eq!(h.executor.reads(), 2);
    assert!(
        second
            .iter()
            .all(|row| row.get("author_id") == Some(&Value::Int(2)))
    );

    let first_again = by_author(1).get().await.expect("read");
    assert_eq!(first_again, first);
    assert_eq!(h.executor.reads(), 3);

    by_author(1).get().await.expect("read");
    assert_eq!(h.executor.reads(), 3);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn empty_where_in_lists_are_cached_per_column() {
    let h = harness();
    let none: Vec<i64> = Vec::new();

    let by_author = h.cache.query(books()).where_in("author_id", none.clone());
    let by_id = h.cache.query(books()).where_in("id", none);

    let author_key = h
        .cache
        .lookup(by_author.descriptor(), &ReadOperation::get())
        .expect("lookup");
    let id_key = h
        .cache
        .lookup(by_id.descriptor(), &ReadOperation::get())
        .expect("lookup");
    assert!(author_key.key.as_str().ends_with("-author_id_in_"));
    assert_ne!(author_key.key, id_key.key);

    assert!(by_author.get().await.expect("read").is_empty());
    assert!(by_author.get().await.expect("read").is_empty());
    assert!(by_id.get().await.expect("read").is_empty());
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn random_order_bypasses_the_cache() {
    let h = harness();

    let query = h.cache.query(books()).limit(3).in_random_order(None);
    assert_eq!(query.state(), CacheState::Bypass);
    query.get().await.expect("read");
    query.get().await.expect("read");

    assert_eq!(h.executor.reads(), 2);
    assert!(h.store.is_empty());

    let ordered = h
        .cache
        .query(books())
        .order_by("price", Direction::Desc)
        .limit(3);
    assert_eq!(ordered.state(), CacheState::Cachable);
    let rows = ordered.get().await.expect("read");
    assert_eq!(rows[0].get("id"), Some(&Value::Int(40)));
}

#[tokio::test]
async fn disabled_cache_delegates_every_read() {
    let h = harness_with(
        CacheConfig {
            enabled: false,
            ..Default::default()
        },
        |decorator| decorator,
    );

    h.cache.query(books()).count().await.expect("count");
    h.cache.query(books()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 2);
    assert!(h.store.is_empty());

    h.cache.set_enabled(true);
    h.cache.query(books()).count().await.expect("count");
    h.cache.query(books()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 3);
}

#[tokio::test]
async fn disable_cache_on_one_query_leaves_others_cached() {
    let h = harness();

    h.cache
        .query(books())
        .disable_cache()
        .count()
        .await
        .expect("count");
    assert!(h.store.is_empty());

    h.cache.query(books()).count().await.expect("count");
    h.cache.query(books()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn executor_errors_propagate_and_are_never_cached() {
    let h = harness();

    h.executor.fail_reads(true);
    let err = h
        .cache
        .query(books())
        .get()
        .await
        .expect_err("read should fail");
    assert_eq!(err, ExecutorError::Timeout);
    assert!(h.store.is_empty());

    h.executor.fail_reads(false);
    let rows = h.cache.query(books()).get().await.expect("read");
    assert_eq!(rows.len(), 40);
    h.cache.query(books()).get().await.expect("read");
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn failed_writes_still_invalidate_and_propagate() {
    let h = harness();

    h.cache.query(books()).count().await.expect("count");
    h.executor.fail_writes(true);
    let err = h
        .cache
        .query(books())
        .delete()
        .await
        .expect_err("write should fail");
    assert_eq!(err, ExecutorError::Query("write rejected".to_string()));

    h.cache.query(books()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn pivot_parents_are_stripped_before_storing() {
    let h = harness();
    h.executor.attach_pivot_parents(true);

    let fresh = h.cache.query(books()).limit(2).get().await.expect("read");
    let cached = h.cache.query(books()).limit(2).get().await.expect("read");

    assert_eq!(h.executor.reads(), 1);
    for rows in [&fresh, &cached] {
        for row in rows.iter() {
            let pivot = row.pivot.as_ref().expect("pivot data is kept");
            assert_eq!(pivot.table, "book_store");
            assert!(pivot.parent.is_none());
        }
    }
}

#[tokio::test]
async fn unavailable_store_degrades_to_the_executor() {
    let store = Arc::new(UnavailableStore::default());
    let executor = shared(RecordingExecutor::seeded());
    let cache = Arc::new(
        CachingDecorator::new(executor.clone(), &CacheConfig::default())
            .with_store(store.clone()),
    );

    assert_eq!(cache.query(books()).count().await.expect("count"), 40);
    assert_eq!(cache.query(books()).count().await.expect("count"), 40);
    assert_eq!(executor.reads(), 2);

    let affected = cache
        .query(books())
        .where_eq("id", 1)
        .delete()
        .await
        .expect("write goes ahead without the store");
    assert_eq!(affected, 1);

    assert!(cache.flush_all().await.is_err());
}

#[tokio::test]
async fn unavailable_cooldown_store_degrades_to_the_executor() {
    let executor = shared(RecordingExecutor::seeded());
    let cooldown = Arc::new(CooldownTracker::new(
        Arc::new(UnavailableCooldownStore),
        Arc::new(ManualClock::default()),
        Duration::from_secs(1),
    ));
    let cache = Arc::new(
        CachingDecorator::new(executor.clone(), &CacheConfig::default()).with_cooldown(cooldown),
    );

    cache.query(books()).count().await.expect("count");
    cache.query(books()).count().await.expect("count");
    assert_eq!(executor.reads(), 2);

    cache
        .query(books())
        .where_eq("id", 1)
        .delete()
        .await
        .expect("write goes ahead without cooldown markers");
}

#[tokio::test]
async fn cooldown_refreshes_records_until_the_window_elapses() {
    let clock = Arc::new(ManualClock::default());
    let cooldown = Arc::new(CooldownTracker::new(
        Arc::new(InMemoryCooldownStore::new()),
        clock.clone(),
        Duration::from_secs(5),
    ));
    let h = harness_with(CacheConfig::default(), |decorator| {
        decorator.with_cooldown(cooldown)
    });
    let count = || h.cache.query(books());

    count().count().await.expect("count");
    count().count().await.expect("count");
    assert_eq!(h.executor.reads(), 1);

    h.cache
        .query(books())
        .where_eq("id", 1)
        .delete()
        .await
        .expect("delete");

    assert_eq!(count().count().await.expect("count"), 39);
    count().count().await.expect("count");
    assert_eq!(h.executor.reads(), 3, "reads inside the window skip the cache");

    clock.advance(Duration::from_secs(6));
    assert_eq!(count().count().await.expect("count"), 39);
    assert_eq!(h.executor.reads(), 3, "record refreshed during cooldown is trusted");
}

#[tokio::test]
async fn entity_cooldown_overrides_the_default_window() {
    let clock = Arc::new(ManualClock::default());
    let cooldown = Arc::new(CooldownTracker::new(
        Arc::new(InMemoryCooldownStore::new()),
        clock.clone(),
        Duration::from_secs(60),
    ));
    let h = harness_with(CacheConfig::default(), |decorator| {
        decorator.with_cooldown(cooldown)
    });
    let quick_books = || books().with_cooldown(100);

    h.cache
        .query(quick_books())
        .where_eq("id", 1)
        .delete()
        .await
        .expect("delete");
    clock.advance(Duration::from_millis(150));

    h.cache.query(quick_books()).count().await.expect("count");
    h.cache.query(quick_books()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 1);
}

#[tokio::test]
async fn declared_dependencies_follow_writes() {
    let h = harness();
    h.cache.cooldown().declare_dependency(books(), &authors());

    h.cache.query(books()).count().await.expect("count");
    h.cache.query(books()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 1);

    h.cache
        .query(authors())
        .where_eq("id", 5)
        .update(values(&[("name", Value::from("Someone"))]))
        .await
        .expect("update");
    h.cache.query(books()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 2);
}

#[tokio::test]
async fn manual_flushes_clear_records() {
    let h = harness();

    h.cache.query(books()).count().await.expect("count");
    h.cache.query(authors()).count().await.expect("count");
    assert_eq!(h.store.len(), 2);

    let removed = h.cache.flush_entity(&books()).await.expect("flush");
    assert_eq!(removed, 1);
    assert_eq!(h.store.len(), 1);

    h.cache.flush_all().await.expect("flush all");
    assert!(h.store.is_empty());

    h.cache.query(authors()).count().await.expect("count");
    assert_eq!(h.executor.reads(), 3);
}

#[tokio::test]
async fn connections_partition_keys_and_tags() {
    let h = harness();
    let reporting = ConnectionId::new("reporting", "warehouse");

    let default_lookup = h
        .cache
        .lookup(
            &author_books_query(ConnectionId::default()),
            &ReadOperation::get(),
        )
        .expect("lookup");
    let reporting_lookup = h
        .cache
        .lookup(&author_books_query(reporting.clone()), &ReadOperation::get())
        .expect("lookup");

    assert_ne!(default_lookup.key, reporting_lookup.key);
    assert!(
        reporting_lookup
            .tags
            .contains("querycache:reporting:warehouse:acmelibrarybook")
    );

    h.cache
        .read(
            &author_books_query(reporting.clone()),
            &ReadOperation::get(),
            CacheState::Cachable,
        )
        .await
        .expect("read");
    h.cache
        .flush_entity(&books())
        .await
        .expect("flush default connection");
    h.cache
        .read(
            &author_books_query(reporting.clone()),
            &ReadOperation::get(),
            CacheState::Cachable,
        )
        .await
        .expect("read");
    assert_eq!(h.executor.reads(), 1);

    h.cache
        .flush_entity_on(&reporting, &books())
        .await
        .expect("flush reporting connection");
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn text_literals_never_share_a_key_with_other_lists() {
    let h = harness_over(RecordingExecutor::new().with_table(
        "books",
        vec![
            Row::new().with("id", 1).with("code", ""),
            Row::new().with("id", 2).with("code", "1"),
            Row::new().with("id", 3).with("code", "2"),
            Row::new().with("id", 4).with("code", "1_2"),
        ],
    ));
    let by_codes = |codes: Vec<Value>| h.cache.query(books()).where_in("code", codes);

    assert!(by_codes(vec![]).get().await.expect("read").is_empty());
    let blank = by_codes(vec![Value::from("")]).get().await.expect("read");
    assert_eq!(blank.len(), 1);

    let joined = by_codes(vec![Value::from("1_2")]).get().await.expect("read");
    let split = by_codes(vec![Value::from("1"), Value::from("2")])
        .get()
        .await
        .expect("read");
    assert_eq!(joined.len(), 1);
    assert_eq!(split.len(), 2);

    assert_eq!(h.executor.reads(), 4);
    assert_eq!(h.store.len(), 4);
}

#[tokio::test]
async fn underivable_keys_fall_back_to_the_executor() {
    let h = harness();
    let query = || {
        h.cache
            .query(books())
            .order_by_raw(Expression::new("price; drop table books"))
    };

    assert!(
        h.cache
            .lookup(query().descriptor(), &ReadOperation::get())
            .is_err()
    );
    assert_eq!(query().get().await.expect("read").len(), 40);
    assert_eq!(query().get().await.expect("read").len(), 40);

    assert_eq!(h.executor.reads(), 2);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn corrupt_payloads_are_recomputed() {
    let h = harness();
    let query = h.cache.query(books()).where_eq("author_id", 1);
    let lookup = h
        .cache
        .lookup(
            query.descriptor(),
            &ReadOperation::Count {
                columns: vec!["*".to_string()],
            },
        )
        .expect("lookup");
    h.store
        .put_forever(
            &lookup.tags,
            &lookup.hashed_key,
            StoredRecord {
                key: lookup.key.as_str().to_string(),
                payload: Bytes::from_static(b"not json"),
            },
        )
        .await
        .expect("seed record");

    assert_eq!(query.count().await.expect("count"), 8);
    assert_eq!(h.executor.reads(), 1);

    assert_eq!(query.count().await.expect("count"), 8);
    assert_eq!(h.executor.reads(), 1, "recomputed record is stored");
}

#[tokio::test]
async fn non_finite_results_are_returned_but_not_stored() {
    let h = harness_over(RecordingExecutor::new().with_table(
        "books",
        vec![Row::new().with("id", 1).with("rating", f64::NAN)],
    ));
    for _ in 0..2 {
        let value = h
            .cache
            .query(books())
            .value("rating")
            .await
            .expect("value");
        assert!(value.as_f64().is_some_and(f64::is_nan));
    }
    assert_eq!(h.executor.reads(), 2);
    assert!(h.store.is_empty());
}
