#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::DateTime;
use futures::TryStreamExt;
use uuid::Uuid;

use saga_migrator_lib::extract::extract;
use saga_migrator_lib::record::ExactDecimal;
use saga_migrator_lib::store::{
    memory_pool, open_pool, ContinuationToken, SourceStore, SqliteDocumentStore, SqliteTableStore, StoreError,
    TargetStore,
};
use saga_migrator_lib::{PropertyValue, SourceRecord};

const TYPE: &str = "Shop.Sagas.OrderSaga";

async fn table_store() -> SqliteTableStore {
    let store = SqliteTableStore::new(memory_pool().await.unwrap());
    store.ensure_schema().await.unwrap();
    store
}

async fn document_store() -> SqliteDocumentStore {
    let store = SqliteDocumentStore::new(memory_pool().await.unwrap());
    store.ensure_schema().await.unwrap();
    store
}

#[tokio::test]
async fn typed_properties_survive_storage() {
    let store = table_store().await;
    let when = DateTime::parse_from_rfc3339("2021-03-04T05:06:07.1234567+02:00").unwrap();
    let record = SourceRecord::new(TYPE, "p", "r")
        .with("OrderId", PropertyValue::Guid(Uuid::nil()))
        .with("Amount", PropertyValue::Decimal(ExactDecimal::parse("10.500").unwrap()))
        .with("Payload", PropertyValue::Binary(vec![1, 2, 3]))
        .with("When", PropertyValue::DateTime(when))
        .with("Ratio", PropertyValue::Single(0.1));
    store.insert(&record).await.unwrap();

    let page = store.scan_page(TYPE, None, 10).await.unwrap();
    assert_eq!(page.records.len(), 1);
    assert!(page.continuation.is_none());
    let loaded = &page.records[0];
    assert_eq!(loaded.properties, record.properties);
    assert!(!loaded.metadata.etag.is_empty());
}

#[tokio::test]
async fn scan_pages_through_every_row() {
    let store = table_store().await;
    for i in 0..23 {
        store
            .insert(
                &SourceRecord::new(TYPE, format!("p{}", i % 5), format!("r{i:02}"))
                    .with("OrderId", PropertyValue::Int32(i)),
            )
            .await
            .unwrap();
    }
    store
        .insert(&SourceRecord::new("Other", "p0", "r00").with("OrderId", PropertyValue::Int32(0)))
        .await
        .unwrap();

    let records: Vec<SourceRecord> = extract(Arc::new(store.clone()), TYPE, 4)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(records.len(), 23);
    let rows: HashSet<_> = records.iter().map(SourceRecord::row_identity).collect();
    assert_eq!(rows.len(), 23);

    let found = store
        .find_by_property(TYPE, "OrderId", "17", 4)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.metadata.row_key, "r17");
}

#[tokio::test]
async fn property_lookup_decodes_only_the_matching_row() {
    let pool = memory_pool().await.unwrap();
    let store = SqliteTableStore::new(pool.clone());
    store.ensure_schema().await.unwrap();
    for i in 0..30 {
        store
            .insert(
                &SourceRecord::new(TYPE, "p", format!("r{i:02}"))
                    .with("OrderId", PropertyValue::Int64(1_000_000_000_000 + i))
                    .with("Flag", PropertyValue::Boolean(true)),
            )
            .await
            .unwrap();
    }
    let guid = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
    store
        .insert(&SourceRecord::new(TYPE, "q", "guid").with("Reference", PropertyValue::Guid(guid)))
        .await
        .unwrap();
    store
        .insert(
            &SourceRecord::new(TYPE, "q", "name")
                .with("Customer Name", PropertyValue::String("Ada \"A\" Lovelace".into())),
        )
        .await
        .unwrap();

    // A walk over the table would trip on this row before reaching r17.
    sqlx::query("UPDATE table_entities SET timestamp = 'not a timestamp' WHERE row_key = 'r00'")
        .execute(&pool)
        .await
        .unwrap();
    let err = store.scan_page(TYPE, None, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));

    let found = store
        .find_by_property(TYPE, "OrderId", "1000000000017", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.metadata.row_key, "r17");

    let by_guid = store
        .find_by_property(TYPE, "Reference", "6f9619ff-8b86-d011-b42d-00c04fc964ff", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_guid.metadata.row_key, "guid");

    let by_name = store
        .find_by_property(TYPE, "Customer Name", "Ada \"A\" Lovelace", 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_name.metadata.row_key, "name");

    assert!(store
        .find_by_property(TYPE, "Flag", "1", 1)
        .await
        .unwrap()
        .is_none());
    assert!(store
        .find_by_property(TYPE, "OrderId", "42", 1)
        .await
        .unwrap()
        .is_none());
    assert!(store
        .find_by_property("Other", "OrderId", "1000000000017", 1)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn open_pool_creates_missing_parents_and_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a").join("b").join("target.db");
    let pool = open_pool(&nested, true).await.unwrap();
    pool.close().await;
    assert!(nested.exists());

    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file").unwrap();
    let err = open_pool(&blocker.join("target.db"), true).await.unwrap_err();
    assert!(matches!(err, sqlx::Error::Io(_)), "{err:?}");
}

#[tokio::test]
async fn malformed_continuation_is_rejected() {
    let store = table_store().await;
    let err = store
        .scan_page(TYPE, Some(&ContinuationToken::new("garbage")), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidContinuation(_)));
}

#[tokio::test]
async fn document_store_write_modes() {
    let store = document_store().await;
    let created = store.create(TYPE, "id-1", "id-1", b"{\"v\":1}".to_vec()).await.unwrap();

    let err = store
        .create(TYPE, "id-1", "id-1", b"{\"v\":2}".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));

    let replaced = store
        .replace(TYPE, "id-1", "id-1", b"{\"v\":3}".to_vec(), &created.etag)
        .await
        .unwrap();
    assert_ne!(replaced.etag, created.etag);

    let err = store
        .replace(TYPE, "id-1", "id-1", b"{\"v\":4}".to_vec(), &created.etag)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::PreconditionFailed { .. }));

    let err = store
        .replace(TYPE, "missing", "missing", b"{}".to_vec(), "etag")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    store.upsert(TYPE, "id-1", "id-1", b"{\"v\":5}".to_vec()).await.unwrap();
    let current = store.read(TYPE, "id-1", "id-1").await.unwrap().unwrap();
    assert_eq!(current.body, b"{\"v\":5}".to_vec());
    assert_eq!(store.revisions(TYPE, "id-1", "id-1").await.unwrap(), 3);
    assert_eq!(store.count(TYPE).await.unwrap(), 1);
    assert_eq!(store.count("Other").await.unwrap(), 0);
}
