//! Process-local stores. Used by tests and by embedders that already hold the
//! data in memory.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    new_etag, ContinuationToken, SourcePage, SourceStore, StoreError, StoredDocument, TargetStore,
};
use crate::record::SourceRecord;

type RowKey = (String, String);

#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    tables: Mutex<BTreeMap<String, BTreeMap<RowKey, SourceRecord>>>,
    unavailable: AtomicBool,
    pages_served: AtomicU64,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a row, assigning a fresh etag.
    pub fn insert(&self, mut record: SourceRecord) {
        record.metadata.etag = new_etag();
        let mut tables = self.tables.lock().unwrap_or_else(|err| err.into_inner());
        tables
            .entry(record.table.clone())
            .or_default()
            .insert(record.row_identity(), record);
    }

    pub fn remove(&self, table: &str, partition_key: &str, row_key: &str) -> Option<SourceRecord> {
        let mut tables = self.tables.lock().unwrap_or_else(|err| err.into_inner());
        tables
            .get_mut(table)
            .and_then(|rows| rows.remove(&(partition_key.to_string(), row_key.to_string())))
    }

    /// Simulates losing connectivity: every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn pages_served(&self) -> u64 {
        self.pages_served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceStore for InMemoryTableStore {
    async fn scan_page(
        &self,
        type_name: &str,
        continuation: Option<&ContinuationToken>,
        page_size: usize,
    ) -> Result<SourcePage, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("table store offline".into()));
        }
        let after = continuation.map(ContinuationToken::row).transpose()?;
        let tables = self.tables.lock().unwrap_or_else(|err| err.into_inner());
        self.pages_served.fetch_add(1, Ordering::SeqCst);

        let Some(rows) = tables.get(type_name) else {
            return Ok(SourcePage::default());
        };
        let lower = match after {
            Some(row) => Bound::Excluded(row),
            None => Bound::Unbounded,
        };
        let mut iter = rows.range((lower, Bound::Unbounded));
        let records: Vec<SourceRecord> = iter
            .by_ref()
            .take(page_size)
            .map(|(_, record)| record.clone())
            .collect();
        let continuation = match (iter.next(), records.last()) {
            (Some(_), Some(last)) => Some(ContinuationToken::after_row(
                &last.metadata.partition_key,
                &last.metadata.row_key,
            )),
            _ => None,
        };
        Ok(SourcePage {
            records,
            continuation,
        })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    document: StoredDocument,
    revision: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    containers: Mutex<BTreeMap<String, BTreeMap<RowKey, Entry>>>,
    unavailable: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Adds latency to every write so concurrent writers overlap.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock().unwrap_or_else(|err| err.into_inner()) = delay;
    }

    /// How many times the document was written (1 after a single create).
    pub fn revisions(&self, container: &str, partition_key: &str, id: &str) -> u64 {
        let containers = self.containers.lock().unwrap_or_else(|err| err.into_inner());
        containers
            .get(container)
            .and_then(|docs| docs.get(&(partition_key.to_string(), id.to_string())))
            .map(|entry| entry.revision)
            .unwrap_or(0)
    }

    pub fn documents(&self, container: &str) -> Vec<StoredDocument> {
        let containers = self.containers.lock().unwrap_or_else(|err| err.into_inner());
        containers
            .get(container)
            .map(|docs| docs.values().map(|entry| entry.document.clone()).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("document store offline".into()))
        } else {
            Ok(())
        }
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        self.check_available()?;
        let delay = *self.write_delay.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn write(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
        mode: WriteMode<'_>,
    ) -> Result<StoredDocument, StoreError> {
        let mut containers = self.containers.lock().unwrap_or_else(|err| err.into_inner());
        let docs = containers.entry(container.to_string()).or_default();
        let key = (partition_key.to_string(), id.to_string());
        let existing = docs.get(&key);

        let revision = match (mode, existing) {
            (WriteMode::Create, Some(_)) => {
                return Err(StoreError::Conflict { id: id.to_string() })
            }
            (WriteMode::Replace(_), None) => {
                return Err(StoreError::NotFound { id: id.to_string() })
            }
            (WriteMode::Replace(expected), Some(entry)) if entry.document.etag != expected => {
                return Err(StoreError::PreconditionFailed { id: id.to_string() })
            }
            (_, Some(entry)) => entry.revision + 1,
            (_, None) => 1,
        };

        let document = StoredDocument {
            id: id.to_string(),
            partition_key: partition_key.to_string(),
            body,
            etag: new_etag(),
        };
        docs.insert(
            key,
            Entry {
                document: document.clone(),
                revision,
            },
        );
        Ok(document)
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode<'a> {
    Create,
    Upsert,
    Replace(&'a str),
}

#[async_trait]
impl TargetStore for InMemoryDocumentStore {
    async fn read(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        self.check_available()?;
        let containers = self.containers.lock().unwrap_or_else(|err| err.into_inner());
        Ok(containers
            .get(container)
            .and_then(|docs| docs.get(&(partition_key.to_string(), id.to_string())))
            .map(|entry| entry.document.clone()))
    }

    async fn create(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<StoredDocument, StoreError> {
        self.before_write().await?;
        self.write(container, partition_key, id, body, WriteMode::Create)
    }

    async fn upsert(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<StoredDocument, StoreError> {
        self.before_write().await?;
        self.write(container, partition_key, id, body, WriteMode::Upsert)
    }

    async fn replace(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
        if_match: &str,
    ) -> Result<StoredDocument, StoreError> {
        self.before_write().await?;
        self.write(
            container,
            partition_key,
            id,
            body,
            WriteMode::Replace(if_match),
        )
    }

    async fn count(&self, container: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let containers = self.containers.lock().unwrap_or_else(|err| err.into_inner());
        Ok(containers
            .get(container)
            .map(|docs| docs.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PropertyValue;

    fn row(pk: &str, rk: &str) -> SourceRecord {
        SourceRecord::new("OrderSaga", pk, rk).with("OrderId", PropertyValue::String(rk.into()))
    }

    #[tokio::test]
    async fn pages_cover_every_row_once() {
        let store = InMemoryTableStore::new();
        for i in 0..7 {
            store.insert(row("p", &format!("r{i}")));
        }

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = store.scan_page("OrderSaga", token.as_ref(), 3).await.unwrap();
            seen.extend(page.records.iter().map(|r| r.metadata.row_key.clone()));
            match page.continuation {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(store.pages_served(), 3);
    }

    #[tokio::test]
    async fn find_by_property_walks_pages() {
        let store = InMemoryTableStore::new();
        for i in 0..10 {
            store.insert(row("p", &format!("r{i}")));
        }
        let hit = store
            .find_by_property("OrderSaga", "OrderId", "r8", 2)
            .await
            .unwrap()
            .expect("row present");
        assert_eq!(hit.metadata.row_key, "r8");
        assert!(store
            .find_by_property("OrderSaga", "OrderId", "missing", 2)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn create_conflicts_and_replace_checks_etag() {
        let store = InMemoryDocumentStore::new();
        let first = store.create("T", "pk", "id", b"{}".to_vec()).await.unwrap();
        assert!(matches!(
            store.create("T", "pk", "id", b"{}".to_vec()).await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            store.replace("T", "pk", "id", b"{}".to_vec(), "stale").await,
            Err(StoreError::PreconditionFailed { .. })
        ));
        let second = store
            .replace("T", "pk", "id", b"{\"a\":1}".to_vec(), &first.etag)
            .await
            .unwrap();
        assert_ne!(second.etag, first.etag);
        assert_eq!(store.revisions("T", "pk", "id"), 2);
        assert_eq!(store.count("T").await.unwrap(), 1);
    }
}
