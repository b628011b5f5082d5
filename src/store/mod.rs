//! Storage seams: the legacy table store is read through `SourceStore`, the
//! document store is written through `TargetStore`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::SourceRecord;

pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryDocumentStore, InMemoryTableStore};
pub use sqlite::{memory_pool, open_pool, SqliteDocumentStore, SqliteTableStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("document {id} already exists")]
    Conflict { id: String },
    #[error("document {id} was modified (etag mismatch)")]
    PreconditionFailed { id: String },
    #[error("document {id} not found")]
    NotFound { id: String },
    #[error("invalid continuation token: {0}")]
    InvalidContinuation(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "UNAVAILABLE",
            StoreError::Conflict { .. } => "CONFLICT",
            StoreError::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::InvalidContinuation(_) => "INVALID_CONTINUATION",
            StoreError::Corrupt(_) => "CORRUPT",
            StoreError::Database(_) => "DATABASE",
        }
    }
}

/// Opaque resume point handed out by `SourceStore::scan_page`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Token resuming strictly after the given row.
    pub(crate) fn after_row(partition_key: &str, row_key: &str) -> Self {
        Self(serde_json::json!([partition_key, row_key]).to_string())
    }

    pub(crate) fn row(&self) -> Result<(String, String), StoreError> {
        serde_json::from_str(&self.0)
            .map_err(|_| StoreError::InvalidContinuation(self.0.clone()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<SourceRecord>,
    pub continuation: Option<ContinuationToken>,
}

/// Read access to the legacy table store. One table per saga type.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn scan_page(
        &self,
        type_name: &str,
        continuation: Option<&ContinuationToken>,
        page_size: usize,
    ) -> Result<SourcePage, StoreError>;

    /// First record whose `property` renders to `value` as a key.
    ///
    /// The default walks the whole table page by page and decodes every row,
    /// so a miss costs a full scan. Stores that can filter on a property
    /// server-side should override it.
    async fn find_by_property(
        &self,
        type_name: &str,
        property: &str,
        value: &str,
        page_size: usize,
    ) -> Result<Option<SourceRecord>, StoreError> {
        scan_for_property(self, type_name, property, value, page_size).await
    }
}

pub(crate) fn matches_key(record: &SourceRecord, property: &str, value: &str) -> bool {
    record
        .get(property)
        .and_then(|candidate| candidate.key_text())
        .is_some_and(|text| text == value)
}

async fn scan_for_property<S: SourceStore + ?Sized>(
    store: &S,
    type_name: &str,
    property: &str,
    value: &str,
    page_size: usize,
) -> Result<Option<SourceRecord>, StoreError> {
    let mut continuation: Option<ContinuationToken> = None;
    loop {
        let page = store
            .scan_page(type_name, continuation.as_ref(), page_size)
            .await?;
        let hit = page
            .records
            .into_iter()
            .find(|record| matches_key(record, property, value));
        if hit.is_some() {
            return Ok(hit);
        }
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(None),
        }
    }
}

/// A document as held by the target store, with its store-assigned etag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub id: String,
    pub partition_key: String,
    pub body: Vec<u8>,
    pub etag: String,
}

/// Write access to the document store. `container` is the saga type name.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn read(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Inserts only when absent; `StoreError::Conflict` otherwise.
    async fn create(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<StoredDocument, StoreError>;

    async fn upsert(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<StoredDocument, StoreError>;

    /// Replaces only when the stored etag equals `if_match`.
    async fn replace(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
        if_match: &str,
    ) -> Result<StoredDocument, StoreError>;

    async fn count(&self, container: &str) -> Result<u64, StoreError>;
}

pub(crate) fn new_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_round_trips_row_identity() {
        let token = ContinuationToken::after_row("p\"1", "r,2");
        assert_eq!(token.row().unwrap(), ("p\"1".to_string(), "r,2".to_string()));
    }

    #[test]
    fn garbage_continuation_is_rejected() {
        let token = ContinuationToken::new("not json");
        assert!(matches!(
            token.row(),
            Err(StoreError::InvalidContinuation(_))
        ));
    }
}
