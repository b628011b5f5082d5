//! Streams every row of one saga table, following the store's pagination.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::record::SourceRecord;
use crate::store::{ContinuationToken, SourceStore, StoreError};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to read page {page} of {type_name}: {source}")]
    Store {
        type_name: String,
        page: u64,
        #[source]
        source: StoreError,
    },
    #[error("continuation token repeated while scanning {type_name} (page {page})")]
    PaginationLoop { type_name: String, page: u64 },
    #[error("page size must be greater than zero")]
    InvalidPageSize,
}

struct ScanState {
    store: Arc<dyn SourceStore>,
    type_name: String,
    page_size: usize,
    continuation: Option<ContinuationToken>,
    seen_tokens: HashSet<ContinuationToken>,
    seen_rows: HashSet<(String, String)>,
    buffer: VecDeque<SourceRecord>,
    pages: u64,
    exhausted: bool,
}

impl ScanState {
    async fn fetch_next_page(&mut self) -> Result<(), ExtractionError> {
        self.pages += 1;
        let page = self
            .store
            .scan_page(&self.type_name, self.continuation.as_ref(), self.page_size)
            .await
            .map_err(|source| ExtractionError::Store {
                type_name: self.type_name.clone(),
                page: self.pages,
                source,
            })?;
        debug!(
            target: "saga_migrator",
            event = "extract_page",
            type_name = %self.type_name,
            page = self.pages,
            records = page.records.len(),
        );

        self.buffer.extend(page.records);
        match page.continuation {
            Some(token) => {
                if !self.seen_tokens.insert(token.clone()) {
                    return Err(ExtractionError::PaginationLoop {
                        type_name: self.type_name.clone(),
                        page: self.pages,
                    });
                }
                self.continuation = Some(token);
            }
            None => self.exhausted = true,
        }
        Ok(())
    }
}

/// Lazily yields every record of `type_name` exactly once.
///
/// A store error or a pagination loop ends the stream with an error; the
/// caller treats either as fatal. Rows returned twice across pages (the store
/// gives no snapshot isolation) are yielded only the first time.
pub fn extract(
    store: Arc<dyn SourceStore>,
    type_name: impl Into<String>,
    page_size: usize,
) -> BoxStream<'static, Result<SourceRecord, ExtractionError>> {
    if page_size == 0 {
        return stream::once(async { Err(ExtractionError::InvalidPageSize) }).boxed();
    }

    let state = ScanState {
        store,
        type_name: type_name.into(),
        page_size,
        continuation: None,
        seen_tokens: HashSet::new(),
        seen_rows: HashSet::new(),
        buffer: VecDeque::new(),
        pages: 0,
        exhausted: false,
    };

    stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(record) = state.buffer.pop_front() {
                if !state.seen_rows.insert(record.row_identity()) {
                    warn!(
                        target: "saga_migrator",
                        event = "extract_duplicate_row",
                        type_name = %state.type_name,
                        partition_key = %record.metadata.partition_key,
                        row_key = %record.metadata.row_key,
                    );
                    continue;
                }
                return Ok(Some((record, state)));
            }
            if state.exhausted {
                return Ok::<_, ExtractionError>(None);
            }
            state.fetch_next_page().await?;
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PropertyValue;
    use crate::store::{InMemoryTableStore, SourcePage};
    use async_trait::async_trait;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn yields_all_rows_across_pages() {
        let store = Arc::new(InMemoryTableStore::new());
        for i in 0..25 {
            store.insert(
                SourceRecord::new("OrderSaga", format!("p{}", i % 3), format!("r{i:02}"))
                    .with("OrderId", PropertyValue::Int32(i)),
            );
        }
        let records: Vec<_> = extract(store.clone(), "OrderSaga", 4)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 25);
        let unique: HashSet<_> = records.iter().map(|r| r.row_identity()).collect();
        assert_eq!(unique.len(), 25);
    }

    #[tokio::test]
    async fn empty_table_is_an_empty_stream() {
        let store = Arc::new(InMemoryTableStore::new());
        let records: Vec<_> = extract(store, "Missing", 10).try_collect().await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn offline_store_is_an_error() {
        let store = Arc::new(InMemoryTableStore::new());
        store.set_unavailable(true);
        let err = extract(store, "OrderSaga", 10)
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Store { page: 1, .. }));
    }

    struct LoopingStore;

    #[async_trait]
    impl SourceStore for LoopingStore {
        async fn scan_page(
            &self,
            type_name: &str,
            _continuation: Option<&ContinuationToken>,
            _page_size: usize,
        ) -> Result<SourcePage, StoreError> {
            Ok(SourcePage {
                records: vec![SourceRecord::new(type_name, "p", "r")],
                continuation: Some(ContinuationToken::new("same")),
            })
        }
    }

    #[tokio::test]
    async fn repeated_continuation_is_detected() {
        let err = extract(Arc::new(LoopingStore), "OrderSaga", 10)
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::PaginationLoop { page: 2, .. }));
    }

    #[tokio::test]
    async fn zero_page_size_is_rejected() {
        let store = Arc::new(InMemoryTableStore::new());
        let err = extract(store, "OrderSaga", 0)
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidPageSize));
    }
}
