//! SQLite-backed stores. The table store keeps rows as tagged-property JSON;
//! the document store keeps raw document bytes with an etag and revision.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Row, SqlitePool};

use super::{
    matches_key, new_etag, ContinuationToken, SourcePage, SourceStore, StoreError, StoredDocument,
    TargetStore,
};
use crate::record::{PropertyValue, SourceRecord, SystemMetadata};

const TABLE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS table_entities (
    table_name TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    row_key TEXT NOT NULL,
    etag TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    properties TEXT NOT NULL,
    PRIMARY KEY (table_name, partition_key, row_key)
)";

const DOCUMENT_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    container TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    id TEXT NOT NULL,
    etag TEXT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 1,
    body BLOB NOT NULL,
    PRIMARY KEY (container, partition_key, id)
)";

/// Opens a pool on `db`. `create` controls whether a missing file is created.
pub async fn open_pool(db: &Path, create: bool) -> Result<SqlitePool, sqlx::Error> {
    if create {
        if let Some(parent) = db.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let opts = SqliteConnectOptions::new()
        .filename(db)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(std::time::Duration::from_secs(5))
        .log_statements(log::LevelFilter::Off);
    SqlitePoolOptions::new().connect_with(opts).await
}

/// In-memory pool, one connection so every query sees the same database.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
}

#[derive(Debug, Clone)]
pub struct SqliteTableStore {
    pool: SqlitePool,
}

impl SqliteTableStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(TABLE_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Inserts or replaces a row, assigning a fresh etag.
    pub async fn insert(&self, record: &SourceRecord) -> Result<(), StoreError> {
        let properties = serde_json::to_string(&record.properties)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        sqlx::query(
            "INSERT INTO table_entities (table_name, partition_key, row_key, etag, timestamp, properties)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(table_name, partition_key, row_key)
             DO UPDATE SET etag = excluded.etag, timestamp = excluded.timestamp, properties = excluded.properties",
        )
        .bind(&record.table)
        .bind(&record.metadata.partition_key)
        .bind(&record.metadata.row_key)
        .bind(new_etag())
        .bind(record.metadata.timestamp.to_rfc3339())
        .bind(properties)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode_row(table: &str, row: &sqlx::sqlite::SqliteRow) -> Result<SourceRecord, StoreError> {
        let partition_key: String = row.try_get("partition_key")?;
        let row_key: String = row.try_get("row_key")?;
        let raw_properties: String = row.try_get("properties")?;
        let raw_timestamp: String = row.try_get("timestamp")?;

        let properties: BTreeMap<String, PropertyValue> = serde_json::from_str(&raw_properties)
            .map_err(|err| {
                StoreError::Corrupt(format!("{table}/{partition_key}/{row_key}: {err}"))
            })?;
        let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
            .map_err(|err| StoreError::Corrupt(format!("timestamp {raw_timestamp:?}: {err}")))?
            .with_timezone(&Utc);

        Ok(SourceRecord {
            table: table.to_string(),
            metadata: SystemMetadata {
                partition_key,
                row_key,
                etag: row.try_get("etag")?,
                timestamp,
            },
            properties,
        })
    }
}

#[async_trait]
impl SourceStore for SqliteTableStore {
    async fn scan_page(
        &self,
        type_name: &str,
        continuation: Option<&ContinuationToken>,
        page_size: usize,
    ) -> Result<SourcePage, StoreError> {
        let (after_pk, after_rk) = match continuation {
            Some(token) => {
                let (pk, rk) = token.row()?;
                (Some(pk), Some(rk))
            }
            None => (None, None),
        };
        let limit = i64::try_from(page_size.saturating_add(1)).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            "SELECT partition_key, row_key, etag, timestamp, properties
             FROM table_entities
             WHERE table_name = ?1
               AND (?2 IS NULL OR (partition_key, row_key) > (?2, ?3))
             ORDER BY partition_key, row_key
             LIMIT ?4",
        )
        .bind(type_name)
        .bind(after_pk)
        .bind(after_rk)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() > page_size;
        let mut records = Vec::with_capacity(rows.len().min(page_size));
        for row in rows.iter().take(page_size) {
            records.push(Self::decode_row(type_name, row)?);
        }
        let continuation = match (has_more, records.last()) {
            (true, Some(last)) => Some(ContinuationToken::after_row(
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

    /// Filters on the tagged property inside SQLite and decodes only the hit.
    async fn find_by_property(
        &self,
        type_name: &str,
        property: &str,
        value: &str,
        _page_size: usize,
    ) -> Result<Option<SourceRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT t.partition_key AS partition_key, t.row_key AS row_key, t.etag AS etag,
                    t.timestamp AS timestamp, t.properties AS properties
             FROM table_entities AS t, json_each(t.properties) AS p
             WHERE t.table_name = ?1
               AND p.key = ?2
               AND json_extract(p.value, '$.type') IN ('String', 'Guid', 'Int32', 'Int64')
               AND CAST(json_extract(p.value, '$.value') AS TEXT) = ?3
             ORDER BY t.partition_key, t.row_key
             LIMIT 1",
        )
        .bind(type_name)
        .bind(property)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let record = Self::decode_row(type_name, &row)?;
                Ok(matches_key(&record, property, value).then_some(record))
            }
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(DOCUMENT_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn revisions(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<u64, StoreError> {
        let revision: Option<i64> = sqlx::query_scalar(
            "SELECT revision FROM documents WHERE container = ?1 AND partition_key = ?2 AND id = ?3",
        )
        .bind(container)
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(revision.map(|r| r.max(0) as u64).unwrap_or(0))
    }
}

#[async_trait]
impl TargetStore for SqliteDocumentStore {
    async fn read(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query(
            "SELECT etag, body FROM documents WHERE container = ?1 AND partition_key = ?2 AND id = ?3",
        )
        .bind(container)
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(StoredDocument {
                id: id.to_string(),
                partition_key: partition_key.to_string(),
                body: row.try_get("body")?,
                etag: row.try_get("etag")?,
            })),
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<StoredDocument, StoreError> {
        let etag = new_etag();
        let result = sqlx::query(
            "INSERT INTO documents (container, partition_key, id, etag, revision, body)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(container, partition_key, id) DO NOTHING",
        )
        .bind(container)
        .bind(partition_key)
        .bind(id)
        .bind(&etag)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict { id: id.to_string() });
        }
        Ok(StoredDocument {
            id: id.to_string(),
            partition_key: partition_key.to_string(),
            body,
            etag,
        })
    }

    async fn upsert(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<StoredDocument, StoreError> {
        let etag = new_etag();
        sqlx::query(
            "INSERT INTO documents (container, partition_key, id, etag, revision, body)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(container, partition_key, id)
             DO UPDATE SET etag = excluded.etag, body = excluded.body, revision = documents.revision + 1",
        )
        .bind(container)
        .bind(partition_key)
        .bind(id)
        .bind(&etag)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        Ok(StoredDocument {
            id: id.to_string(),
            partition_key: partition_key.to_string(),
            body,
            etag,
        })
    }

    async fn replace(
        &self,
        container: &str,
        partition_key: &str,
        id: &str,
        body: Vec<u8>,
        if_match: &str,
    ) -> Result<StoredDocument, StoreError> {
        let etag = new_etag();
        let result = sqlx::query(
            "UPDATE documents SET etag = ?5, body = ?6, revision = revision + 1
             WHERE container = ?1 AND partition_key = ?2 AND id = ?3 AND etag = ?4",
        )
        .bind(container)
        .bind(partition_key)
        .bind(id)
        .bind(if_match)
        .bind(&etag)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.read(container, partition_key, id).await? {
                Some(_) => Err(StoreError::PreconditionFailed { id: id.to_string() }),
                None => Err(StoreError::NotFound { id: id.to_string() }),
            };
        }
        Ok(StoredDocument {
            id: id.to_string(),
            partition_key: partition_key.to_string(),
            body,
            etag,
        })
    }

    async fn count(&self, container: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE container = ?1")
            .bind(container)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
