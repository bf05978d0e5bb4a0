use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homestead_domain::error::{DomainError, DomainResult};
use homestead_domain::record::{
    collection_name, DeviceStats, RecordId, StoredRecord, TelemetryRecord, UnsetOp,
};
use homestead_domain::store::RecordStore;
use tokio::sync::Mutex;
use tokio_postgres::Row;
use tracing::{debug, instrument};

use crate::client::PostgresClient;

/// Splits a dot-joined key path into the segment array the JSONB
/// path operators take.
fn path_segments(key_path: &str) -> Vec<String> {
    key_path.split('.').map(str::to_owned).collect()
}

fn row_to_record(row: &Row) -> StoredRecord {
    StoredRecord {
        id: row.get("id"),
        received_at: row.get("received_at"),
        doc: row.get("doc"),
    }
}

/// Telemetry store addressing one table per device, named by
/// `collection_name`. Documents live in a JSONB column so leaf unsets
/// are single `#-` updates, with `received_at` beside it for ordering.
pub struct PostgresRecordStore {
    client: PostgresClient,
    /// Collections whose DDL already ran this process.
    ensured: Mutex<HashSet<String>>,
}

impl PostgresRecordStore {
    pub fn new(client: PostgresClient) -> Self {
        Self {
            client,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Creates the device's collection on first contact. Idempotent;
    /// the name is sanitized by `collection_name`, so quoting it is
    /// safe.
    async fn ensure_collection(&self, device_id: &str) -> DomainResult<String> {
        let table = collection_name(device_id);
        {
            let ensured = self.ensured.lock().await;
            if ensured.contains(&table) {
                return Ok(table);
            }
        }

        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                id BIGSERIAL PRIMARY KEY,
                received_at TIMESTAMPTZ NOT NULL,
                doc JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS "{table}_recv_idx"
                ON "{table}" (received_at DESC, id DESC);
            "#
        );
        conn.batch_execute(&ddl)
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        debug!(collection = %table, "collection ready");

        self.ensured.lock().await.insert(table.clone());
        Ok(table)
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self, record), fields(device_id = %device_id))]
    async fn insert(&self, device_id: &str, record: &TelemetryRecord) -> DomainResult<RecordId> {
        let table = self.ensure_collection(device_id).await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let doc = record.doc();
        let row = conn
            .query_one(
                &format!(
                    r#"INSERT INTO "{table}" (received_at, doc) VALUES ($1, $2) RETURNING id"#
                ),
                &[&record.received_at, &doc],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        Ok(row.get("id"))
    }

    async fn recent_with_path(
        &self,
        device_id: &str,
        key_path: &str,
        limit: usize,
    ) -> DomainResult<Vec<StoredRecord>> {
        let table = self.ensure_collection(device_id).await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let segments = path_segments(key_path);
        let rows = conn
            .query(
                &format!(
                    r#"
                    SELECT id, received_at, doc FROM "{table}"
                    WHERE doc #> $1 IS NOT NULL
                    ORDER BY received_at DESC, id DESC
                    LIMIT $2
                    "#
                ),
                &[&segments, &(limit as i64)],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn unset_path(
        &self,
        device_id: &str,
        record_id: RecordId,
        key_path: &str,
    ) -> DomainResult<()> {
        let table = self.ensure_collection(device_id).await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        conn.execute(
            &format!(r#"UPDATE "{table}" SET doc = doc #- $1 WHERE id = $2"#),
            &[&path_segments(key_path), &record_id],
        )
        .await
        .map_err(|e| DomainError::Store(e.into()))?;
        Ok(())
    }

    #[instrument(skip(self, ops), fields(device_id = %device_id, ops = ops.len()))]
    async fn unset_paths(&self, device_id: &str, ops: &[UnsetOp]) -> DomainResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let table = self.ensure_collection(device_id).await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let statement = conn
            .prepare(&format!(
                r#"UPDATE "{table}" SET doc = doc #- $1 WHERE id = $2"#
            ))
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        for op in ops {
            conn.execute(&statement, &[&path_segments(&op.key_path), &op.record_id])
                .await
                .map_err(|e| DomainError::Store(e.into()))?;
        }
        Ok(())
    }

    async fn scan_page(
        &self,
        device_id: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> DomainResult<Vec<StoredRecord>> {
        let table = self.ensure_collection(device_id).await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let cursor = after.unwrap_or(0);
        let rows = conn
            .query(
                &format!(
                    r#"
                    SELECT id, received_at, doc FROM "{table}"
                    WHERE id > $1
                    ORDER BY id ASC
                    LIMIT $2
                    "#
                ),
                &[&cursor, &(limit as i64)],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn stats(&self, device_id: &str) -> DomainResult<DeviceStats> {
        let table = self.ensure_collection(device_id).await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let row = conn
            .query_one(
                &format!(r#"SELECT COUNT(*) AS n, MAX(received_at) AS last FROM "{table}""#),
                &[],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        let count: i64 = row.get("n");
        let last: Option<DateTime<Utc>> = row.get("last");
        Ok(DeviceStats {
            device_id: device_id.to_owned(),
            record_count: count as u64,
            last_received_at: last,
        })
    }
}
