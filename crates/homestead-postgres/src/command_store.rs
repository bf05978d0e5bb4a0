use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homestead_domain::command::{CommandEntry, CommandStatus};
use homestead_domain::error::{DomainError, DomainResult};
use homestead_domain::store::CommandStore;
use tokio::sync::OnceCell;
use tokio_postgres::Row;
use tracing::instrument;
use uuid::Uuid;

use crate::client::PostgresClient;

const TABLE: &str = "command_queue";

fn row_to_entry(row: &Row) -> DomainResult<CommandEntry> {
    let status: String = row.get("status");
    let status = CommandStatus::parse(&status)
        .ok_or_else(|| DomainError::Store(anyhow::anyhow!("unknown command status: {status}")))?;
    Ok(CommandEntry {
        id: row.get("id"),
        device_id: row.get("device_id"),
        command: row.get("command"),
        status,
        created_at: row.get("created_at"),
        sent_at: row.get("sent_at"),
        ack_at: row.get("ack_at"),
    })
}

/// Command queue persistence in a single shared table; entries carry
/// their status so a restart never loses an undelivered command.
pub struct PostgresCommandStore {
    client: PostgresClient,
    schema: OnceCell<()>,
}

impl PostgresCommandStore {
    pub fn new(client: PostgresClient) -> Self {
        Self {
            client,
            schema: OnceCell::new(),
        }
    }

    /// Runs the queue DDL once per process. Called lazily by every
    /// operation, and explicitly at startup so schema trouble fails
    /// the boot instead of the first command.
    pub async fn ensure_schema(&self) -> DomainResult<()> {
        self.schema
            .get_or_try_init(|| async {
                let conn = self
                    .client
                    .get_connection()
                    .await
                    .map_err(DomainError::Store)?;
                conn.batch_execute(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {TABLE} (
                        id UUID PRIMARY KEY,
                        device_id TEXT NOT NULL,
                        command JSONB NOT NULL,
                        status TEXT NOT NULL,
                        created_at TIMESTAMPTZ NOT NULL,
                        sent_at TIMESTAMPTZ,
                        ack_at TIMESTAMPTZ
                    );
                    CREATE INDEX IF NOT EXISTS {TABLE}_device_status_idx
                        ON {TABLE} (device_id, status);
                    "#
                ))
                .await
                .map_err(|e| DomainError::Store(e.into()))?;
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CommandStore for PostgresCommandStore {
    #[instrument(skip(self, entry), fields(device_id = %entry.device_id, command_id = %entry.id))]
    async fn insert(&self, entry: CommandEntry) -> DomainResult<()> {
        self.ensure_schema().await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        conn.execute(
            &format!(
                r#"
                INSERT INTO {TABLE} (id, device_id, command, status, created_at, sent_at, ack_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#
            ),
            &[
                &entry.id,
                &entry.device_id,
                &entry.command,
                &entry.status.as_str(),
                &entry.created_at,
                &entry.sent_at,
                &entry.ack_at,
            ],
        )
        .await
        .map_err(|e| DomainError::Store(e.into()))?;
        Ok(())
    }

    async fn pending_for(&self, device_id: &str) -> DomainResult<Vec<CommandEntry>> {
        self.ensure_schema().await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let rows = conn
            .query(
                &format!(
                    r#"
                    SELECT id, device_id, command, status, created_at, sent_at, ack_at
                    FROM {TABLE}
                    WHERE device_id = $1 AND status = $2
                    ORDER BY created_at ASC
                    "#
                ),
                &[&device_id, &CommandStatus::Pending.as_str()],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn mark_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> DomainResult<u64> {
        self.ensure_schema().await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let moved = conn
            .execute(
                &format!(
                    r#"
                    UPDATE {TABLE} SET status = $2, sent_at = $3
                    WHERE id = ANY($1) AND status = $4
                    "#
                ),
                &[
                    &ids,
                    &CommandStatus::Sent.as_str(),
                    &sent_at,
                    &CommandStatus::Pending.as_str(),
                ],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        Ok(moved)
    }

    async fn mark_acknowledged(
        &self,
        ids: &[Uuid],
        ack_at: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>> {
        self.ensure_schema().await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let rows = conn
            .query(
                &format!(
                    r#"
                    UPDATE {TABLE} SET status = $2, ack_at = $3
                    WHERE id = ANY($1)
                    RETURNING id
                    "#
                ),
                &[&ids, &CommandStatus::Acknowledged.as_str(), &ack_at],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn status_of(&self, id: Uuid) -> DomainResult<Option<CommandStatus>> {
        self.ensure_schema().await?;
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::Store)?;
        let row = conn
            .query_opt(
                &format!(r#"SELECT status FROM {TABLE} WHERE id = $1"#),
                &[&id],
            )
            .await
            .map_err(|e| DomainError::Store(e.into()))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let status: String = row.get("status");
                CommandStatus::parse(&status)
                    .map(Some)
                    .ok_or_else(|| {
                        DomainError::Store(anyhow::anyhow!("unknown command status: {status}"))
                    })
            }
        }
    }
}
