use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::command::{CommandEntry, CommandStatus};
use crate::error::DomainResult;
use crate::record::{DeviceStats, RecordId, StoredRecord, TelemetryRecord, UnsetOp};

/// Persistence seam for device telemetry collections.
///
/// Implementations address one collection per device and assign
/// `RecordId`s that grow in arrival order, so id order and
/// `received_at` order coincide within a device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, device_id: &str, record: &TelemetryRecord) -> DomainResult<RecordId>;

    /// Newest-first records whose document still contains `key_path`,
    /// at most `limit` of them.
    async fn recent_with_path(
        &self,
        device_id: &str,
        key_path: &str,
        limit: usize,
    ) -> DomainResult<Vec<StoredRecord>>;

    /// Removes one leaf from one record. Unknown ids and already
    /// absent paths are a no-op.
    async fn unset_path(
        &self,
        device_id: &str,
        record_id: RecordId,
        key_path: &str,
    ) -> DomainResult<()>;

    /// Bulk form of `unset_path`, used by batch compaction flushes.
    async fn unset_paths(&self, device_id: &str, ops: &[UnsetOp]) -> DomainResult<()>;

    /// One ascending page of a device's history, starting after the
    /// given cursor id. An empty page means the scan is done.
    async fn scan_page(
        &self,
        device_id: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> DomainResult<Vec<StoredRecord>>;

    async fn stats(&self, device_id: &str) -> DomainResult<DeviceStats>;
}

/// Persistence seam for the per-device command queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn insert(&self, entry: CommandEntry) -> DomainResult<()>;

    /// Pending entries for a device, oldest first.
    async fn pending_for(&self, device_id: &str) -> DomainResult<Vec<CommandEntry>>;

    /// Transitions pending entries to sent. Entries already past
    /// pending are left alone; returns how many actually moved.
    async fn mark_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> DomainResult<u64>;

    /// Transitions entries to acknowledged regardless of their current
    /// status, returning the ids that matched an existing entry.
    async fn mark_acknowledged(
        &self,
        ids: &[Uuid],
        ack_at: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>>;

    async fn status_of(&self, id: Uuid) -> DomainResult<Option<CommandStatus>>;
}

/// Best-effort immediate command delivery, e.g. an MQTT publish to a
/// connected device. `Ok(false)` means "not deliverable right now";
/// the queue keeps the entry pending and retries on the next drain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandPusher: Send + Sync {
    async fn push(&self, device_id: &str, payload: &Value) -> DomainResult<bool>;
}

/// Fire-and-forget fan-out of ingestion events to live observers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn broadcast(&self, event: crate::broadcast::BroadcastEvent) -> DomainResult<()>;
}
