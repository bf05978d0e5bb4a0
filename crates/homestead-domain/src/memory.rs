use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::command::{CommandEntry, CommandStatus};
use crate::error::DomainResult;
use crate::record::{DeviceStats, RecordId, StoredRecord, TelemetryRecord, UnsetOp};
use crate::store::{CommandStore, RecordStore};
use crate::value::{remove_at, value_at};

#[derive(Default)]
struct RecordState {
    next_id: RecordId,
    /// Per device, in arrival order (which is also id order).
    devices: HashMap<String, Vec<StoredRecord>>,
}

/// Record store backed by process memory. Used by tests and by
/// deployments that run without a database.
#[derive(Default)]
pub struct InMemoryRecordStore {
    state: RwLock<RecordState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full history of a device in arrival order, for assertions.
    pub async fn dump(&self, device_id: &str) -> Vec<StoredRecord> {
        self.state
            .read()
            .await
            .devices
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, device_id: &str, record: &TelemetryRecord) -> DomainResult<RecordId> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let id = state.next_id;
        state
            .devices
            .entry(device_id.to_owned())
            .or_default()
            .push(StoredRecord {
                id,
                received_at: record.received_at,
                doc: record.doc(),
            });
        Ok(id)
    }

    async fn recent_with_path(
        &self,
        device_id: &str,
        key_path: &str,
        limit: usize,
    ) -> DomainResult<Vec<StoredRecord>> {
        let state = self.state.read().await;
        let Some(records) = state.devices.get(device_id) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .rev()
            .filter(|r| value_at(&r.doc, key_path).is_some())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn unset_path(
        &self,
        device_id: &str,
        record_id: RecordId,
        key_path: &str,
    ) -> DomainResult<()> {
        let mut state = self.state.write().await;
        if let Some(records) = state.devices.get_mut(device_id) {
            if let Some(record) = records.iter_mut().find(|r| r.id == record_id) {
                remove_at(&mut record.doc, key_path);
            }
        }
        Ok(())
    }

    async fn unset_paths(&self, device_id: &str, ops: &[UnsetOp]) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let Some(records) = state.devices.get_mut(device_id) else {
            return Ok(());
        };
        for op in ops {
            if let Some(record) = records.iter_mut().find(|r| r.id == op.record_id) {
                remove_at(&mut record.doc, &op.key_path);
            }
        }
        Ok(())
    }

    async fn scan_page(
        &self,
        device_id: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> DomainResult<Vec<StoredRecord>> {
        let state = self.state.read().await;
        let Some(records) = state.devices.get(device_id) else {
            return Ok(Vec::new());
        };
        let cursor = after.unwrap_or(0);
        Ok(records
            .iter()
            .filter(|r| r.id > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self, device_id: &str) -> DomainResult<DeviceStats> {
        let state = self.state.read().await;
        let records = state.devices.get(device_id);
        Ok(DeviceStats {
            device_id: device_id.to_owned(),
            record_count: records.map_or(0, |r| r.len() as u64),
            last_received_at: records.and_then(|r| r.last()).map(|r| r.received_at),
        })
    }
}

/// Command store backed by process memory, insertion-ordered.
#[derive(Default)]
pub struct InMemoryCommandStore {
    entries: RwLock<Vec<CommandEntry>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn insert(&self, entry: CommandEntry) -> DomainResult<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn pending_for(&self, device_id: &str) -> DomainResult<Vec<CommandEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.device_id == device_id && e.status == CommandStatus::Pending)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, ids: &[Uuid], sent_at: DateTime<Utc>) -> DomainResult<u64> {
        let mut entries = self.entries.write().await;
        let mut moved = 0;
        for entry in entries.iter_mut() {
            if ids.contains(&entry.id) && entry.status == CommandStatus::Pending {
                entry.status = CommandStatus::Sent;
                entry.sent_at = Some(sent_at);
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn mark_acknowledged(
        &self,
        ids: &[Uuid],
        ack_at: DateTime<Utc>,
    ) -> DomainResult<Vec<Uuid>> {
        let mut entries = self.entries.write().await;
        let mut acked = Vec::new();
        for entry in entries.iter_mut() {
            if ids.contains(&entry.id) {
                entry.status = CommandStatus::Acknowledged;
                entry.ack_at = Some(ack_at);
                acked.push(entry.id);
            }
        }
        Ok(acked)
    }

    async fn status_of(&self, id: Uuid) -> DomainResult<Option<CommandStatus>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.status))
    }
}
