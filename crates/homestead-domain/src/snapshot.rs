use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::protocol::Protocol;

/// The single most recent raw payload seen from a device, overwritten
/// on every ingestion. Diagnostic surface, and the record of which
/// transport the device last used.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSnapshot {
    pub payload: Value,
    pub protocol: Protocol,
    pub received_at: DateTime<Utc>,
}

/// In-memory keep-latest cache of raw payloads, keyed by device.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    inner: RwLock<HashMap<String, RawSnapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, device_id: &str, payload: Value, protocol: Protocol) {
        let snapshot = RawSnapshot {
            payload,
            protocol,
            received_at: Utc::now(),
        };
        self.inner
            .write()
            .await
            .insert(device_id.to_owned(), snapshot);
    }

    pub async fn get(&self, device_id: &str) -> Option<RawSnapshot> {
        self.inner.read().await.get(device_id).cloned()
    }

    /// Transport of the device's last ingestion, if it has ever been
    /// heard from. Drives the push-capability check for commands.
    pub async fn last_protocol(&self, device_id: &str) -> Option<Protocol> {
        self.inner.read().await.get(device_id).map(|s| s.protocol)
    }
}
