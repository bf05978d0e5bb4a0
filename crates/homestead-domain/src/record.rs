use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Store-assigned record identifier, monotonically increasing per
/// device in arrival order.
pub type RecordId = i64;

/// Postgres identifiers cap at 63 bytes, and index names are derived
/// from the collection name, so device-derived names are truncated
/// well under the limit.
const MAX_COLLECTION_LEN: usize = 48;

/// A normalized telemetry document, ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub received_at: DateTime<Utc>,
    pub protocol: String,
    /// Nested field tree: `data[type][subtype?][name][field]`.
    pub data: Value,
}

impl TelemetryRecord {
    pub fn new(protocol: impl Into<String>, data: Value) -> Self {
        Self {
            received_at: Utc::now(),
            protocol: protocol.into(),
            data,
        }
    }

    /// The persisted document body. `received_at` lives beside it as a
    /// dedicated sort column, not inside the document.
    pub fn doc(&self) -> Value {
        serde_json::json!({
            "protocol": self.protocol,
            "data": self.data,
        })
    }
}

/// A record read back from a device collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub received_at: DateTime<Utc>,
    /// Document body as stored: `{"protocol": ..., "data": {...}}`.
    pub doc: Value,
}

/// One pending field removal, queued by the batch compactor and
/// flushed in groups.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsetOp {
    pub record_id: RecordId,
    pub key_path: String,
}

/// Per-device aggregates, broadcast after every successful ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub device_id: String,
    pub record_count: u64,
    pub last_received_at: Option<DateTime<Utc>>,
}

/// Deterministic collection name for a device: `device_{id}` with
/// anything outside `[A-Za-z0-9_]` folded to `_`. Doubles as the
/// physical table name, so it is also length-capped.
pub fn collection_name(device_id: &str) -> String {
    let mut name = String::with_capacity(device_id.len() + 7);
    name.push_str("device_");
    for c in device_id.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            name.push(c);
        } else {
            name.push('_');
        }
        if name.len() == MAX_COLLECTION_LEN {
            break;
        }
    }
    name
}
