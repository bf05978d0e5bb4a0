use serde::Serialize;
use serde_json::Value;

/// Latest normalized record for a device.
pub const EVENT_LATEST: &str = "LATEST";
/// Raw payload exactly as it arrived.
pub const EVENT_RAW: &str = "RAW";
/// Refreshed per-device aggregates.
pub const EVENT_STATS: &str = "STATS";

/// One fan-out message. Observers filter on `event_type` and
/// `device_id`; the payload shape is event-specific.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub device_id: String,
    pub payload: Value,
}

impl BroadcastEvent {
    pub fn new(event_type: &str, device_id: &str, payload: Value) -> Self {
        Self {
            event_type: event_type.to_owned(),
            device_id: device_id.to_owned(),
            payload,
        }
    }
}
