use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport a payload arrived over. Stored on every record and checked
/// against the device's allow-list before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Mqtt,
    /// Transport did not identify itself. Never rejected by the gate.
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Mqtt => "mqtt",
            Protocol::Unknown => "unknown",
        }
    }

    /// Case-insensitive tag parse. Unrecognized tags fold to `Unknown`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "http" => Protocol::Http,
            "mqtt" => Protocol::Mqtt,
            _ => Protocol::Unknown,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
