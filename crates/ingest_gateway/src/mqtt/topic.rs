use homestead_domain::{DomainError, DomainResult};

/// Wildcard filter matching every device's acknowledgement channel.
pub const COMMAND_ACK_FILTER: &str = "device/+/commandAck";

/// Channel segment of a device topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicChannel {
    /// Telemetry published by the device.
    Data,
    /// Command acknowledgements published by the device.
    CommandAck,
}

/// Parsed MQTT topic containing the device ID and channel
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTopic {
    pub device_id: String,
    pub channel: TopicChannel,
}

/// Parse an MQTT topic in the format `device/{device_id}/{channel}`
///
/// # Arguments
/// * `topic` - The MQTT topic string to parse
///
/// # Returns
/// * `Ok(DeviceTopic)` - Successfully parsed topic
/// * `Err(DomainError)` - Invalid topic format
///
/// # Examples
/// ```
/// use ingest_gateway::mqtt::{parse_topic, TopicChannel};
///
/// let parsed = parse_topic("device/greenhouse-7/data").unwrap();
/// assert_eq!(parsed.device_id, "greenhouse-7");
/// assert_eq!(parsed.channel, TopicChannel::Data);
/// ```
pub fn parse_topic(topic: &str) -> DomainResult<DeviceTopic> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() != 3 || parts[0] != "device" {
        return Err(DomainError::MalformedPayload(format!(
            "Invalid topic format '{}': expected 'device/{{device_id}}/{{channel}}'",
            topic
        )));
    }

    let device_id = parts[1].trim();
    if device_id.is_empty() {
        return Err(DomainError::MalformedPayload(
            "Device ID cannot be empty in topic".to_string(),
        ));
    }

    let channel = match parts[2] {
        "data" => TopicChannel::Data,
        "commandAck" => TopicChannel::CommandAck,
        other => {
            return Err(DomainError::MalformedPayload(format!(
                "Unknown topic channel '{}': expected 'data' or 'commandAck'",
                other
            )))
        }
    };

    Ok(DeviceTopic {
        device_id: device_id.to_string(),
        channel,
    })
}

/// Topic one device publishes its telemetry on.
pub fn data_topic(device_id: &str) -> String {
    format!("device/{device_id}/data")
}

/// Topic the platform publishes commands on for one device.
pub fn command_topic(device_id: &str) -> String {
    format!("device/{device_id}/command")
}
