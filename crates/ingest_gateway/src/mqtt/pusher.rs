use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use homestead_domain::{CommandPusher, DomainResult};
use rumqttc::{AsyncClient, QoS};
use serde_json::Value;
use tracing::{debug, warn};

use crate::mqtt::topic::command_topic;

/// Shared handle to the one MQTT session. The client survives broker
/// reconnects, so holders keep it for the process lifetime; `connected`
/// tracks whether a publish can currently reach the broker.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

impl MqttHandle {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Publishes a command document to the device's command topic.
    /// `Ok(false)` means the broker is not reachable right now; the
    /// caller decides whether the command waits for the next drain.
    pub async fn publish_command(&self, device_id: &str, payload: &Value) -> DomainResult<bool> {
        if !self.is_connected() {
            debug!(device_id = %device_id, "broker not connected, command not pushed");
            return Ok(false);
        }

        let topic = command_topic(device_id);
        match self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
        {
            Ok(()) => {
                debug!(device_id = %device_id, topic = %topic, "command published");
                Ok(true)
            }
            Err(error) => {
                warn!(device_id = %device_id, %error, "MQTT publish failed");
                Ok(false)
            }
        }
    }
}

/// `CommandPusher` backed by the live MQTT session, wired into the
/// command queue so enqueued commands reach connected devices without
/// waiting for their next poll.
pub struct MqttCommandPusher {
    handle: MqttHandle,
}

impl MqttCommandPusher {
    pub fn new(handle: MqttHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl CommandPusher for MqttCommandPusher {
    async fn push(&self, device_id: &str, payload: &Value) -> DomainResult<bool> {
        self.handle.publish_command(device_id, payload).await
    }
}
