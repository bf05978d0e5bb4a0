use std::sync::Arc;
use std::time::Duration;

use homestead_domain::{CommandQueue, DomainError, DomainResult, IngestService, Protocol};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use crate::mqtt::pusher::MqttHandle;
use crate::mqtt::topic::{data_topic, parse_topic, TopicChannel, COMMAND_ACK_FILTER};

/// Broker session settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub reconnect_delay_secs: u64,
}

/// Creates the MQTT session. Nothing touches the network until the
/// returned event loop is polled, so the handle can be wired into the
/// command queue before `run_mqtt_ingest` starts.
pub fn open_session(settings: &MqttSettings) -> DomainResult<(MqttHandle, EventLoop)> {
    let (host, port) = parse_broker_url(&settings.broker_url)?;

    let mut options = MqttOptions::new(&settings.client_id, host, port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_clean_session(true);

    let (client, eventloop) = AsyncClient::new(options, 100);
    Ok((MqttHandle::new(client), eventloop))
}

/// Run the MQTT ingest process until cancelled
///
/// Subscribes to every registered MQTT device's data channel plus the
/// acknowledgement wildcard. Connection loss flips the shared handle to
/// disconnected and the loop keeps retrying; subscriptions are
/// re-established on every ConnAck.
#[instrument(
    name = "mqtt_ingest",
    skip_all,
    fields(broker_url = %settings.broker_url)
)]
pub async fn run_mqtt_ingest(
    settings: MqttSettings,
    handle: MqttHandle,
    mut eventloop: EventLoop,
    ingest: Arc<IngestService>,
    commands: Arc<CommandQueue>,
    device_ids: Vec<String>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    info!(
        broker_url = %settings.broker_url,
        devices = device_ids.len(),
        "starting MQTT ingest"
    );
    let reconnect_delay = Duration::from_secs(settings.reconnect_delay_secs);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("shutdown signal received");
                let _ = handle.client().disconnect().await;
                break;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                        handle.set_connected(true);
                        subscribe_all(&handle, &device_ids).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_publish(
                            &publish.topic,
                            &publish.payload,
                            &handle,
                            &ingest,
                            &commands,
                        )
                        .await;
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        // Ping response - connection is healthy
                    }
                    Ok(_) => {
                        // Other events (outgoing, etc.)
                    }
                    Err(error) => {
                        handle.set_connected(false);
                        error!(%error, "MQTT connection error, retrying");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }
        }
    }

    handle.set_connected(false);
    info!("MQTT ingest stopped");
    Ok(())
}

/// Subscribes to every registered device's data channel plus the
/// shared acknowledgement wildcard. Failures are logged; the next
/// reconnect retries them.
async fn subscribe_all(handle: &MqttHandle, device_ids: &[String]) {
    for device_id in device_ids {
        let topic = data_topic(device_id);
        if let Err(error) = handle.client().subscribe(&topic, QoS::AtLeastOnce).await {
            warn!(topic = %topic, %error, "failed to subscribe");
        }
    }
    if let Err(error) = handle
        .client()
        .subscribe(COMMAND_ACK_FILTER, QoS::AtLeastOnce)
        .await
    {
        warn!(filter = COMMAND_ACK_FILTER, %error, "failed to subscribe");
    }
    info!(devices = device_ids.len(), "MQTT subscriptions established");
}

/// Handle an incoming MQTT message
///
/// Creates a new independent trace for each message (not nested under the ingest process trace).
/// Acknowledgement messages settle commands directly; data messages run
/// the full pipeline, and drained commands are published back out on
/// the device's command topic.
pub(crate) async fn handle_publish(
    topic: &str,
    payload: &[u8],
    handle: &MqttHandle,
    ingest: &Arc<IngestService>,
    commands: &Arc<CommandQueue>,
) {
    // Create a new root span for this message (independent trace)
    let span = info_span!(
        parent: Span::none(),
        "mqtt_message",
        topic = %topic,
        payload_size = payload.len(),
        device_id = tracing::field::Empty,
    );

    async {
        let parsed = match parse_topic(topic) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "unroutable MQTT topic, skipping message");
                return;
            }
        };
        Span::current().record("device_id", parsed.device_id.as_str());

        match parsed.channel {
            TopicChannel::CommandAck => {
                let token = String::from_utf8_lossy(payload);
                match commands.acknowledge(&token).await {
                    Ok(acked) => {
                        debug!(count = acked.len(), "acknowledgements settled");
                    }
                    Err(error) => {
                        error!(%error, "failed to settle acknowledgements");
                    }
                }
            }
            TopicChannel::Data => {
                let body: Value = match serde_json::from_slice(payload) {
                    Ok(body) => body,
                    Err(error) => {
                        warn!(%error, "discarding malformed telemetry payload");
                        return;
                    }
                };
                match ingest.ingest(body, Protocol::Mqtt).await {
                    Ok(outcome) => {
                        debug!(status = outcome.status_code, "telemetry handled");
                        if let Some(command_doc) = &outcome.commands {
                            let target = outcome.device_id.as_deref().unwrap_or(&parsed.device_id);
                            match handle.publish_command(target, command_doc).await {
                                Ok(true) => {
                                    info!(device_id = %target, "drained commands published")
                                }
                                Ok(false) => {
                                    debug!(device_id = %target, "drained commands not deliverable")
                                }
                                Err(error) => {
                                    warn!(device_id = %target, %error, "failed to publish drained commands")
                                }
                            }
                        }
                    }
                    Err(error) => {
                        error!(%error, "telemetry ingestion failed");
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match parts.len() {
        1 => Ok((parts[0], 1883)), // Default MQTT port
        2 => {
            let port = parts[1].parse::<u16>().map_err(|_| {
                DomainError::Config(format!("Invalid port in broker URL: {}", parts[1]))
            })?;
            Ok((parts[0], port))
        }
        _ => Err(DomainError::Config(format!(
            "Invalid broker URL format: {}",
            url
        ))),
    }
}
