use std::sync::Arc;

use homestead_domain::{
    BroadcastEvent, CommandQueue, CommandStore, DeviceRegistry, DomainResult, IngestService,
    PluginRegistry, RecordStore, SnapshotCache,
};
use homestead_runner::AppProcess;
use rumqttc::EventLoop;
use tokio::sync::broadcast;
use tracing::debug;

use crate::broadcast::ChannelBroadcaster;
use crate::http::{ingest_router, serve_http, HttpState};
use crate::mqtt::{open_session, run_mqtt_ingest, MqttCommandPusher, MqttHandle, MqttSettings};

/// Transport settings for one gateway instance.
pub struct IngestGatewayConfig {
    pub http_bind_addr: String,
    /// `None` disables the MQTT transport; devices then reach the
    /// pipeline over HTTP only.
    pub mqtt: Option<MqttSettings>,
    pub broadcast_capacity: usize,
}

struct MqttParts {
    settings: MqttSettings,
    handle: MqttHandle,
    eventloop: EventLoop,
    device_ids: Vec<String>,
}

/// Wires the ingestion pipeline to its transports: the HTTP API, the
/// optional MQTT session (shared by the subscriber and the command
/// pusher), and the observer broadcast hub.
pub struct IngestGateway {
    http_bind_addr: String,
    http_state: HttpState,
    broadcaster: Arc<ChannelBroadcaster>,
    mqtt: Option<MqttParts>,
}

impl IngestGateway {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        records: Arc<dyn RecordStore>,
        command_store: Arc<dyn CommandStore>,
        plugins: Arc<PluginRegistry>,
        config: IngestGatewayConfig,
    ) -> DomainResult<Self> {
        debug!("initializing ingest gateway");

        let snapshots = Arc::new(SnapshotCache::new());
        let broadcaster = Arc::new(ChannelBroadcaster::new(config.broadcast_capacity));

        // The MQTT session is created before the command queue so the
        // queue can push to already-connected devices. The session does
        // not dial out until its event loop is polled.
        let mut queue = CommandQueue::new(command_store, snapshots.clone());
        let mut mqtt = None;
        if let Some(settings) = config.mqtt {
            let (handle, eventloop) = open_session(&settings)?;
            queue = queue.with_pusher(Arc::new(MqttCommandPusher::new(handle.clone())));
            mqtt = Some(MqttParts {
                device_ids: registry
                    .mqtt_device_ids()
                    .into_iter()
                    .map(String::from)
                    .collect(),
                settings,
                handle,
                eventloop,
            });
        }
        let commands = Arc::new(queue);

        let ingest = Arc::new(IngestService::new(
            registry,
            records,
            commands.clone(),
            plugins,
            broadcaster.clone(),
            snapshots,
        ));

        Ok(Self {
            http_bind_addr: config.http_bind_addr,
            http_state: HttpState { ingest, commands },
            broadcaster,
            mqtt,
        })
    }

    /// Live observer feed of LATEST, RAW and STATS events.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.broadcaster.subscribe()
    }

    /// Consumes the gateway into runner processes, one per transport.
    pub fn into_processes(self) -> Vec<(&'static str, AppProcess)> {
        let mut processes: Vec<(&'static str, AppProcess)> = Vec::new();

        let bind_addr = self.http_bind_addr;
        let state = self.http_state.clone();
        processes.push((
            "http_ingest",
            Box::new(move |token| {
                Box::pin(async move { serve_http(&bind_addr, ingest_router(state), token).await })
            }),
        ));

        if let Some(parts) = self.mqtt {
            let ingest = self.http_state.ingest.clone();
            let commands = self.http_state.commands.clone();
            processes.push((
                "mqtt_ingest",
                Box::new(move |token| {
                    Box::pin(async move {
                        run_mqtt_ingest(
                            parts.settings,
                            parts.handle,
                            parts.eventloop,
                            ingest,
                            commands,
                            parts.device_ids,
                            token,
                        )
                        .await
                    })
                }),
            ));
        }

        processes
    }
}
