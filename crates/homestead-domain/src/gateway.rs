use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastEvent, EVENT_LATEST, EVENT_RAW, EVENT_STATS};
use crate::command::CommandQueue;
use crate::compactor::Compactor;
use crate::config::DeviceRegistry;
use crate::error::{DomainError, DomainResult};
use crate::payload::{ack_token, extract_device_id};
use crate::plugin::{PluginContext, PluginRegistry};
use crate::protocol::Protocol;
use crate::record::{collection_name, TelemetryRecord};
use crate::resolver::{build_tree, resolve_entries};
use crate::snapshot::SnapshotCache;
use crate::store::{BroadcastSink, RecordStore};

/// What a transport should answer with. Rejections are regular
/// outcomes here; only store failures leave `ingest` as errors.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub status_code: u16,
    pub body: Value,
    pub device_id: Option<String>,
    /// Drained command tree (with its `_ack` token) that push-capable
    /// transports should also deliver out-of-band.
    pub commands: Option<Value>,
    pub acked: Vec<Uuid>,
}

impl IngestOutcome {
    fn rejected(status_code: u16, message: &str) -> Self {
        Self {
            status_code,
            body: json!({"status": "Rejected", "message": message}),
            device_id: None,
            commands: None,
            acked: Vec::new(),
        }
    }

    fn ignored() -> Self {
        Self {
            status_code: 200,
            body: json!({"status": "Ignored", "message": "Unknown device"}),
            device_id: None,
            commands: None,
            acked: Vec::new(),
        }
    }
}

/// The ingestion pipeline: acknowledgement handling, device
/// resolution, protocol gating, schema-driven normalization, plugin
/// hooks, persistence, incremental compaction, command drain, and
/// observer fan-out, in that order.
pub struct IngestService {
    registry: Arc<DeviceRegistry>,
    records: Arc<dyn RecordStore>,
    commands: Arc<CommandQueue>,
    plugins: Arc<PluginRegistry>,
    broadcast: Arc<dyn BroadcastSink>,
    snapshots: Arc<SnapshotCache>,
    compactor: Compactor,
}

impl IngestService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        records: Arc<dyn RecordStore>,
        commands: Arc<CommandQueue>,
        plugins: Arc<PluginRegistry>,
        broadcast: Arc<dyn BroadcastSink>,
        snapshots: Arc<SnapshotCache>,
    ) -> Self {
        let compactor = Compactor::new(records.clone());
        Self {
            registry,
            records,
            commands,
            plugins,
            broadcast,
            snapshots,
            compactor,
        }
    }

    /// Runs one payload through the pipeline and maps rejection-style
    /// errors to their response codes. Store failures pass through for
    /// the transport to turn into a 500.
    #[instrument(skip(self, payload), fields(protocol = %protocol))]
    pub async fn ingest(&self, payload: Value, protocol: Protocol) -> DomainResult<IngestOutcome> {
        match self.run_pipeline(payload, protocol).await {
            Ok(outcome) => Ok(outcome),
            Err(DomainError::MissingDeviceId) => {
                info!("rejecting payload without device id");
                Ok(IngestOutcome::rejected(400, "Missing deviceId"))
            }
            Err(DomainError::UnknownDevice(device_id)) => {
                info!(device_id = %device_id, "ignoring data from unknown device");
                Ok(IngestOutcome::ignored())
            }
            Err(DomainError::ProtocolNotAllowed {
                device_id,
                protocol,
            }) => {
                info!(device_id = %device_id, %protocol, "rejecting disallowed protocol");
                Ok(IngestOutcome::rejected(403, "Protocol not allowed"))
            }
            Err(error) => Err(error),
        }
    }

    async fn run_pipeline(
        &self,
        payload: Value,
        protocol: Protocol,
    ) -> DomainResult<IngestOutcome> {
        // Acknowledgements ride on telemetry payloads and are settled
        // first, whatever happens to the rest of the payload.
        let acked = match ack_token(&payload) {
            Some(token) => match self.commands.acknowledge(&token).await {
                Ok(ids) => ids,
                Err(error) => {
                    warn!(%error, "failed to settle piggy-backed ack");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let device_id = extract_device_id(&payload).ok_or(DomainError::MissingDeviceId)?;
        self.snapshots
            .record(&device_id, payload.clone(), protocol)
            .await;

        let config = self
            .registry
            .get(&device_id)
            .ok_or_else(|| DomainError::UnknownDevice(device_id.clone()))?;
        if !config.allows(protocol) {
            return Err(DomainError::ProtocolNotAllowed {
                device_id,
                protocol: protocol.to_string(),
            });
        }

        let mut instances = resolve_entries(config, &payload);
        for instance in &mut instances {
            let Some(binding) = config.plugin_binding(&instance.config_key, &instance.name)
            else {
                continue;
            };
            let Some(plugin) = self.plugins.get(&binding.plugin_type) else {
                warn!(
                    device_id = %device_id,
                    plugin = %binding.plugin_type,
                    "configured plugin is not registered"
                );
                continue;
            };
            let claimed = config.claimed_fields(&instance.config_key, &binding.plugin_type);
            let ctx = PluginContext {
                device_id: &device_id,
                config_key: &instance.config_key,
                entry_name: &instance.name,
                options: &binding.options,
                claimed_fields: &claimed,
                records: &self.records,
            };
            match plugin.run(instance.fields.clone(), ctx).await {
                Ok(fields) => {
                    // Merge over the extracted fields; untouched ones
                    // survive even if the plugin drops them.
                    for (name, value) in fields {
                        instance.fields.insert(name, value);
                    }
                }
                Err(error) => {
                    warn!(
                        device_id = %device_id,
                        plugin = %binding.plugin_type,
                        %error,
                        "plugin failed, keeping extracted fields"
                    );
                }
            }
        }

        let record = TelemetryRecord::new(
            protocol.as_str(),
            Value::Object(build_tree(&instances)),
        );
        let record_id = self.records.insert(&device_id, &record).await?;
        info!(device_id = %device_id, record_id, "telemetry recorded");

        self.compactor.compact_inserted(&device_id, &record).await?;

        let drained = self.commands.drain_pending(&device_id).await?;

        let mut body = Map::new();
        body.insert("status".to_owned(), json!("Recorded"));
        body.insert("collection".to_owned(), json!(collection_name(&device_id)));
        body.insert("deviceId".to_owned(), json!(device_id));
        if let Some((commands, ids)) = &drained {
            info!(device_id = %device_id, count = ids.len(), "piggy-backing commands on response");
            for (key, value) in commands {
                body.insert(key.clone(), value.clone());
            }
        }

        self.fan_out(&device_id, &record).await;

        Ok(IngestOutcome {
            status_code: 201,
            body: Value::Object(body),
            device_id: Some(device_id),
            commands: drained.map(|(commands, _)| Value::Object(commands)),
            acked,
        })
    }

    /// Observer fan-out never affects the ingestion result.
    async fn fan_out(&self, device_id: &str, record: &TelemetryRecord) {
        let latest = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "cannot serialize record for broadcast");
                return;
            }
        };
        let raw = self
            .snapshots
            .get(device_id)
            .await
            .map(|snapshot| snapshot.payload)
            .unwrap_or(Value::Null);

        let mut events = vec![
            BroadcastEvent::new(EVENT_LATEST, device_id, latest),
            BroadcastEvent::new(EVENT_RAW, device_id, raw),
        ];
        match self.records.stats(device_id).await {
            Ok(stats) => match serde_json::to_value(&stats) {
                Ok(value) => events.push(BroadcastEvent::new(EVENT_STATS, device_id, value)),
                Err(error) => warn!(%error, "cannot serialize stats for broadcast"),
            },
            Err(error) => warn!(%error, "cannot refresh stats for broadcast"),
        }
        for event in events {
            if let Err(error) = self.broadcast.broadcast(event).await {
                warn!(%error, "broadcast dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandStatus;
    use crate::memory::{InMemoryCommandStore, InMemoryRecordStore};
    use crate::plugin::StoveStatePlugin;
    use crate::store::{CommandStore, MockBroadcastSink, MockCommandStore, MockRecordStore};
    use crate::value::value_at;
    use serde_json::json;

    const REGISTRY: &str = r#"{
        "devices": {
            "greenhouse-7": {
                "data": {
                    "EnergyMeter.main": ["voltage", "current"],
                    "living": {
                        "tempC": true,
                        "state": {"save": true, "type": "stove_state"}
                    }
                },
                "network": {"protocol": ["mqtt", "http"]},
                "plugins": {"living": {"type": "stove_state"}}
            },
            "camper": {
                "data": {"Battery.house": ["voltage"]},
                "network": {"protocol": ["http"]}
            }
        }
    }"#;

    struct Harness {
        service: IngestService,
        records: Arc<InMemoryRecordStore>,
        command_store: Arc<InMemoryCommandStore>,
        queue: Arc<CommandQueue>,
    }

    fn harness() -> Harness {
        harness_with_sink(Arc::new(NullSink))
    }

    fn harness_with_sink(sink: Arc<dyn BroadcastSink>) -> Harness {
        let registry = Arc::new(DeviceRegistry::from_json(REGISTRY).unwrap());
        let records = Arc::new(InMemoryRecordStore::new());
        let command_store = Arc::new(InMemoryCommandStore::new());
        let snapshots = Arc::new(SnapshotCache::new());
        let queue = Arc::new(CommandQueue::new(command_store.clone(), snapshots.clone()));
        let plugins = Arc::new(
            PluginRegistry::builder()
                .register(Arc::new(StoveStatePlugin::default()))
                .build(),
        );
        let service = IngestService::new(
            registry,
            records.clone(),
            queue.clone(),
            plugins,
            sink,
            snapshots,
        );
        Harness {
            service,
            records,
            command_store,
            queue,
        }
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl BroadcastSink for NullSink {
        async fn broadcast(&self, _event: BroadcastEvent) -> DomainResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn happy_path_records_and_responds_201() {
        let h = harness();
        let payload = json!([{
            "type": "EnergyMeter", "subtype": "main", "name": "shore",
            "deviceId": "greenhouse-7", "voltage": 230.1, "frequency": 50
        }]);
        let outcome = h.service.ingest(payload, Protocol::Http).await.unwrap();
        assert_eq!(outcome.status_code, 201);
        assert_eq!(outcome.body["status"], json!("Recorded"));
        assert_eq!(outcome.body["collection"], json!("device_greenhouse_7"));
        assert_eq!(outcome.body["deviceId"], json!("greenhouse-7"));
        assert!(outcome.commands.is_none());

        let dump = h.records.dump("greenhouse-7").await;
        assert_eq!(dump.len(), 1);
        assert_eq!(
            value_at(&dump[0].doc, "data.EnergyMeter.main.shore.voltage"),
            Some(&json!(230.1))
        );
        // Unlisted fields never persist.
        assert!(value_at(&dump[0].doc, "data.EnergyMeter.main.shore.frequency").is_none());
        assert_eq!(value_at(&dump[0].doc, "protocol"), Some(&json!("http")));
    }

    #[tokio::test]
    async fn missing_device_id_is_a_400() {
        let h = harness();
        let outcome = h
            .service
            .ingest(json!({"orphan": {"x": 1}}), Protocol::Http)
            .await
            .unwrap();
        assert_eq!(outcome.status_code, 400);
        assert_eq!(outcome.body["message"], json!("Missing deviceId"));
        assert!(h.records.dump("greenhouse-7").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_ignored_with_200() {
        let h = harness();
        let outcome = h
            .service
            .ingest(json!({"deviceId": "stranger", "m": {"v": 1}}), Protocol::Http)
            .await
            .unwrap();
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.body["status"], json!("Ignored"));
        assert!(h.records.dump("stranger").await.is_empty());
    }

    #[tokio::test]
    async fn disallowed_protocol_is_a_403() {
        let h = harness();
        let payload = json!([{
            "type": "Battery", "subtype": "house", "name": "main",
            "deviceId": "camper", "voltage": 12.6
        }]);
        let outcome = h
            .service
            .ingest(payload.clone(), Protocol::Mqtt)
            .await
            .unwrap();
        assert_eq!(outcome.status_code, 403);
        assert!(h.records.dump("camper").await.is_empty());

        let ok = h.service.ingest(payload, Protocol::Http).await.unwrap();
        assert_eq!(ok.status_code, 201);
    }

    #[tokio::test]
    async fn repeated_readings_are_compacted_inline() {
        let h = harness();
        for _ in 0..5 {
            let payload = json!([{
                "type": "EnergyMeter", "subtype": "main", "name": "shore",
                "deviceId": "greenhouse-7", "voltage": 230
            }]);
            h.service.ingest(payload, Protocol::Http).await.unwrap();
        }
        let values: Vec<_> = h
            .records
            .dump("greenhouse-7")
            .await
            .iter()
            .map(|r| value_at(&r.doc, "data.EnergyMeter.main.shore.voltage").cloned())
            .collect();
        assert_eq!(
            values,
            vec![Some(json!(230)), None, None, None, Some(json!(230))]
        );
    }

    #[tokio::test]
    async fn plugin_derives_state_before_persistence() {
        let h = harness();
        let payload = json!({
            "deviceId": "greenhouse-7",
            "living": {"tempC": 300.0, "state": "raw-ignored"}
        });
        h.service.ingest(payload, Protocol::Http).await.unwrap();
        let dump = h.records.dump("greenhouse-7").await;
        assert_eq!(
            value_at(&dump[0].doc, "data.living.living.state"),
            Some(&json!("operating"))
        );
        assert_eq!(
            value_at(&dump[0].doc, "data.living.living.tempC"),
            Some(&json!(300.0))
        );
    }

    #[tokio::test]
    async fn failing_plugin_keeps_extracted_fields() {
        // A list-form field spec delegates nothing, so the stove
        // plugin has nowhere to write its state and refuses the
        // reading. The record still lands with what was extracted.
        let registry = r#"{
            "devices": {
                "boiler-1": {
                    "data": {"boiler": ["tempC"]},
                    "network": {"protocol": ["http"]},
                    "plugins": {"boiler": {"type": "stove_state"}}
                }
            }
        }"#;
        let registry = Arc::new(DeviceRegistry::from_json(registry).unwrap());
        let records = Arc::new(InMemoryRecordStore::new());
        let snapshots = Arc::new(SnapshotCache::new());
        let queue = Arc::new(CommandQueue::new(
            Arc::new(InMemoryCommandStore::new()),
            snapshots.clone(),
        ));
        let plugins = Arc::new(
            PluginRegistry::builder()
                .register(Arc::new(StoveStatePlugin::default()))
                .build(),
        );
        let service = IngestService::new(
            registry,
            records.clone(),
            queue,
            plugins,
            Arc::new(NullSink),
            snapshots,
        );

        let payload = json!({"deviceId": "boiler-1", "boiler": {"tempC": 240.0}});
        let outcome = service.ingest(payload, Protocol::Http).await.unwrap();
        assert_eq!(outcome.status_code, 201);

        let dump = records.dump("boiler-1").await;
        assert_eq!(
            value_at(&dump[0].doc, "data.boiler.boiler.tempC"),
            Some(&json!(240.0))
        );
        assert!(value_at(&dump[0].doc, "data.boiler.boiler.state").is_none());
    }

    #[tokio::test]
    async fn pending_commands_ride_on_the_response() {
        let h = harness();
        let id = h
            .queue
            .enqueue("greenhouse-7", json!({"fan": {"speed": 2}}))
            .await
            .unwrap();

        let payload = json!({"deviceId": "greenhouse-7", "living": {"tempC": 20.0}});
        let outcome = h.service.ingest(payload, Protocol::Http).await.unwrap();
        assert_eq!(outcome.status_code, 201);
        assert_eq!(outcome.body["fan"], json!({"speed": 2}));
        assert_eq!(outcome.body["_ack"], json!(id.to_string()));
        let commands = outcome.commands.unwrap();
        assert_eq!(commands["fan"], json!({"speed": 2}));
        assert_eq!(
            h.command_store.status_of(id).await.unwrap(),
            Some(CommandStatus::Sent)
        );
    }

    #[tokio::test]
    async fn piggy_backed_ack_settles_before_anything_else() {
        let h = harness();
        let id = h
            .queue
            .enqueue("greenhouse-7", json!({"fan": {"speed": 1}}))
            .await
            .unwrap();

        // The ack arrives on a payload that is then rejected; the
        // settlement must stick anyway.
        let payload = json!({"_ack": id.to_string()});
        let outcome = h.service.ingest(payload, Protocol::Http).await.unwrap();
        assert_eq!(outcome.status_code, 400);
        assert_eq!(
            h.command_store.status_of(id).await.unwrap(),
            Some(CommandStatus::Acknowledged)
        );
    }

    #[tokio::test]
    async fn failed_ack_settlement_never_blocks_telemetry() {
        let registry = Arc::new(DeviceRegistry::from_json(REGISTRY).unwrap());
        let mut command_store = MockCommandStore::new();
        command_store
            .expect_mark_acknowledged()
            .returning(|_, _| Err(DomainError::Store(anyhow::anyhow!("queue offline"))));
        command_store
            .expect_pending_for()
            .returning(|_| Ok(Vec::new()));
        let records = Arc::new(InMemoryRecordStore::new());
        let snapshots = Arc::new(SnapshotCache::new());
        let queue = Arc::new(CommandQueue::new(Arc::new(command_store), snapshots.clone()));
        let service = IngestService::new(
            registry,
            records.clone(),
            queue,
            Arc::new(PluginRegistry::builder().build()),
            Arc::new(NullSink),
            snapshots,
        );

        let payload = json!({
            "deviceId": "greenhouse-7",
            "_ack": "0191d1f0-0000-7000-8000-000000000000",
            "living": {"tempC": 21.0}
        });
        let outcome = service.ingest(payload, Protocol::Http).await.unwrap();
        assert_eq!(outcome.status_code, 201);
        assert!(outcome.acked.is_empty());
        assert_eq!(records.dump("greenhouse-7").await.len(), 1);
    }

    #[tokio::test]
    async fn ack_and_fresh_commands_in_one_round_trip() {
        let h = harness();
        let old = h
            .queue
            .enqueue("greenhouse-7", json!({"fan": {"speed": 1}}))
            .await
            .unwrap();
        h.queue.drain_pending("greenhouse-7").await.unwrap();
        let fresh = h
            .queue
            .enqueue("greenhouse-7", json!({"light": {"on": true}}))
            .await
            .unwrap();

        let payload = json!({
            "deviceId": "greenhouse-7",
            "_ack": old.to_string(),
            "living": {"tempC": 21.0}
        });
        let outcome = h.service.ingest(payload, Protocol::Http).await.unwrap();
        assert_eq!(outcome.acked, vec![old]);
        assert_eq!(outcome.body["light"], json!({"on": true}));
        assert_eq!(
            h.command_store.status_of(old).await.unwrap(),
            Some(CommandStatus::Acknowledged)
        );
        assert_eq!(
            h.command_store.status_of(fresh).await.unwrap(),
            Some(CommandStatus::Sent)
        );
    }

    #[tokio::test]
    async fn fan_out_emits_latest_raw_and_stats() {
        let mut sink = MockBroadcastSink::new();
        sink.expect_broadcast()
            .withf(|event| event.event_type == EVENT_LATEST && event.device_id == "greenhouse-7")
            .times(1)
            .returning(|_| Ok(()));
        sink.expect_broadcast()
            .withf(|event| {
                event.event_type == EVENT_RAW
                    && event.payload["living"]["tempC"] == json!(21.0)
            })
            .times(1)
            .returning(|_| Ok(()));
        sink.expect_broadcast()
            .withf(|event| {
                event.event_type == EVENT_STATS && event.payload["record_count"] == json!(1)
            })
            .times(1)
            .returning(|_| Ok(()));

        let h = harness_with_sink(Arc::new(sink));
        let payload = json!({"deviceId": "greenhouse-7", "living": {"tempC": 21.0}});
        h.service.ingest(payload, Protocol::Http).await.unwrap();
    }

    #[tokio::test]
    async fn store_failures_surface_as_errors() {
        let registry = Arc::new(DeviceRegistry::from_json(REGISTRY).unwrap());
        let mut records = MockRecordStore::new();
        records
            .expect_insert()
            .returning(|_, _| Err(DomainError::Store(anyhow::anyhow!("disk gone"))));
        let records: Arc<dyn RecordStore> = Arc::new(records);
        let snapshots = Arc::new(SnapshotCache::new());
        let queue = Arc::new(CommandQueue::new(
            Arc::new(InMemoryCommandStore::new()),
            snapshots.clone(),
        ));
        let service = IngestService::new(
            registry,
            records,
            queue,
            Arc::new(PluginRegistry::builder().build()),
            Arc::new(NullSink),
            snapshots,
        );

        let payload = json!({"deviceId": "greenhouse-7", "living": {"tempC": 21.0}});
        let result = service.ingest(payload, Protocol::Http).await;
        assert!(matches!(result, Err(DomainError::Store(_))));
    }
}
