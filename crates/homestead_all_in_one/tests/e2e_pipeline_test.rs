use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use homestead_domain::{
    CommandQueue, CommandStatus, CommandStore, DeviceRegistry, IngestService, InMemoryCommandStore,
    InMemoryRecordStore, PluginRegistry, SnapshotCache, StoveStatePlugin, EVENT_LATEST, EVENT_RAW,
    EVENT_STATS,
};
use homestead_domain::value::value_at;
use http_body_util::BodyExt;
use ingest_gateway::{ingest_router, ChannelBroadcaster, HttpState};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::util::ServiceExt;

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
        }
    }
}"#;

struct TestStack {
    router: Router,
    records: Arc<InMemoryRecordStore>,
    command_store: Arc<InMemoryCommandStore>,
    events: broadcast::Receiver<homestead_domain::BroadcastEvent>,
}

/// Assembles the whole pipeline against in-memory stores, exactly as
/// the service wires it minus the network listeners.
fn build_stack() -> TestStack {
    let registry = Arc::new(DeviceRegistry::from_json(REGISTRY).unwrap());
    let records = Arc::new(InMemoryRecordStore::new());
    let command_store = Arc::new(InMemoryCommandStore::new());
    let snapshots = Arc::new(SnapshotCache::new());
    let broadcaster = Arc::new(ChannelBroadcaster::new(64));
    let events = broadcaster.subscribe();
    let commands = Arc::new(CommandQueue::new(command_store.clone(), snapshots.clone()));
    let plugins = Arc::new(
        PluginRegistry::builder()
            .register(Arc::new(StoveStatePlugin::default()))
            .build(),
    );
    let ingest = Arc::new(IngestService::new(
        registry,
        records.clone(),
        commands.clone(),
        plugins,
        broadcaster,
        snapshots,
    ));
    let router = ingest_router(HttpState { ingest, commands });

    TestStack {
        router,
        records,
        command_store,
        events,
    }
}

async fn post_json(router: &Router, uri: &str, body: Value) -> Result<(StatusCode, Value)> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))?;
    let response = router.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Ok((status, body))
}

#[tokio::test]
async fn test_end_to_end_ingest_pipeline() -> Result<()> {
    // Phase 1: Assemble the pipeline
    let mut stack = build_stack();

    println!("✅ Phase 1 completed: Pipeline assembled");

    // Phase 2: Ingest telemetry over the HTTP API
    let payload = json!([{
        "type": "EnergyMeter", "subtype": "main", "name": "shore",
        "deviceId": "greenhouse-7", "voltage": 230, "frequency": 50
    }]);
    let (status, body) = post_json(&stack.router, "/automation_api", payload).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], json!("Recorded"));
    assert_eq!(body["collection"], json!("device_greenhouse_7"));

    let dump = stack.records.dump("greenhouse-7").await;
    assert_eq!(dump.len(), 1);
    assert_eq!(
        value_at(&dump[0].doc, "data.EnergyMeter.main.shore.voltage"),
        Some(&json!(230))
    );
    // Fields outside the registry spec never persist
    assert!(value_at(&dump[0].doc, "data.EnergyMeter.main.shore.frequency").is_none());

    // Observers see LATEST, RAW and STATS for the ingestion
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(stack.events.recv().await?.event_type);
    }
    assert!(seen.contains(&EVENT_LATEST.to_string()));
    assert!(seen.contains(&EVENT_RAW.to_string()));
    assert!(seen.contains(&EVENT_STATS.to_string()));

    println!("✅ Phase 2 completed: Telemetry recorded and broadcast");

    // Phase 3: Repeat the same reading; interior duplicates compact away
    for _ in 0..4 {
        let payload = json!([{
            "type": "EnergyMeter", "subtype": "main", "name": "shore",
            "deviceId": "greenhouse-7", "voltage": 230
        }]);
        let (status, _) = post_json(&stack.router, "/automation_api", payload).await?;
        assert_eq!(status, StatusCode::CREATED);
    }
    let voltages: Vec<_> = stack
        .records
        .dump("greenhouse-7")
        .await
        .iter()
        .map(|r| value_at(&r.doc, "data.EnergyMeter.main.shore.voltage").cloned())
        .collect();
    assert_eq!(
        voltages,
        vec![Some(json!(230)), None, None, None, Some(json!(230))],
        "only the boundary readings of the redundant run survive"
    );

    println!("✅ Phase 3 completed: Redundant readings compacted inline");

    // Phase 4: Queue a command, watch it ride the next response, ack it
    let (status, body) = post_json(
        &stack.router,
        "/api/devices/greenhouse-7/commands",
        json!({"fan": {"speed": 2}}),
    )
    .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    let command_id: uuid::Uuid = body["id"].as_str().unwrap().parse()?;
    assert_eq!(
        stack.command_store.status_of(command_id).await?,
        Some(CommandStatus::Pending)
    );

    let (status, body) = post_json(
        &stack.router,
        "/automation_api",
        json!({"deviceId": "greenhouse-7", "living": {"tempC": 19.5}}),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["fan"], json!({"speed": 2}));
    assert_eq!(body["_ack"], json!(command_id.to_string()));
    assert_eq!(
        stack.command_store.status_of(command_id).await?,
        Some(CommandStatus::Sent)
    );

    let (status, _) = post_json(
        &stack.router,
        "/automation_api",
        json!({
            "deviceId": "greenhouse-7",
            "_ack": command_id.to_string(),
            "living": {"tempC": 19.6}
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        stack.command_store.status_of(command_id).await?,
        Some(CommandStatus::Acknowledged)
    );

    println!("✅ Phase 4 completed: Command queued, delivered and acknowledged");

    // Phase 5: Plugin-derived state lands in storage
    let (status, _) = post_json(
        &stack.router,
        "/automation_api",
        json!({"deviceId": "greenhouse-7", "living": {"tempC": 300.0}}),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let dump = stack.records.dump("greenhouse-7").await;
    let last = dump.last().unwrap();
    assert_eq!(
        value_at(&last.doc, "data.living.living.state"),
        Some(&json!("operating"))
    );

    println!("✅ Phase 5 completed: Plugin-derived state persisted");
    println!();
    println!("🎉 End-to-end test completed successfully!");

    Ok(())
}
