mod config;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use config::ServiceConfig;
use homestead_domain::{DeviceRegistry, PluginRegistry, StoveStatePlugin};
use homestead_postgres::{PostgresClient, PostgresCommandStore, PostgresRecordStore};
use homestead_runner::Runner;
use ingest_gateway::mqtt::MqttSettings;
use ingest_gateway::{IngestGateway, IngestGatewayConfig};
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize telemetry (tracing + OpenTelemetry for traces and logs)
    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        mqtt_enabled = config.mqtt_enabled,
        "Starting homestead-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    // Device registry is loaded once and read-only for the process
    // lifetime; editing it means restarting the service.
    let registry = match DeviceRegistry::from_file(&config.device_config_path) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to load device registry: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        devices = registry.len(),
        path = %config.device_config_path,
        "device registry loaded"
    );

    // Initialize persistence
    let (records, command_store) = match initialize_stores(&config).await {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to initialize PostgreSQL stores: {}", e);
            std::process::exit(1);
        }
    };

    let plugins = Arc::new(
        PluginRegistry::builder()
            .register(Arc::new(StoveStatePlugin::default()))
            .build(),
    );

    let mqtt = config.mqtt_enabled.then(|| MqttSettings {
        broker_url: config.mqtt_broker_url.clone(),
        client_id: config.mqtt_client_id.clone(),
        keep_alive_secs: config.mqtt_keep_alive_secs,
        reconnect_delay_secs: config.mqtt_reconnect_delay_secs,
    });

    let gateway = match IngestGateway::new(
        registry,
        records,
        command_store,
        plugins,
        IngestGatewayConfig {
            http_bind_addr: config.http_bind_addr.clone(),
            mqtt,
            broadcast_capacity: config.broadcast_capacity,
        },
    ) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to initialize ingest gateway: {}", e);
            std::process::exit(1);
        }
    };

    // Build runner with all processes
    let mut runner = Runner::new();
    for (name, process) in gateway.into_processes() {
        runner = runner.with_boxed_process(name, process);
    }

    // Add cleanup handlers
    runner = runner
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            // Shutdown telemetry and flush pending traces and logs
            shutdown_telemetry(telemetry_providers);
            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10));

    // Run the service
    runner.run().await;
}

async fn initialize_stores(
    config: &ServiceConfig,
) -> anyhow::Result<(Arc<PostgresRecordStore>, Arc<PostgresCommandStore>)> {
    info!("Initializing PostgreSQL...");
    let client = PostgresClient::new(
        &config.postgres_host,
        config.postgres_port,
        &config.postgres_database,
        &config.postgres_username,
        &config.postgres_password,
        config.postgres_max_pool,
    )?;
    tokio::time::timeout(
        Duration::from_secs(config.startup_timeout_secs),
        client.ping(),
    )
    .await??;

    let records = Arc::new(PostgresRecordStore::new(client.clone()));
    let command_store = Arc::new(PostgresCommandStore::new(client));
    command_store.ensure_schema().await?;

    Ok((records, command_store))
}
