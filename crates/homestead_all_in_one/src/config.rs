use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // HTTP ingest configuration
    /// Bind address for the HTTP ingest API
    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: String,

    // Device registry configuration
    /// Path to the device registry JSON file
    #[serde(default = "default_device_config_path")]
    pub device_config_path: String,

    // PostgreSQL configuration
    /// PostgreSQL host
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    /// PostgreSQL port
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    /// PostgreSQL database name
    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    /// PostgreSQL username
    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    /// PostgreSQL password
    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    /// PostgreSQL connection pool size
    #[serde(default = "default_postgres_max_pool")]
    pub postgres_max_pool: usize,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // MQTT configuration
    /// Enable the MQTT transport
    #[serde(default = "default_mqtt_enabled")]
    pub mqtt_enabled: bool,

    /// MQTT broker URL
    #[serde(default = "default_mqtt_broker_url")]
    pub mqtt_broker_url: String,

    /// MQTT client identifier
    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    /// MQTT keep-alive interval in seconds
    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// Delay between MQTT reconnect attempts in seconds
    #[serde(default = "default_mqtt_reconnect_delay_secs")]
    pub mqtt_reconnect_delay_secs: u64,

    // Broadcast configuration
    /// Capacity of the observer broadcast channel
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Enable OpenTelemetry export
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    /// Service name for OpenTelemetry resource
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

// HTTP defaults
fn default_http_bind_addr() -> String {
    "0.0.0.0:8101".to_string()
}

// Device registry defaults
fn default_device_config_path() -> String {
    "config/devices.json".to_string()
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "homestead".to_string()
}

fn default_postgres_username() -> String {
    "homestead".to_string()
}

fn default_postgres_password() -> String {
    "homestead".to_string()
}

fn default_postgres_max_pool() -> usize {
    5
}

fn default_startup_timeout_secs() -> u64 {
    30
}

// MQTT defaults
fn default_mqtt_enabled() -> bool {
    true
}

fn default_mqtt_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    "homestead-ingest".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    30
}

fn default_mqtt_reconnect_delay_secs() -> u64 {
    5
}

// Broadcast defaults
fn default_broadcast_capacity() -> usize {
    256
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "homestead-all-in-one".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("HOMESTEAD"))
            .build()?
            .try_deserialize()
    }
}
