use thiserror::Error;

/// Errors surfaced by the ingestion pipeline and its stores.
///
/// Rejection-style variants (`MissingDeviceId`, `UnknownDevice`,
/// `ProtocolNotAllowed`) are mapped to transport responses by the
/// ingest service; only `Store` failures bubble out of it.
#[derive(Error, Debug)]
pub enum DomainError {
    #[error("payload carries no resolvable device id")]
    MissingDeviceId,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("no configuration for device: {0}")]
    UnknownDevice(String),

    #[error("device {device_id} does not accept ingestion over {protocol}")]
    ProtocolNotAllowed { device_id: String, protocol: String },

    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
