mod broadcast;
mod http;
mod ingest_gateway;
pub mod mqtt;

pub use broadcast::*;
pub use http::*;
pub use ingest_gateway::*;
