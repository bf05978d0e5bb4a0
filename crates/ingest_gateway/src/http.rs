mod routes;

pub use routes::{ingest_router, serve_http, HttpState};
