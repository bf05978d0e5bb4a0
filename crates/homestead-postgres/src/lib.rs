mod client;
mod command_store;
mod record_store;

pub use client::PostgresClient;
pub use command_store::PostgresCommandStore;
pub use record_store::PostgresRecordStore;
