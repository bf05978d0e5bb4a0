//! One-shot batch compaction over a device's stored history.
//!
//! The ingest path already compacts incrementally as records arrive;
//! this tool reworks a whole collection, for example after a registry
//! change or an import of historical data.
//!
//! ```bash
//! compact-device greenhouse-7
//! compact-device greenhouse-7 --postgres-host db.local --flush-batch 500
//! ```

use std::sync::Arc;

use clap::Parser;
use homestead_domain::{Compactor, RecordStore};
use homestead_postgres::{PostgresClient, PostgresRecordStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Batch redundancy compaction for one device collection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Device whose collection should be compacted
    device_id: String,

    /// PostgreSQL host
    #[arg(long, default_value = "localhost")]
    postgres_host: String,

    /// PostgreSQL port
    #[arg(long, default_value = "5432")]
    postgres_port: u16,

    /// PostgreSQL database name
    #[arg(long, default_value = "homestead")]
    postgres_database: String,

    /// PostgreSQL username
    #[arg(long, default_value = "homestead")]
    postgres_username: String,

    /// PostgreSQL password
    #[arg(long, default_value = "homestead")]
    postgres_password: String,

    /// Accumulated removals per storage flush
    #[arg(long, default_value = "1000")]
    flush_batch: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = PostgresClient::new(
        &args.postgres_host,
        args.postgres_port,
        &args.postgres_database,
        &args.postgres_username,
        &args.postgres_password,
        2,
    )?;
    client.ping().await?;

    let records: Arc<dyn RecordStore> = Arc::new(PostgresRecordStore::new(client));
    let compactor = Compactor::new(records).with_flush_batch(args.flush_batch);

    info!(device_id = %args.device_id, "starting batch compaction");
    let report = compactor.compact_device(&args.device_id).await?;
    info!(
        device_id = %args.device_id,
        records_scanned = report.records_scanned,
        values_removed = report.values_removed,
        "batch compaction finished"
    );

    println!(
        "{}: scanned {} records, removed {} redundant values",
        args.device_id, report.records_scanned, report.values_removed
    );

    Ok(())
}
