//! Basic example of using the homestead-runner
//!
//! This example demonstrates:
//! - Running multiple named processes concurrently
//! - Graceful shutdown on SIGTERM/SIGINT (Ctrl+C)
//! - Cleanup with closers
//!
//! Run with: cargo run --example basic_runner

use homestead_runner::Runner;
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting runner example");

    let runner = Runner::new()
        // First process: pretends to poll devices every second
        .with_named_process("poller", |ctx| async move {
            let mut polls = 0;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        tracing::info!("Poller stopping gracefully after {} polls", polls);
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        polls += 1;
                        tracing::info!("Poll #{}", polls);
                    }
                }
            }
            Ok(())
        })
        // Second process: heartbeat every 2 seconds
        .with_named_process("heartbeat", |ctx| async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        tracing::info!("Heartbeat stopping gracefully");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {
                        tracing::info!("Heartbeat: still running...");
                    }
                }
            }
            Ok(())
        })
        // Third process: simulates an error after 30 seconds (if not cancelled first)
        .with_named_process("flaky", |ctx| async move {
            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::info!("Flaky process stopping gracefully");
                    Ok(())
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    tracing::error!("Simulated error occurred!");
                    Err(anyhow::anyhow!("simulated error after 30 seconds"))
                }
            }
        })
        // Add cleanup closers
        .with_closer(|| async move {
            tracing::info!("Closer 1: draining command queue...");
            tokio::time::sleep(Duration::from_millis(500)).await;
            tracing::info!("Closer 1: done");
            Ok(())
        })
        .with_closer(|| async move {
            tracing::info!("Closer 2: flushing telemetry...");
            tokio::time::sleep(Duration::from_millis(300)).await;
            tracing::info!("Closer 2: done");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(5));

    tracing::info!("Press Ctrl+C to trigger graceful shutdown");
    runner.run().await;
}
