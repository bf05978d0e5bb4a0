//! Concurrent process runner with graceful shutdown for the homestead
//! services: the HTTP listener, the MQTT ingest loop, and any other
//! long-running process share one cancellation token, and closers run
//! after every process has stopped.
//!
//! # Example
//!
//! ```no_run
//! use homestead_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = Runner::new()
//!         .with_named_process("heartbeat", |ctx| async move {
//!             loop {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => break,
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::debug!("tick");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move {
//!             tracing::info!("flushing telemetry");
//!             Ok(())
//!         })
//!         .with_closer_timeout(Duration::from_secs(5));
//!
//!     runner.run().await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A long-running process: takes a cancellation token, resolves when
/// the process ends.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>
        + Send,
>;

/// Cleanup hook executed after all processes have stopped.
pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>> + Send>;

/// Runs named app processes concurrently until one fails or a shutdown
/// signal arrives, then cancels the rest and executes closers under a
/// timeout. `run` exits the process: 0 on a clean stop, 1 when a
/// process errored.
pub struct Runner {
    processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Adds a process under a name that shows up in lifecycle logs.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Adds an already boxed process, for callers that assemble their
    /// process list dynamically.
    pub fn with_boxed_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.processes.push((name.into(), process));
        self
    }

    /// Closers run after all processes stop, error or not. Every
    /// closer is attempted even when some fail.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// External control over cancellation, mainly for tests.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub async fn run(self) {
        let token = Arc::new(self.cancellation_token);
        let mut join_set = JoinSet::new();
        let closer_timeout = self.closer_timeout;
        let closers = self.closers;

        for (name, process) in self.processes {
            let process_token = token.clone();
            join_set.spawn(async move {
                tracing::info!(process = %name, "process starting");
                let result = process((*process_token).clone()).await;
                (name, result)
            });
        }

        let signal_token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("received shutdown signal");
                    signal_token.cancel();
                }
                Err(err) => {
                    tracing::error!("error setting up signal handler: {err}");
                }
            }
        });

        #[cfg(unix)]
        {
            let sigterm_token = token.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("received SIGTERM");
                        sigterm_token.cancel();
                    }
                    Err(err) => {
                        tracing::error!("error setting up SIGTERM handler: {err}");
                    }
                }
            });
        }

        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((name, Ok(()))) => {
                    tracing::info!(process = %name, "process finished");
                }
                Ok((name, Err(err))) => {
                    if !token.is_cancelled() {
                        tracing::error!(process = %name, "process error: {err:#}");
                        first_error = Some(err);
                        token.cancel();
                    } else {
                        tracing::warn!(process = %name, "process error during shutdown: {err:#}");
                    }
                }
                Err(err) => {
                    tracing::error!("process panicked: {err}");
                    if !token.is_cancelled() {
                        token.cancel();
                    }
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        join_set.shutdown().await;

        if !closers.is_empty() {
            tracing::info!("running closers with timeout of {closer_timeout:?}");
            match tokio::time::timeout(closer_timeout, Self::run_closers(closers)).await {
                Ok(()) => tracing::info!("all closers completed"),
                Err(_) => tracing::error!("closers timed out after {closer_timeout:?}"),
            }
        }

        if let Some(err) = first_error {
            tracing::error!("exiting with error: {err:#}");
            std::process::exit(1);
        } else {
            tracing::info!("exiting normally");
            std::process::exit(0);
        }
    }

    async fn run_closers(closers: Vec<Closer>) {
        let mut closer_set = JoinSet::new();
        for closer in closers {
            closer_set.spawn(async move { closer().await });
        }
        while let Some(result) = closer_set.join_next().await {
            match result {
                Ok(Ok(())) => tracing::debug!("closer completed"),
                Ok(Err(err)) => tracing::error!("closer error: {err:#}"),
                Err(err) => tracing::error!("closer panicked: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    // run() calls std::process::exit, so the pieces are exercised
    // separately instead of through a full run.

    #[tokio::test]
    async fn closers_all_execute() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut runner = Runner::new();
        for _ in 0..3 {
            let ran = ran.clone();
            runner = runner.with_closer(move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        Runner::run_closers(runner.closers).await;
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_closers_do_not_block_others() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let runner = Runner::new()
            .with_closer(|| async move { Err(anyhow::anyhow!("cleanup failed")) })
            .with_closer(move || async move {
                ran_clone.store(true, Ordering::SeqCst);
                Ok(())
            });
        Runner::run_closers(runner.closers).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn processes_observe_the_shared_token() {
        let token = CancellationToken::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        let runner = Runner::new()
            .with_named_process("waiter", move |ctx| async move {
                ctx.cancelled().await;
                stopped_clone.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token.clone());

        // Drive the process the way run() does, without the exit.
        let (name, process) = runner.processes.into_iter().next().unwrap();
        assert_eq!(name, "waiter");
        let handle = tokio::spawn(process(token.clone()));
        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
