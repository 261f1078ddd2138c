//! Runs long-lived app processes side by side and shuts them down together.
//!
//! Processes share one cancellation token. The token is cancelled on
//! SIGINT/SIGTERM, when any process fails, or when any process returns.
//! Closers then run once, bounded by a timeout.
//!
//! ```no_run
//! use tally_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_app_process("ticker", |ctx| async move {
//!             ctx.cancelled().await;
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A long-running process; it should return once the token is cancelled
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxFuture + Send>;

/// Cleanup step run after every process has stopped
pub type Closer = Box<dyn FnOnce() -> BoxFuture + Send>;

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Stopped by signal, external cancellation or a process returning cleanly
    Completed,
    /// A process failed or panicked
    Failed { process: String, error: anyhow::Error },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed { .. } => 1,
        }
    }
}

pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout defaults to 10 seconds
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    pub fn with_app_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Add an already boxed process
    pub fn with_named_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.app_processes.push((name.into(), process));
        self
    }

    /// Closers run concurrently; a failing closer does not stop the others
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Skip installing SIGINT/SIGTERM handlers
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Run to completion and exit the process with the outcome's code
    pub async fn run(self) {
        let outcome = self.run_until_complete().await;

        match &outcome {
            RunOutcome::Completed => info!("Application exiting normally"),
            RunOutcome::Failed { process, error } => {
                error!(process = %process, error = %format!("{error:#}"), "Application exiting with error")
            }
        }

        std::process::exit(outcome.exit_code());
    }

    /// Run every process until shutdown, then the closers
    pub async fn run_until_complete(self) -> RunOutcome {
        let token = self.cancellation_token;
        let mut processes = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            processes.spawn(async move { (name, process(process_token).await) });
        }

        if self.handle_signals {
            spawn_signal_handlers(token.clone());
        }

        let mut outcome = RunOutcome::Completed;

        let first = tokio::select! {
            _ = token.cancelled() => None,
            finished = processes.join_next() => finished,
        };

        // One process ending takes the rest down with it
        match first {
            Some(Ok((name, Ok(())))) => debug!(process = %name, "App process completed"),
            Some(Ok((name, Err(error)))) => {
                error!(process = %name, error = %format!("{error:#}"), "App process failed");
                outcome = RunOutcome::Failed {
                    process: name,
                    error,
                };
            }
            Some(Err(e)) => {
                error!(error = %e, "App process panicked");
                outcome = RunOutcome::Failed {
                    process: "unknown".to_string(),
                    error: anyhow::anyhow!("process panicked: {e}"),
                };
            }
            None => {}
        }

        token.cancel();
        while let Some(finished) = processes.join_next().await {
            match finished {
                Ok((name, Ok(()))) => debug!(process = %name, "App process stopped"),
                Ok((name, Err(error))) => {
                    error!(process = %name, error = %format!("{error:#}"), "App process failed during shutdown")
                }
                Err(e) => error!(error = %e, "App process panicked during shutdown"),
            }
        }

        run_closers(self.closers, self.closer_timeout).await;
        outcome
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT");
                ctrl_c_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
                token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    });
}

async fn run_closers(closers: Vec<Closer>, timeout: Duration) {
    if closers.is_empty() {
        return;
    }

    info!(timeout_ms = timeout.as_millis(), "Running closers");

    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }

    let all = async {
        while let Some(result) = closer_set.join_next().await {
            match result {
                Ok(Ok(())) => debug!("Closer completed"),
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "Closer failed"),
                Err(e) => error!(error = %e, "Closer panicked"),
            }
        }
    };

    match tokio::time::timeout(timeout, all).await {
        Ok(()) => info!("All closers completed"),
        Err(_) => error!(timeout_ms = timeout.as_millis(), "Closers timed out"),
    }
}
