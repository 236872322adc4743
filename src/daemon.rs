//! Process wiring for mapflow
//!
//! The daemon owns the store, the task queue, the worker pool and the
//! scheduler loop:
//! - steps left `running` by a previous process are marked failed on startup
//! - SIGTERM and SIGINT trigger a graceful shutdown
//! - shutdown stops the scheduler first, then drains the worker pool so that
//!   in-flight steps finish and persist their final state
//!
//! # Example
//!
//! ```no_run
//! use mapflow::config::SchedulerConfig;
//! use mapflow::daemon::Daemon;
//!
//! # async fn example() -> mapflow::error::Result<()> {
//! let daemon = Daemon::new(SchedulerConfig::default())?;
//!
//! // Blocks until SIGTERM/SIGINT
//! daemon.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::SchedulerConfig;
use crate::error::{MapflowError, Result};
use crate::metrics::Metrics;
use crate::models::{Map, StepCompletion, StepId, StepState};
use crate::persistence::Store;
use crate::queue::TaskQueue;
use crate::runners::shell::ShellRunner;
use crate::runners::StepRunner;
use crate::scheduler::Scheduler;
use crate::state::SqliteStore;
use crate::worker::{Worker, WorkerPool};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Buffer of the completion channel between workers and the scheduler loop
const COMPLETION_BUFFER: usize = 256;

/// Longest wait between state checks of a one-shot run
const RUN_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Long-running scheduler process
pub struct Daemon {
    config: SchedulerConfig,
    store: Arc<SqliteStore>,
    runner: Arc<dyn StepRunner>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Daemon {
    /// Open the configured database and prepare the daemon.
    ///
    /// # Errors
    ///
    /// * `MapflowError::Database` - If the store cannot be opened
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        info!("Initializing mapflow daemon");
        let store = Arc::new(SqliteStore::new(&config.database)?);
        Ok(Self::with_store(config, store))
    }

    /// Daemon over an already opened store
    pub fn with_store(config: SchedulerConfig, store: Arc<SqliteStore>) -> Self {
        let mut runner = ShellRunner::new();
        if let Some(interpreter) = &config.interpreter {
            runner = runner.with_interpreter(interpreter.clone());
        }
        if let Some(timeout) = config.step_timeout() {
            runner = runner.with_timeout(timeout);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            store,
            runner: Arc::new(runner),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Replace the step runner
    pub fn with_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }

    fn worker(&self, queue: &TaskQueue, completions: mpsc::Sender<StepCompletion>) -> Worker {
        Worker::new(
            queue.clone(),
            self.store.clone(),
            self.runner.clone(),
            self.config.working_directory.clone(),
            completions,
        )
    }

    /// Run until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        info!("Starting mapflow daemon");

        let recovered = self.store.recover_interrupted().await?;
        if !recovered.is_empty() {
            warn!(
                "Marked {} interrupted steps as failed on startup",
                recovered.len()
            );
        }

        let metrics = Metrics::new()?;
        if let Some(port) = self.config.metrics_port {
            metrics.start(port).await?;
        }

        let queue = TaskQueue::new(self.config.queue_capacity);
        let (completions_tx, completions_rx) = mpsc::channel(COMPLETION_BUFFER);

        let pool = WorkerPool::start(
            self.worker(&queue, completions_tx).with_metrics(metrics.clone()),
            self.config.worker_count,
        );

        let scheduler = Arc::new(
            Scheduler::new(self.store.clone(), Arc::new(queue), completions_rx)
                .with_metrics(metrics),
        );
        let scheduler_task = {
            let scheduler = scheduler.clone();
            let poll_interval = self.config.poll_interval();
            let shutdown_rx = self.shutdown_rx.clone();
            tokio::spawn(async move { scheduler.run(poll_interval, shutdown_rx).await })
        };

        info!(
            "Daemon started ({} workers, queue capacity {}), waiting for signals...",
            pool.size(),
            self.config.queue_capacity
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            received = wait_for_signal() => {
                let name = received?;
                info!("Received {}, initiating graceful shutdown", name);
            }
            _ = shutdown_rx.changed() => {
                info!("Shutdown requested");
            }
        }

        let _ = self.shutdown_tx.send(true);

        if let Err(e) = scheduler_task.await {
            error!("Scheduler task failed: {}", e);
        }
        pool.shutdown().await;

        info!("Daemon shutdown complete");
        Ok(())
    }

    /// Ask a running daemon to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run one map to completion in-process, ignoring its schedule.
    ///
    /// `reference` is a map ID or name. Returns the map with the final state
    /// of its steps. Steps whose dependencies failed stay pending.
    pub async fn run_map_once(&self, reference: &str) -> Result<Map> {
        let map = self.store.resolve_map(reference)?;
        info!("Running map '{}' (id: {}) once", map.name, map.id);

        let queue = TaskQueue::new(self.config.queue_capacity);
        // Every step completes at most once per run, so no signal is dropped
        let (completions_tx, completions_rx) = mpsc::channel(map.steps.len().max(1));

        let pool = WorkerPool::start(
            self.worker(&queue, completions_tx),
            self.config.worker_count,
        );
        let scheduler = Scheduler::new(self.store.clone(), Arc::new(queue), completions_rx);

        let result =
            drive_to_completion(&scheduler, self.store.as_ref(), &map, RUN_RECHECK_INTERVAL).await;
        pool.shutdown().await;
        result?;

        self.store.get_map(map.id)
    }
}

/// Dispatch newly ready steps until nothing of the run is left to wait for.
///
/// Step states are re-read after every completion signal and at least every
/// `recheck`, so steps executed by another process sharing the database do
/// not stall the run.
async fn drive_to_completion(
    scheduler: &Scheduler,
    store: &SqliteStore,
    map: &Map,
    recheck: Duration,
) -> Result<()> {
    let mut dispatched: HashSet<StepId> = scheduler.start_run(map).await?.into_iter().collect();

    loop {
        let mut current = store.get_map(map.id)?;
        let waiting = current.steps.iter().any(|s| {
            s.state == StepState::Running
                || (s.state == StepState::Pending && dispatched.contains(&s.id))
        });

        current.steps.retain(|s| !dispatched.contains(&s.id));
        let enqueued = scheduler.schedule_on_demand(&current).await?;
        if !waiting && enqueued.is_empty() {
            return Ok(());
        }
        dispatched.extend(enqueued);

        if let Ok(None) = tokio::time::timeout(recheck, scheduler.next_completion()).await {
            return Err(MapflowError::Other(
                "workers stopped before the run finished".to_string(),
            ));
        }
    }
}

async fn wait_for_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| MapflowError::Other(format!("Failed to setup SIGTERM handler: {}", e)))?;

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| MapflowError::Other(format!("Failed to setup SIGINT handler: {}", e)))?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}
