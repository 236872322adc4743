//! Worker pool executing steps from the task queue

use crate::metrics::Metrics;
use crate::models::{Step, StepCompletion, StepState};
use crate::persistence::Store;
use crate::queue::TaskQueue;
use crate::runners::StepRunner;
use chrono::Utc;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything a worker task needs to process one step
#[derive(Clone)]
pub struct Worker {
    queue: TaskQueue,
    store: Arc<dyn Store>,
    runner: Arc<dyn StepRunner>,
    working_dir: PathBuf,
    completions: mpsc::Sender<StepCompletion>,
    metrics: Option<Metrics>,
}

impl Worker {
    pub fn new(
        queue: TaskQueue,
        store: Arc<dyn Store>,
        runner: Arc<dyn StepRunner>,
        working_dir: impl Into<PathBuf>,
        completions: mpsc::Sender<StepCompletion>,
    ) -> Self {
        Self {
            queue,
            store,
            runner,
            working_dir: working_dir.into(),
            completions,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execute one dequeued step to a terminal state.
    ///
    /// Returns the completion signal that was emitted, or `None` when the
    /// step was no longer pending and got skipped.
    pub async fn execute_step(&self, step: Step) -> Option<StepCompletion> {
        let mut step = match self.store.get_step_by_id(step.id).await {
            Ok(current) if current.state != StepState::Pending => {
                debug!(
                    "Skipping step {} ({}): already {}",
                    current.id, current.name, current.state
                );
                return None;
            }
            Ok(current) => current,
            Err(e) => {
                warn!("Could not re-read step {} before running it: {}", step.id, e);
                step
            }
        };

        step.state = StepState::Running;
        step.start_date = Some(Utc::now());
        step.end_date = None;
        step.detail = None;
        if let Err(e) = self.store.update_step_state(&step).await {
            error!("Failed to persist running state of step {}: {}", step.id, e);
        }

        info!("Running step {} ({}) of map {}", step.id, step.name, step.map_id);

        if let Some(metrics) = &self.metrics {
            metrics.inc_active_steps();
        }
        let started = Instant::now();
        let outcome = self.runner.run(&step.command, &self.working_dir).await;
        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.dec_active_steps();
        }

        match outcome {
            Ok(result) if result.success => {
                info!("Step {} ({}) completed in {:?}", step.id, step.name, elapsed);
                step.state = StepState::Completed;
                step.detail = Some(result.output);
            }
            Ok(result) => {
                error!(
                    "Step {} ({}) failed with exit code {:?}: {}",
                    step.id, step.name, result.exit_code, result.output
                );
                step.state = StepState::Failed;
                step.detail = Some(match result.exit_code {
                    Some(code) => format!("exit code {}: {}", code, result.output),
                    None => format!("terminated by signal: {}", result.output),
                });
            }
            Err(e) => {
                error!("Step {} ({}) could not be run: {}", step.id, step.name, e);
                step.state = StepState::Failed;
                step.detail = Some(e.to_string());
            }
        }
        step.end_date = Some(Utc::now());

        if let Err(e) = self.store.update_step_state(&step).await {
            error!(
                "Failed to persist {} state of step {}: {}",
                step.state, step.id, e
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_step_execution(step.state.as_str(), elapsed.as_secs_f64());
        }

        let completion = StepCompletion {
            step_id: step.id,
            map_id: step.map_id,
            state: step.state,
        };
        match self.completions.try_send(completion) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Completion channel full, dropping signal for step {}", step.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Completion channel closed, dropping signal for step {}", step.id);
            }
        }

        Some(completion)
    }

    async fn run(self, id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker {} started", id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let step = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                step = self.queue.dequeue() => step,
            };

            match step {
                Some(step) => {
                    self.execute_step(step).await;
                }
                None => break,
            }
        }

        debug!("Worker {} stopped", id);
    }
}

/// Fixed set of workers sharing one task queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `count` workers (minimum 1) on the current runtime
    pub fn start(worker: Worker, count: usize) -> Self {
        let count = count.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..count)
            .map(|id| tokio::spawn(worker.clone().run(id, shutdown_rx.clone())))
            .collect();

        info!("Started worker pool with {} workers", count);
        Self {
            handles,
            shutdown_tx,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop dequeuing and wait for in-flight steps to finish
    pub async fn shutdown(self) {
        info!("Draining worker pool...");
        let _ = self.shutdown_tx.send(true);

        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MapflowError;
    use crate::models::{ExecutionResult, MapId};
    use crate::runners::MockStepRunner;
    use crate::state::SqliteStore;
    use std::time::Duration;

    fn result(success: bool, exit_code: i32, output: &str) -> ExecutionResult {
        ExecutionResult {
            success,
            output: output.to_string(),
            exit_code: Some(exit_code),
            duration: Duration::from_millis(5),
            output_truncated: false,
        }
    }

    fn seeded_store() -> (Arc<SqliteStore>, MapId, Step) {
        let store = SqliteStore::in_memory().unwrap();
        let map_id = store
            .insert_map("nightly", "0 2 * * *", true, Utc::now())
            .unwrap();
        let mut step = Step::new("extract", map_id, "etl/extract.py");
        step.id = store.insert_step(&step).unwrap();
        (Arc::new(store), map_id, step)
    }

    fn worker(
        store: Arc<SqliteStore>,
        runner: MockStepRunner,
        capacity: usize,
    ) -> (Worker, mpsc::Receiver<StepCompletion>) {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = Worker::new(TaskQueue::new(4), store, Arc::new(runner), "/srv/jobs", tx);
        (worker, rx)
    }

    #[tokio::test]
    async fn test_success_persists_completed() {
        let (store, map_id, step) = seeded_store();

        let mut runner = MockStepRunner::new();
        runner
            .expect_run()
            .withf(|command, dir| command == "etl/extract.py" && dir == std::path::Path::new("/srv/jobs"))
            .times(1)
            .returning(|_, _| Ok(result(true, 0, "42 rows")));

        let (worker, mut rx) = worker(store.clone(), runner, 4);
        let completion = worker.execute_step(step.clone()).await.unwrap();

        assert_eq!(completion.state, StepState::Completed);
        assert_eq!(completion.map_id, map_id);
        assert_eq!(rx.recv().await, Some(completion));

        let stored = store.get_step_by_id(step.id).await.unwrap();
        assert_eq!(stored.state, StepState::Completed);
        assert_eq!(stored.detail.as_deref(), Some("42 rows"));
        assert!(stored.start_date.is_some());
        assert!(stored.end_date >= stored.start_date);
    }

    #[tokio::test]
    async fn test_running_state_persisted_before_execution() {
        let (store, _, step) = seeded_store();
        let observer = store.clone();
        let step_id = step.id;

        let mut runner = MockStepRunner::new();
        runner.expect_run().returning(move |_, _| {
            let seen = futures::executor::block_on(observer.get_step_by_id(step_id)).unwrap();
            assert_eq!(seen.state, StepState::Running);
            Ok(result(true, 0, ""))
        });

        let (worker, _rx) = worker(store, runner, 4);
        worker.execute_step(step).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_persists_failed() {
        let (store, _, step) = seeded_store();

        let mut runner = MockStepRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(result(false, 2, "missing input file")));

        let (worker, _rx) = worker(store.clone(), runner, 4);
        let completion = worker.execute_step(step.clone()).await.unwrap();
        assert_eq!(completion.state, StepState::Failed);

        let stored = store.get_step_by_id(step.id).await.unwrap();
        assert_eq!(stored.state, StepState::Failed);
        assert_eq!(
            stored.detail.as_deref(),
            Some("exit code 2: missing input file")
        );
    }

    #[tokio::test]
    async fn test_runner_error_persists_failed() {
        let (store, _, step) = seeded_store();

        let mut runner = MockStepRunner::new();
        runner.expect_run().returning(|command, _| {
            Err(MapflowError::StepTimeout {
                command: command.to_string(),
                timeout: 30,
            })
        });

        let (worker, _rx) = worker(store.clone(), runner, 4);
        let completion = worker.execute_step(step.clone()).await.unwrap();
        assert_eq!(completion.state, StepState::Failed);

        let stored = store.get_step_by_id(step.id).await.unwrap();
        assert_eq!(stored.state, StepState::Failed);
        assert!(stored.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_non_pending_step_is_skipped() {
        let (store, _, mut step) = seeded_store();
        step.state = StepState::Completed;
        store.update_step_state(&step).await.unwrap();

        let mut runner = MockStepRunner::new();
        runner.expect_run().times(0);

        let (worker, mut rx) = worker(store, runner, 4);
        step.state = StepState::Pending;
        assert!(worker.execute_step(step).await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_completion_channel_does_not_block() {
        let (store, _, step) = seeded_store();

        let mut runner = MockStepRunner::new();
        runner.expect_run().returning(|_, _| Ok(result(true, 0, "ok")));

        let (worker, mut rx) = worker(store.clone(), runner, 1);
        worker
            .completions
            .try_send(StepCompletion {
                step_id: 0,
                map_id: 0,
                state: StepState::Completed,
            })
            .unwrap();

        let completion = tokio::time::timeout(Duration::from_secs(1), worker.execute_step(step.clone()))
            .await
            .expect("worker blocked on a full completion channel");
        assert!(completion.is_some());

        assert_eq!(rx.recv().await.unwrap().step_id, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            store.get_step_by_id(step.id).await.unwrap().state,
            StepState::Completed
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_still_signals() {
        let mut store = crate::persistence::MockStore::new();
        store
            .expect_get_step_by_id()
            .returning(|id| Err(MapflowError::StepNotFound(id)));
        store
            .expect_update_step_state()
            .times(2)
            .returning(|_| Err(MapflowError::Persistence("read-only database".to_string())));

        let mut runner = MockStepRunner::new();
        runner.expect_run().returning(|_, _| Ok(result(true, 0, "")));

        let (tx, mut rx) = mpsc::channel(1);
        let worker = Worker::new(TaskQueue::new(1), Arc::new(store), Arc::new(runner), ".", tx);

        let mut step = Step::new("load", 9, "load.sh");
        step.id = 90;
        worker.execute_step(step).await.unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.step_id, 90);
        assert_eq!(completion.state, StepState::Completed);
    }

    #[tokio::test]
    async fn test_pool_processes_queue_and_drains() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let map_id = store
            .insert_map("batch", "* * * * *", true, Utc::now())
            .unwrap();

        let queue = TaskQueue::new(2);
        let mut runner = MockStepRunner::new();
        runner.expect_run().times(5).returning(|_, _| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(result(true, 0, "done"))
        });

        let (tx, mut rx) = mpsc::channel(16);
        let worker = Worker::new(queue.clone(), store.clone(), Arc::new(runner), ".", tx);
        let pool = WorkerPool::start(worker, 3);
        assert_eq!(pool.size(), 3);

        for i in 0..5 {
            let mut step = Step::new(format!("s{}", i), map_id, "job.sh");
            step.id = store.insert_step(&step).unwrap();
            queue.enqueue(step).await.unwrap();
        }

        let mut finished = Vec::new();
        for _ in 0..5 {
            let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            finished.push(completion.step_id);
        }
        finished.sort_unstable();
        finished.dedup();
        assert_eq!(finished.len(), 5);

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("pool did not drain");

        let steps = store.get_steps_for_map(map_id).await.unwrap();
        assert!(steps.iter().all(|s| s.state == StepState::Completed));
    }

    #[tokio::test]
    async fn test_zero_workers_clamped() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let worker = Worker::new(
            TaskQueue::new(1),
            store,
            Arc::new(MockStepRunner::new()),
            ".",
            tx,
        );

        let pool = WorkerPool::start(worker, 0);
        assert_eq!(pool.size(), 1);
        pool.shutdown().await;
    }
}
