//! Trigger evaluation and dispatch of ready steps
//!
//! Every evaluation cycle re-reads the active maps from the store. A map whose
//! cron trigger is due starts a new run: steps left terminal by the previous
//! run are reset to pending and the root steps are enqueued. While a run is in
//! progress the following cycles keep enqueueing steps whose dependencies have
//! completed in the meantime, so dependents wait at most one poll interval.

use crate::dag::{is_ready, topological_order, StepLookup};
use crate::error::{MapflowError, Result};
use crate::metrics::Metrics;
use crate::models::{Map, Step, StepCompletion, StepId, StepState};
use crate::persistence::Store;
use crate::queue::StepSink;
use crate::schedule::{self, Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Summary of one evaluation cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub maps_evaluated: usize,
    /// Maps whose trigger fired and started a new run
    pub maps_triggered: usize,
    /// Maps with a run in progress that were advanced
    pub maps_continued: usize,
    /// Maps skipped because of an error
    pub maps_skipped: usize,
    pub steps_enqueued: usize,
    /// The previous cycle was still running, nothing was evaluated
    pub overlapped: bool,
}

enum MapOutcome {
    Triggered(usize),
    Continued(usize),
    Idle,
}

/// Periodic scheduler over a [`Store`]
pub struct Scheduler {
    store: Arc<dyn Store>,
    sink: Arc<dyn StepSink>,
    clock: Arc<dyn Clock>,
    completions: Mutex<mpsc::Receiver<StepCompletion>>,
    cycle_lock: Mutex<()>,
    metrics: Option<Metrics>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        sink: Arc<dyn StepSink>,
        completions: mpsc::Receiver<StepCompletion>,
    ) -> Self {
        Self {
            store,
            sink,
            clock: Arc::new(SystemClock),
            completions: Mutex::new(completions),
            cycle_lock: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Evaluate every active map once.
    ///
    /// Errors scoped to one map are logged and the map is skipped. Only a
    /// failure to list the active maps is returned.
    pub async fn evaluation_cycle(&self) -> Result<CycleReport> {
        let _guard = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Previous evaluation cycle still running, skipping this one");
                return Ok(CycleReport {
                    overlapped: true,
                    ..CycleReport::default()
                });
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_cycle();
        }

        let now = self.clock.now();
        let maps = self.store.list_active_maps().await?;
        debug!("Evaluating {} active maps at {}", maps.len(), now);

        let mut report = CycleReport::default();
        for map in &maps {
            report.maps_evaluated += 1;

            let outcome = match self.evaluate_map(map, now).await {
                Ok(MapOutcome::Triggered(count)) => {
                    report.maps_triggered += 1;
                    report.steps_enqueued += count;
                    "triggered"
                }
                Ok(MapOutcome::Continued(count)) => {
                    report.maps_continued += 1;
                    report.steps_enqueued += count;
                    "continued"
                }
                Ok(MapOutcome::Idle) => "idle",
                Err(e) => {
                    log_map_error(map, &e);
                    report.maps_skipped += 1;
                    "skipped"
                }
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_map_evaluation(outcome);
            }
        }

        if report.steps_enqueued > 0 || report.maps_skipped > 0 {
            info!(
                "Evaluation cycle: {} maps, {} triggered, {} continued, {} skipped, {} steps enqueued",
                report.maps_evaluated,
                report.maps_triggered,
                report.maps_continued,
                report.maps_skipped,
                report.steps_enqueued
            );
        }

        Ok(report)
    }

    async fn evaluate_map(&self, map: &Map, now: DateTime<Utc>) -> Result<MapOutcome> {
        let due = schedule::should_trigger(map, now)?;

        let steps = self.store.get_steps_for_map(map.id).await?;
        topological_order(&steps)?;

        if run_in_progress(self.store.as_ref(), &steps).await? {
            if due {
                debug!(
                    "Map '{}' is due but its previous run is still in progress, deferring",
                    map.name
                );
            }
            let enqueued = self.dispatch_ready(&steps).await?;
            return Ok(MapOutcome::Continued(enqueued.len()));
        }

        if !due {
            return Ok(MapOutcome::Idle);
        }

        info!("Map '{}' (id: {}) triggered", map.name, map.id);
        let enqueued = self.begin_run(map, steps, now).await?;
        Ok(MapOutcome::Triggered(enqueued.len()))
    }

    /// Whether `map`'s cron trigger is due according to the scheduler clock
    pub fn should_trigger(&self, map: &Map) -> Result<bool> {
        schedule::should_trigger(map, self.clock.now())
    }

    /// Start a run of `map` now, regardless of its schedule.
    ///
    /// Fails with [`MapflowError::Validation`] when a run is already in
    /// progress. Returns the IDs of the enqueued steps.
    pub async fn start_run(&self, map: &Map) -> Result<Vec<StepId>> {
        let steps = self.store.get_steps_for_map(map.id).await?;
        topological_order(&steps)?;

        if run_in_progress(self.store.as_ref(), &steps).await? {
            return Err(MapflowError::Validation(format!(
                "Map '{}' already has a run in progress",
                map.name
            )));
        }

        info!("Starting run of map '{}' (id: {})", map.name, map.id);
        self.begin_run(map, steps, self.clock.now()).await
    }

    async fn begin_run(
        &self,
        map: &Map,
        mut steps: Vec<Step>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StepId>> {
        for step in steps.iter_mut().filter(|s| s.state.is_terminal()) {
            step.reset();
            self.store.update_step_state(step).await?;
        }

        let enqueued = self.dispatch_ready(&steps).await?;
        self.store.update_map_last_run(map.id, now).await?;
        Ok(enqueued)
    }

    /// Enqueue every pending step whose dependencies completed, in step order
    async fn dispatch_ready(&self, steps: &[Step]) -> Result<Vec<StepId>> {
        let mut enqueued = Vec::new();
        for step in steps.iter().filter(|s| s.state == StepState::Pending) {
            if is_ready(step, self.store.as_ref()).await {
                debug!("Step {} ({}) is ready", step.id, step.name);
                self.sink.enqueue(step.clone()).await?;
                enqueued.push(step.id);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_enqueued(enqueued.len());
        }
        Ok(enqueued)
    }

    /// Dispatch ready steps of a supplied map immediately.
    ///
    /// Neither the map nor its step list is re-read and the cron trigger is
    /// not consulted. Each step's own state is refreshed by ID so steps that
    /// already ran are not enqueued again; steps unknown to the store are
    /// taken as supplied. Returns the IDs of the enqueued steps.
    pub async fn schedule_on_demand(&self, map: &Map) -> Result<Vec<StepId>> {
        topological_order(&map.steps)?;

        let lookup = SuppliedLookup {
            store: self.store.as_ref(),
            supplied: map.steps.iter().map(|s| (s.id, s.clone())).collect(),
        };

        let mut enqueued = Vec::new();
        for step in &map.steps {
            let current = match lookup.step_by_id(step.id).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("Could not refresh step {} ({}): {}", step.id, step.name, e);
                    continue;
                }
            };

            if current.state != StepState::Pending {
                continue;
            }

            if is_ready(&current, &lookup).await {
                let id = current.id;
                self.sink.enqueue(current).await?;
                enqueued.push(id);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_enqueued(enqueued.len());
        }
        if !enqueued.is_empty() {
            info!(
                "On-demand dispatch of map '{}' enqueued {} steps",
                map.name,
                enqueued.len()
            );
        }
        Ok(enqueued)
    }

    /// Record a completion signal from a worker
    pub fn report_completion(&self, completion: StepCompletion) {
        info!(
            "Step {} of map {} finished: {}",
            completion.step_id, completion.map_id, completion.state
        );
    }

    /// Wait for the next completion signal.
    ///
    /// Returns `None` once every worker is gone. Blocks while [`Scheduler::run`]
    /// is active, which owns the receiver for its whole lifetime.
    pub async fn next_completion(&self) -> Option<StepCompletion> {
        let completion = self.completions.lock().await.recv().await?;
        self.report_completion(completion);
        Some(completion)
    }

    /// Run evaluation cycles every `poll_interval` until `shutdown` turns true
    pub async fn run(&self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut completions = self.completions.lock().await;

        info!("Scheduler started (poll interval: {:?})", poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluation_cycle().await {
                        error!("Evaluation cycle failed: {}", e);
                    }
                }
                Some(completion) = completions.recv() => {
                    self.report_completion(completion);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }
}

fn log_map_error(map: &Map, error: &MapflowError) {
    match error {
        MapflowError::CycleDetected(path) => {
            error!(
                "Map '{}' (id: {}) has a dependency cycle ({}), no steps enqueued",
                map.name, map.id, path
            );
        }
        MapflowError::ScheduleParse { expression, reason } => {
            error!(
                "Map '{}' (id: {}) has an invalid schedule '{}': {}",
                map.name, map.id, expression, reason
            );
        }
        e if e.is_persistence() => {
            warn!("Skipping map '{}' (id: {}): {}", map.name, map.id, e);
        }
        e => {
            error!("Skipping map '{}' (id: {}): {}", map.name, map.id, e);
        }
    }
}

/// Whether a run of the map owning `steps` is still in progress.
///
/// True while a step is running, or while some step has left `pending` and a
/// pending step can still become ready. Dependencies on steps of other maps
/// are resolved through the store.
async fn run_in_progress(store: &dyn Store, steps: &[Step]) -> Result<bool> {
    if steps.iter().any(|s| s.state == StepState::Running) {
        return Ok(true);
    }
    if steps.iter().all(|s| s.state == StepState::Pending) {
        return Ok(false);
    }

    let mut by_id: HashMap<StepId, Step> = steps.iter().map(|s| (s.id, s.clone())).collect();
    let mut unresolved: Vec<StepId> = steps
        .iter()
        .flat_map(|s| s.dependencies.iter().copied())
        .filter(|id| !by_id.contains_key(id))
        .collect();
    let mut missing = HashSet::new();

    while let Some(id) = unresolved.pop() {
        if by_id.contains_key(&id) || missing.contains(&id) {
            continue;
        }
        match store.get_step_by_id(id).await {
            Ok(step) => {
                unresolved.extend(step.dependencies.iter().copied());
                by_id.insert(id, step);
            }
            Err(MapflowError::StepNotFound(_)) => {
                missing.insert(id);
            }
            Err(e) => return Err(e),
        }
    }

    let mut blocked = HashMap::with_capacity(by_id.len());
    Ok(steps
        .iter()
        .filter(|s| s.state == StepState::Pending)
        .any(|s| !is_blocked(s.id, &by_id, &mut blocked)))
}

/// A step is blocked when it failed, is unknown to the store, or sits
/// downstream of one
fn is_blocked(id: StepId, by_id: &HashMap<StepId, Step>, memo: &mut HashMap<StepId, bool>) -> bool {
    if let Some(&known) = memo.get(&id) {
        return known;
    }

    let result = match by_id.get(&id) {
        None => true,
        Some(step) => match step.state {
            StepState::Failed => true,
            StepState::Completed => false,
            StepState::Pending | StepState::Running => {
                // Provisional entry stops revisits through a cycle
                memo.insert(id, true);
                step.dependencies
                    .iter()
                    .any(|&dep| is_blocked(dep, by_id, memo))
            }
        },
    };

    memo.insert(id, result);
    result
}

/// Store lookup falling back to the steps of a supplied map
struct SuppliedLookup<'a> {
    store: &'a dyn Store,
    supplied: HashMap<StepId, Step>,
}

#[async_trait]
impl StepLookup for SuppliedLookup<'_> {
    async fn step_by_id(&self, id: StepId) -> Result<Step> {
        match self.store.get_step_by_id(id).await {
            Err(MapflowError::StepNotFound(_)) => self.supplied.step_by_id(id).await,
            other => other,
        }
    }
}
