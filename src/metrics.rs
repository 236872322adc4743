//! Prometheus metrics and HTTP endpoint
//!
//! # Available Metrics
//!
//! - `mapflow_evaluation_cycles_total` - Counter of scheduler evaluation cycles
//! - `mapflow_map_evaluations_total{outcome}` - Counter of per-map evaluations
//!   (`triggered`, `continued`, `idle`, `skipped`)
//! - `mapflow_steps_enqueued_total` - Counter of steps handed to the task queue
//! - `mapflow_step_executions_total{state}` - Counter of finished steps by final state
//! - `mapflow_step_duration_seconds` - Histogram of step runtimes
//! - `mapflow_active_steps` - Gauge of steps currently executing
//!
//! # Example
//!
//! ```no_run
//! use mapflow::metrics::Metrics;
//!
//! # async fn example() -> mapflow::error::Result<()> {
//! let metrics = Metrics::new()?;
//! metrics.start(9090).await?;
//!
//! metrics.record_step_execution("completed", 1.5);
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket boundaries for step duration metrics (in seconds)
const STEP_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Metric handles shared by the scheduler and the workers
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    evaluation_cycles: Counter,
    map_evaluations: CounterVec,
    steps_enqueued: Counter,
    step_executions: CounterVec,
    step_duration: Histogram,
    active_steps: Gauge,
}

impl Metrics {
    /// Create and register all metrics in a private registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let evaluation_cycles = Counter::with_opts(Opts::new(
            "mapflow_evaluation_cycles_total",
            "Total number of scheduler evaluation cycles",
        ))?;

        let map_evaluations = CounterVec::new(
            Opts::new(
                "mapflow_map_evaluations_total",
                "Total number of map evaluations by outcome",
            ),
            &["outcome"],
        )?;

        let steps_enqueued = Counter::with_opts(Opts::new(
            "mapflow_steps_enqueued_total",
            "Total number of steps handed to the task queue",
        ))?;

        let step_executions = CounterVec::new(
            Opts::new(
                "mapflow_step_executions_total",
                "Total number of step executions by final state",
            ),
            &["state"],
        )?;

        let step_duration = Histogram::with_opts(
            HistogramOpts::new(
                "mapflow_step_duration_seconds",
                "Step execution duration in seconds",
            )
            .buckets(STEP_DURATION_BUCKETS.to_vec()),
        )?;

        let active_steps = Gauge::with_opts(Opts::new(
            "mapflow_active_steps",
            "Steps currently executing",
        ))?;

        registry.register(Box::new(evaluation_cycles.clone()))?;
        registry.register(Box::new(map_evaluations.clone()))?;
        registry.register(Box::new(steps_enqueued.clone()))?;
        registry.register(Box::new(step_executions.clone()))?;
        registry.register(Box::new(step_duration.clone()))?;
        registry.register(Box::new(active_steps.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            evaluation_cycles,
            map_evaluations,
            steps_enqueued,
            step_executions,
            step_duration,
            active_steps,
        })
    }

    /// Start the HTTP metrics server on `127.0.0.1:port`
    ///
    /// The server exposes `/metrics` in Prometheus text format and answers
    /// 404 for any other path.
    pub async fn start(&self, port: u16) -> Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        let metrics = self.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = metrics.handle_request(stream).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_request(&self, mut stream: tokio::net::TcpStream) -> Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        if request.starts_with("GET /metrics") {
            let body = self.render()?;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
            stream.write_all(response.as_bytes()).await?;
        }

        Ok(())
    }

    /// Encode the registry in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn record_cycle(&self) {
        self.evaluation_cycles.inc();
    }

    /// Record the outcome of evaluating one map
    pub fn record_map_evaluation(&self, outcome: &str) {
        self.map_evaluations.with_label_values(&[outcome]).inc();
    }

    pub fn record_enqueued(&self, count: usize) {
        self.steps_enqueued.inc_by(count as f64);
    }

    /// Record a finished step
    ///
    /// # Arguments
    ///
    /// * `state` - Final step state ("completed", "failed")
    /// * `duration_secs` - Step execution duration in seconds
    pub fn record_step_execution(&self, state: &str, duration_secs: f64) {
        self.step_executions.with_label_values(&[state]).inc();
        self.step_duration.observe(duration_secs);
    }

    pub fn inc_active_steps(&self) {
        self.active_steps.inc();
    }

    pub fn dec_active_steps(&self) {
        self.active_steps.dec();
    }
}
