//! CLI interface for mapflow

use crate::config::SchedulerConfig;
use crate::daemon::Daemon;
use crate::dag::topological_order;
use crate::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use crate::models::{Map, StepState};
use crate::parser::{draft_steps, parse_map_file};
use crate::schedule::next_fire_after;
use crate::state::SqliteStore;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// mapflow - cron-triggered DAG workflow scheduler
#[derive(Parser, Debug)]
#[command(name = "mapflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cron-triggered DAG workflow scheduler", long_about = None)]
pub struct Cli {
    /// Log level
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    pub log_format: LogFormat,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path, overrides the configured one
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler daemon (blocks until SIGTERM/SIGINT)
    Run,

    /// Validate a map definition without storing it
    Validate {
        /// Path to map YAML file
        file: PathBuf,
    },

    /// Store a map definition
    Load {
        /// Path to map YAML file
        file: PathBuf,

        /// Replace an existing map with the same name
        #[arg(long)]
        replace: bool,
    },

    /// List stored maps
    List,

    /// Show the steps of a map
    Status {
        /// Map ID or name
        map: String,

        /// Print captured output and failure details
        #[arg(short, long)]
        verbose: bool,
    },

    /// Stop scheduling a map
    Pause {
        /// Map ID or name
        map: String,
    },

    /// Resume scheduling a paused map
    Resume {
        /// Map ID or name
        map: String,
    },

    /// Run a map once to completion, ignoring its schedule
    Trigger {
        /// Map ID or name
        map: String,
    },
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let config = LogConfig {
            level: self.log_level,
            format: self.log_format,
        };

        init_logging(&config)
    }

    /// Configuration file and environment, with `--db-path` applied
    pub fn load_config(&self) -> anyhow::Result<SchedulerConfig> {
        let mut config = SchedulerConfig::load(self.config.as_deref())?;
        if let Some(db_path) = &self.db_path {
            config.database = db_path.clone();
        }
        Ok(config)
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let config = self.load_config()?;
        Ok(SqliteStore::new(&config.database)?)
    }

    /// Execute the CLI command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Run => self.run_daemon().await?,
            Commands::Validate { file } => self.validate_map(file)?,
            Commands::Load { file, replace } => self.load_map(file, *replace)?,
            Commands::List => self.list_maps()?,
            Commands::Status { map, verbose } => self.show_status(map, *verbose)?,
            Commands::Pause { map } => self.set_active(map, false)?,
            Commands::Resume { map } => self.set_active(map, true)?,
            Commands::Trigger { map } => self.trigger_map(map).await?,
        }
        Ok(())
    }

    async fn run_daemon(&self) -> anyhow::Result<()> {
        let config = self.load_config()?;
        info!("Using database: {}", config.database.display());

        let daemon = Daemon::new(config)?;
        println!("Starting mapflow daemon");
        println!("Press Ctrl+C to stop");

        daemon.run().await?;

        println!("Daemon stopped");
        Ok(())
    }

    /// Validate a map definition without storing it
    fn validate_map(&self, file: &Path) -> anyhow::Result<()> {
        info!("Validating map definition: {:?}", file);

        let definition = parse_map_file(file)?;
        let order: Vec<String> = topological_order(&draft_steps(&definition)?)?
            .into_iter()
            .map(|s| s.name)
            .collect();

        println!("Map '{}' is valid", definition.name);
        println!("Schedule: {}", definition.schedule);
        println!("Steps: {}", definition.steps.len());
        println!("Execution order: {}", order.join(" -> "));

        let base = definition.start_date.unwrap_or_else(Utc::now).max(Utc::now());
        if let Some(next) = next_fire_after(&definition.schedule, base)? {
            println!("Next run: {}", format_time(next));
        }

        Ok(())
    }

    fn load_map(&self, file: &Path, replace: bool) -> anyhow::Result<()> {
        let definition = parse_map_file(file)?;
        let store = self.open_store()?;

        if let Some(existing) = store.find_map_by_name(&definition.name)? {
            if !replace {
                return Err(anyhow::anyhow!(
                    "Map '{}' already exists (id: {}). Use --replace to overwrite it.",
                    existing.name,
                    existing.id
                ));
            }
            info!("Replacing map '{}' (id: {})", existing.name, existing.id);
            store.delete_map(existing.id)?;
        }

        let map = store.create_map(&definition)?;
        println!(
            "Loaded map '{}' (id: {}) with {} steps",
            map.name,
            map.id,
            map.steps.len()
        );
        Ok(())
    }

    fn list_maps(&self) -> anyhow::Result<()> {
        let store = self.open_store()?;
        let maps = store.list_maps()?;

        if maps.is_empty() {
            println!("No maps found");
            return Ok(());
        }

        println!(
            "{:<6} {:<30} {:<18} {:<8} {:<20} {:<20}",
            "ID", "Name", "Schedule", "Active", "Last Run", "Next Run"
        );
        println!("{}", "-".repeat(106));

        for map in maps {
            println!(
                "{:<6} {:<30} {:<18} {:<8} {:<20} {:<20}",
                map.id,
                map.name,
                map.schedule,
                if map.is_active { "yes" } else { "no" },
                map.last_run
                    .map(format_time)
                    .unwrap_or_else(|| "Never".to_string()),
                next_run(&map),
            );
        }

        Ok(())
    }

    fn show_status(&self, reference: &str, verbose: bool) -> anyhow::Result<()> {
        let store = self.open_store()?;
        let map = store.resolve_map(reference)?;
        print_map(&map, verbose);
        Ok(())
    }

    fn set_active(&self, reference: &str, active: bool) -> anyhow::Result<()> {
        let store = self.open_store()?;
        let map = store.resolve_map(reference)?;
        store.set_map_active(map.id, active)?;

        println!(
            "Map '{}' {}",
            map.name,
            if active { "resumed" } else { "paused" }
        );
        Ok(())
    }

    /// Run a map once in this process
    async fn trigger_map(&self, reference: &str) -> anyhow::Result<()> {
        let config = self.load_config()?;
        let daemon = Daemon::new(config)?;

        let map = daemon.run_map_once(reference).await?;
        print_map(&map, false);

        if map.steps.iter().all(|s| s.state == StepState::Completed) {
            info!("Map '{}' completed successfully", map.name);
            Ok(())
        } else {
            error!("Map '{}' did not complete", map.name);
            std::process::exit(1);
        }
    }
}

fn print_map(map: &Map, verbose: bool) {
    println!("\nMap '{}' (id: {})", map.name, map.id);
    println!("Schedule: {}", map.schedule);
    println!("Active: {}", if map.is_active { "yes" } else { "no" });
    println!(
        "Last run: {}",
        map.last_run
            .map(format_time)
            .unwrap_or_else(|| "Never".to_string())
    );
    println!();
    println!(
        "{:<6} {:<24} {:<10} {:<20} {:<12}",
        "ID", "Step", "State", "Started", "Duration"
    );
    println!("{:-<76}", "");

    for step in &map.steps {
        let duration = match (step.start_date, step.end_date) {
            (Some(start), Some(end)) => format_duration((end - start).num_seconds()),
            _ => "N/A".to_string(),
        };

        println!(
            "{:<6} {:<24} {:<10} {:<20} {:<12}",
            step.id,
            step.name,
            step.state.to_string(),
            step.start_date
                .map(format_time)
                .unwrap_or_else(|| "N/A".to_string()),
            duration
        );

        if verbose {
            if let Some(detail) = step.detail.as_deref().filter(|d| !d.is_empty()) {
                println!("{}", detail);
            }
        }
    }
    println!();
}

fn next_run(map: &Map) -> String {
    if !map.is_active {
        return "Paused".to_string();
    }
    let base = map.last_run.unwrap_or(map.start_date);
    match next_fire_after(&map.schedule, base) {
        Ok(Some(next)) => format_time(next),
        Ok(None) => "Never".to_string(),
        Err(_) => "Invalid schedule".to_string(),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Format duration in seconds to human-readable string
fn format_duration(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}
