//! Structured logging setup
//!
//! `RUST_LOG` takes precedence over `--log-level` when set, e.g.
//! `RUST_LOG=mapflow::scheduler=debug,info`. Without it, mapflow's own
//! targets log at the chosen level and dependencies at `warn` at most.

use clap::ValueEnum;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn directive(self) -> String {
        match self {
            LogLevel::Error | LogLevel::Warn => self.as_str().to_string(),
            _ => format!("warn,mapflow={}", self.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    #[default]
    Json,
    /// Human-readable lines
    #[value(alias = "text")]
    Pretty,
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

/// Install the global subscriber. Events go to stderr so command output on
/// stdout stays clean.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = env_filter(config.level);

    match config.format {
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .json()
                .flatten_event(true)
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_writer(std::io::stderr)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Pretty => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(s: &str) -> Result<LogLevel, String> {
        <LogLevel as ValueEnum>::from_str(s, true)
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(level("error").unwrap(), LogLevel::Error);
        assert_eq!(level("INFO").unwrap(), LogLevel::Info);
        assert_eq!(level("trace").unwrap(), LogLevel::Trace);
        assert!(level("verbose").is_err());
    }

    #[test]
    fn test_directive_caps_dependencies() {
        assert_eq!(LogLevel::Debug.directive(), "warn,mapflow=debug");
        assert_eq!(LogLevel::Info.directive(), "warn,mapflow=info");
        assert_eq!(LogLevel::Error.directive(), "error");
    }

    #[test]
    fn test_text_is_pretty() {
        assert_eq!(
            <LogFormat as ValueEnum>::from_str("text", true).unwrap(),
            LogFormat::Pretty
        );
        assert_eq!(
            <LogFormat as ValueEnum>::from_str("json", true).unwrap(),
            LogFormat::Json
        );
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
    }
}
