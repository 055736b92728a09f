//! Logging setup
//!
//! Console output always goes to stderr: a benchmark worker's stdout carries
//! nothing but its JSON report line.

use std::io::IsTerminal;
use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogSettings;

const CRATE_TARGET: &str = "sgl_pipeline_bench";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json_format: bool,
    /// Directory for daily rolling log files. If None, logs only go to stderr
    pub log_dir: Option<String>,
    pub colorize: bool,
    pub log_file_name: String,
    /// Targets the level applies to when `RUST_LOG` is unset
    pub log_targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            log_dir: None,
            colorize: std::io::stderr().is_terminal(),
            log_file_name: "sgl-pipeline-bench".to_string(),
            log_targets: vec![CRATE_TARGET.to_string()],
        }
    }
}

impl LoggingConfig {
    /// Logging for one process; `role` distinguishes coordinator and worker
    /// log files written to the same directory.
    pub fn from_settings(settings: &LogSettings, role: &str) -> Self {
        Self {
            level: parse_level(&settings.level).unwrap_or(Level::INFO),
            json_format: settings.json,
            log_dir: settings.dir.clone(),
            log_file_name: format!("sgl-pipeline-bench-{}", role),
            ..Default::default()
        }
    }

    fn filter_directives(&self) -> String {
        let level = level_name(self.level);
        self.log_targets
            .iter()
            .map(|target| format!("{}={}", target, level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// Keeps the file appender worker thread alive; hold it for the whole run.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(config: LoggingConfig) -> LogGuard {
    // Route `log` records from dependencies (actix-web) into tracing.
    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let time_format = "%Y-%m-%d %H:%M:%S".to_string();
    let mut layers = Vec::new();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(config.colorize)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::new(time_format.clone()))
        .with_writer(std::io::stderr);
    layers.push(if config.json_format {
        console_layer.json().flatten_event(true).boxed()
    } else {
        console_layer.boxed()
    });

    let mut file_guard = None;
    if let Some(log_dir) = &config.log_dir {
        let log_dir = PathBuf::from(log_dir);
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
        } else {
            let appender =
                RollingFileAppender::new(Rotation::DAILY, log_dir, &config.log_file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::new(time_format))
                .with_writer(non_blocking);
            layers.push(if config.json_format {
                file_layer.json().flatten_event(true).boxed()
            } else {
                file_layer.boxed()
            });
        }
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init();

    LogGuard {
        _file_guard: file_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_is_case_insensitive() {
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn test_from_settings_names_file_by_role() {
        let settings = LogSettings {
            level: "debug".to_string(),
            json: true,
            dir: Some("/tmp/logs".to_string()),
        };
        let config = LoggingConfig::from_settings(&settings, "worker-3");
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.json_format);
        assert_eq!(config.log_file_name, "sgl-pipeline-bench-worker-3");
        assert_eq!(config.filter_directives(), "sgl_pipeline_bench=debug");
    }

    #[test]
    fn test_init_logging_writes_files_and_tolerates_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: Some(dir.path().join("nested").display().to_string()),
            ..Default::default()
        };
        let _guard = init_logging(config.clone());
        let _second = init_logging(config);
        assert!(dir.path().join("nested").exists());
    }
}
