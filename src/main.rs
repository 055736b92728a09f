use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sgl_pipeline_bench::arrival::SelectionMetric;
use sgl_pipeline_bench::bench;
use sgl_pipeline_bench::config::LogSettings;
use sgl_pipeline_bench::logging::{self, LoggingConfig};
use sgl_pipeline_bench::mock_service::{MockBehavior, MockService, MockServiceConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sgl-pipeline-bench")]
#[command(about = "Multi-stage inference pipeline benchmark")]
#[command(long_about = r#"
Multi-stage inference pipeline benchmark

Drives a DAG of remote inference services with a controlled arrival process
and reports rolling latency / throughput snapshots.

Examples:
  # Benchmark with the worker count from the config file
  sgl-pipeline-bench run --config bench.json --output results.json

  # Serve a stand-in model service on both protocols
  sgl-pipeline-bench serve-mock --tcp 127.0.0.1:7000 --http 127.0.0.1:7001 --delay-ms 20

  # Mean and peak throughput of an arrival trace
  sgl-pipeline-bench trace-info arrivals.txt --slo-millis 350

  # Fastest Poisson traces whose peak throughput fits each target
  sgl-pipeline-bench select-trace traces/ --targets 50,100,200
"#)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a benchmark across one or more worker processes
    Run {
        #[arg(long)]
        config: PathBuf,

        /// Override num_clients from the config file
        #[arg(long)]
        num_clients: Option<usize>,

        /// Write the merged report here as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run a single benchmark worker and print its report on stdout
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: PathBuf,

        #[arg(long, default_value_t = 0)]
        index: usize,
    },

    /// Serve a mock inference service
    ServeMock {
        /// Address for the framed TCP protocol
        #[arg(long)]
        tcp: Option<String>,

        /// Address for the JSON HTTP protocol
        #[arg(long)]
        http: Option<String>,

        /// JSON file with per-service behaviour (overrides the flags below)
        #[arg(long)]
        behavior: Option<PathBuf>,

        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        #[arg(long, default_value_t = 0)]
        jitter_ms: u64,

        #[arg(long, default_value_t = 0.0)]
        drop_rate: f32,

        #[arg(long)]
        output_len: Option<usize>,

        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// Print mean and peak throughput of an arrival trace
    TraceInfo {
        path: PathBuf,

        #[arg(long, default_value_t = 250)]
        slo_millis: u64,
    },

    /// Pick, per target throughput, the fastest trace in a directory that fits
    SelectTrace {
        dir: PathBuf,

        /// Target throughputs in requests per second
        #[arg(long, value_delimiter = ',', required = true)]
        targets: Vec<f64>,

        /// Coefficient of variation the traces were generated with
        #[arg(long, default_value_t = 1.0)]
        cv: f64,

        /// Match on mean rather than peak throughput
        #[arg(long)]
        mean: bool,

        #[arg(long, default_value_t = 350)]
        slo_millis: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;

    match cli.command {
        Command::Run {
            config,
            num_clients,
            output,
        } => {
            let bench_config = bench::load_config(&config)?;
            let _guard = logging::init_logging(LoggingConfig::from_settings(
                &bench_config.log,
                "coordinator",
            ));
            let num_clients = num_clients.unwrap_or(bench_config.num_clients).max(1);
            let report = runtime.block_on(bench::run_coordinator(&config, num_clients))?;
            if let Some(path) = output {
                bench::write_report(&path, &report)?;
                info!("Wrote report to {}", path.display());
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize report")?
            );
        }
        Command::Worker { config, index } => {
            let bench_config = bench::load_config(&config)?;
            let _guard = logging::init_logging(LoggingConfig::from_settings(
                &bench_config.log,
                &format!("worker-{}", index),
            ));
            let report = runtime.block_on(bench::run_worker(&bench_config, index))?;
            println!(
                "{}",
                serde_json::to_string(&report).context("failed to serialize worker report")?
            );
        }
        Command::ServeMock {
            tcp,
            http,
            behavior,
            delay_ms,
            jitter_ms,
            drop_rate,
            output_len,
            log_level,
        } => {
            let settings = LogSettings {
                level: log_level,
                ..Default::default()
            };
            let _guard = logging::init_logging(LoggingConfig::from_settings(&settings, "mock"));
            let mock_config = match behavior {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("failed to parse {}", path.display()))?
                }
                None => MockServiceConfig {
                    default: MockBehavior {
                        delay_ms,
                        jitter_ms,
                        drop_rate,
                        output_len,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            };
            runtime.block_on(serve_mock(mock_config, tcp, http))?;
        }
        Command::TraceInfo { path, slo_millis } => {
            let summary = bench::trace_info(&path, Duration::from_millis(slo_millis))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("failed to serialize summary")?
            );
        }
        Command::SelectTrace {
            dir,
            targets,
            cv,
            mean,
            slo_millis,
        } => {
            let _guard =
                logging::init_logging(LoggingConfig::from_settings(&LogSettings::default(), "select"));
            let metric = if mean {
                SelectionMetric::Mean
            } else {
                SelectionMetric::Peak {
                    slo_window: Duration::from_millis(slo_millis),
                }
            };
            let choices = bench::select_traces(&dir, cv, &targets, metric)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&choices).context("failed to serialize selection")?
            );
        }
    }
    Ok(())
}

async fn serve_mock(config: MockServiceConfig, tcp: Option<String>, http: Option<String>) -> Result<()> {
    if tcp.is_none() && http.is_none() {
        anyhow::bail!("serve-mock needs --tcp and/or --http");
    }
    let service = MockService::new(config);
    if let Some(addr) = tcp {
        service
            .serve_tcp(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
    }
    if let Some(addr) = http {
        service
            .serve_http(&addr)
            .with_context(|| format!("failed to bind {}", addr))?;
    }
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Received Ctrl+C, shutting down");
    service.shutdown().await;
    Ok(())
}
