//! Benchmark worker and coordinator
//!
//! A worker owns one client, executor, aggregator and load generator, and
//! reports a single [`WorkerReport`]. The coordinator runs `num_clients`
//! workers as separate processes of the current executable; each prints its
//! report as one JSON line on stdout, which the coordinator parses and merges.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::arrival::{ArrivalLibrary, ArrivalTrace, Pacing, SelectionMetric, TraceChoice};
use crate::client::{AsyncClient, ClientCountersSnapshot};
use crate::config::{BenchConfig, ConfigValidator};
use crate::inputs::InputPool;
use crate::load_gen::{LoadGenerator, LoadRunSummary, StopCondition, drain};
use crate::metrics::{MetricsCollector, MetricsScraper};
use crate::pipeline::{ExecutionCountersSnapshot, PipelineExecutor};
use crate::stats::{StatsAggregator, StatsHistory, mean};

const WARMUP_INTERVAL: Duration = Duration::from_millis(5);

/// Final result of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub history: StatsHistory,
    pub client: ClientCountersSnapshot,
    pub executions: ExecutionCountersSnapshot,
    pub load: LoadRunSummary,
    /// Whether every execution finished before the drain timeout
    pub drained: bool,
}

/// Reports of every successful worker, concatenated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedReport {
    pub workers: Vec<WorkerReport>,
    pub failed_workers: Vec<usize>,
    pub throughputs: Vec<f64>,
    pub p99_latencies_ms: Vec<f64>,
    pub mean_latencies_ms: Vec<f64>,
    /// Sum over workers of each worker's mean snapshot throughput
    pub aggregate_throughput: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub arrivals: usize,
    pub mean_throughput: f64,
    pub peak_throughput: f64,
    pub slo_window_ms: u128,
}

/// Read and validate a benchmark configuration file.
pub fn load_config(path: &Path) -> Result<BenchConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: BenchConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    ConfigValidator::validate(&config)
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Run one worker to completion. An unreachable service is fatal.
pub async fn run_worker(config: &BenchConfig, index: usize) -> Result<WorkerReport> {
    let client = Arc::new(AsyncClient::new(config.client_config()));
    client
        .start()
        .await
        .context("failed to connect to inference services")?;

    let stats = Arc::new(StatsAggregator::new(config.trial_length));
    let executor = PipelineExecutor::new(client.clone(), config.stage_graph()?, stats.clone())?;
    let seed = config.inputs.seed.map(|seed| seed.wrapping_add(index as u64));
    let mut inputs = InputPool::random(&config.inputs.sizes, config.inputs.pool_size, seed);

    if config.warmup_requests > 0 {
        warm_up(&executor, &mut inputs, config).await?;
    }

    let pacing = config.pacing().context("failed to load arrival trace")?;
    let collector = match &config.metrics_url {
        Some(url) => {
            let scraper = MetricsScraper::new(url.as_str(), config.client_config().request_timeout)
                .context("failed to build metrics scraper")?;
            Some(MetricsCollector::spawn(scraper, stats.clone()))
        }
        None => None,
    };
    info!(
        "Worker {} starting: {} stage(s), trial length {}, {} trial(s)",
        index,
        executor.graph().stage_count(),
        config.trial_length,
        config.num_trials
    );
    let load = LoadGenerator::new(&executor, pacing, config.stop_condition())
        .run(&mut inputs)
        .await?;
    let drained = drain(&executor, config.drain_timeout()).await;
    if !drained {
        warn!(
            "Worker {} stopped with {} execution(s) still in flight",
            index,
            executor.in_flight()
        );
    }
    if let Some(collector) = collector {
        collector.finish().await;
    }

    Ok(WorkerReport {
        worker: index,
        history: stats.history(),
        client: client.counters(),
        executions: executor.counters(),
        load,
        drained,
    })
}

async fn warm_up(
    executor: &PipelineExecutor,
    inputs: &mut InputPool,
    config: &BenchConfig,
) -> Result<()> {
    info!("Warming up with {} request(s)", config.warmup_requests);
    let stop = StopCondition {
        max_requests: Some(config.warmup_requests),
        ..Default::default()
    };
    let pacing = Pacing::FixedInterval {
        delay: WARMUP_INTERVAL,
    };
    LoadGenerator::new(executor, pacing, stop)
        .run(inputs.by_ref())
        .await?;
    drain(executor, config.drain_timeout()).await;
    executor.stats().reset();
    Ok(())
}

/// Extract the worker report from a worker's stdout: the last non-empty line.
pub fn parse_worker_output(stdout: &str) -> Result<WorkerReport> {
    let line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .context("worker produced no output")?;
    serde_json::from_str(line).context("worker output is not a report")
}

pub fn merge_reports(workers: Vec<WorkerReport>, failed_workers: Vec<usize>) -> MergedReport {
    let mut merged = MergedReport {
        failed_workers,
        ..Default::default()
    };
    for report in &workers {
        merged.throughputs.extend(report.history.throughputs());
        merged.p99_latencies_ms.extend(report.history.p99_latencies_ms());
        merged.mean_latencies_ms.extend(report.history.mean_latencies_ms());
        merged.aggregate_throughput += mean(&report.history.throughputs()).unwrap_or(0.0);
    }
    merged.workers = workers;
    merged
}

/// Run `num_clients` worker processes against `config_path` and merge their
/// reports. Fails only if every worker fails.
pub async fn run_coordinator(config_path: &Path, num_clients: usize) -> Result<MergedReport> {
    let exe = std::env::current_exe().context("cannot locate the current executable")?;
    run_coordinator_with(&exe, config_path, num_clients).await
}

/// Like [`run_coordinator`], with workers spawned from `exe`.
pub async fn run_coordinator_with(
    exe: &Path,
    config_path: &Path,
    num_clients: usize,
) -> Result<MergedReport> {
    info!("Spawning {} worker process(es) of {}", num_clients, exe.display());

    let runs = (0..num_clients).map(|index| run_worker_process(exe, config_path, index));
    let outcomes = futures::future::join_all(runs).await;

    let mut reports = Vec::new();
    let mut failed = Vec::new();
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!("Worker {} failed: {:#}", index, e);
                failed.push(index);
            }
        }
    }
    if reports.is_empty() {
        bail!("all {} worker(s) failed", num_clients);
    }

    let merged = merge_reports(reports, failed);
    info!(
        "Merged {} worker report(s), aggregate throughput {:.3}/s",
        merged.workers.len(),
        merged.aggregate_throughput
    );
    Ok(merged)
}

async fn run_worker_process(exe: &Path, config_path: &Path, index: usize) -> Result<WorkerReport> {
    let output = Command::new(exe)
        .arg("worker")
        .arg("--config")
        .arg(config_path)
        .arg("--index")
        .arg(index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to spawn worker {}", index))?;
    if !output.status.success() {
        bail!("exited with {}", output.status);
    }
    parse_worker_output(&String::from_utf8_lossy(&output.stdout))
}

pub fn write_report(path: &Path, report: &MergedReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

pub fn trace_info(path: &Path, slo_window: Duration) -> Result<TraceSummary> {
    let trace = ArrivalTrace::load(path)?;
    Ok(TraceSummary {
        arrivals: trace.len(),
        mean_throughput: trace.mean_throughput(),
        peak_throughput: trace.peak_throughput(slo_window),
        slo_window_ms: slo_window.as_millis(),
    })
}

/// For each target throughput, the fastest trace in `dir` (generated with
/// coefficient of variation `cv`) whose `metric` does not exceed it.
pub fn select_traces(
    dir: &Path,
    cv: f64,
    targets: &[f64],
    metric: SelectionMetric,
) -> Result<Vec<TraceChoice>> {
    let library = ArrivalLibrary::load_dir(dir, cv)?;
    info!(
        "Selecting from {} arrival trace(s) in {} for {} target(s)",
        library.len(),
        dir.display(),
        targets.len()
    );
    let choices = library.select_all(targets, metric);
    for choice in &choices {
        if choice.rate.is_none() {
            warn!("No arrival trace at or below {} qps", choice.target);
        }
    }
    Ok(choices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_gen::StopReason;
    use crate::stats::StatsSnapshot;
    use chrono::Utc;

    fn snapshot(throughput: f64, p99: f64) -> StatsSnapshot {
        StatsSnapshot {
            mean_latency_ms: p99 / 2.0,
            p99_latency_ms: p99,
            throughput,
            count: 10,
            timestamp: Utc::now(),
        }
    }

    fn report(worker: usize, throughputs: &[f64]) -> WorkerReport {
        WorkerReport {
            worker,
            history: StatsHistory {
                snapshots: throughputs.iter().map(|t| snapshot(*t, 20.0)).collect(),
                all_latencies_ms: vec![1.0; throughputs.len() * 10],
                ..Default::default()
            },
            client: ClientCountersSnapshot::default(),
            executions: ExecutionCountersSnapshot::default(),
            load: LoadRunSummary {
                issued: 10,
                elapsed: Duration::from_secs(1),
                stop_reason: StopReason::TargetTrials,
            },
            drained: true,
        }
    }

    #[test]
    fn test_parse_worker_output_takes_last_line() {
        let line = serde_json::to_string(&report(2, &[5.0])).unwrap();
        let stdout = format!("{}\n\n", line);
        let parsed = parse_worker_output(&stdout).unwrap();
        assert_eq!(parsed.worker, 2);
        assert_eq!(parsed.history.snapshots.len(), 1);
    }

    #[test]
    fn test_parse_worker_output_rejects_garbage_and_empty() {
        assert!(parse_worker_output("").is_err());
        assert!(parse_worker_output("not json\n").is_err());
    }

    #[test]
    fn test_merge_concatenates_in_worker_order() {
        let merged = merge_reports(vec![report(0, &[10.0, 12.0]), report(1, &[8.0])], vec![2]);
        assert_eq!(merged.throughputs, vec![10.0, 12.0, 8.0]);
        assert_eq!(merged.p99_latencies_ms.len(), 3);
        assert_eq!(merged.failed_workers, vec![2]);
        assert!((merged.aggregate_throughput - 19.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        let mut config = BenchConfig::single_stage("m", vec!["127.0.0.1:1".to_string()], 4);
        config.trial_length = 0;
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("trial_length"));

        config.trial_length = 5;
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(load_config(&path).unwrap().trial_length, 5);
    }

    #[test]
    fn test_trace_info_summarizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arrivals.txt");
        std::fs::write(&path, "100\n100\n100\n100\n").unwrap();
        let summary = trace_info(&path, Duration::from_millis(250)).unwrap();
        assert_eq!(summary.arrivals, 4);
        assert!((summary.mean_throughput - 10.0).abs() < 1e-9);
        // arrivals at 0, 100, 200 fall in one 250ms window
        assert!((summary.peak_throughput - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_worker_fails_fast_on_unreachable_service() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let mut config = BenchConfig::single_stage("m", vec![addr], 4);
        config.connect_timeout_ms = 500;
        let err = run_worker(&config, 0).await.unwrap_err();
        assert!(format!("{:#}", err).contains("unreachable"));
    }

    #[test]
    fn test_select_traces_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for rate in [10u64, 20, 40] {
            let delta = 1000 / rate;
            let text = format!("{}\n", delta).repeat(rate as usize);
            std::fs::write(dir.path().join(format!("{}.deltas", rate)), text).unwrap();
        }

        let choices = select_traces(dir.path(), 1.0, &[25.0, 5.0], SelectionMetric::Mean).unwrap();

        assert_eq!(choices.len(), 2);
        assert_eq!(choices[0].rate, Some(20));
        assert_eq!(choices[1].rate, None);
        assert!(select_traces(dir.path(), 3.0, &[25.0], SelectionMetric::Mean).is_err());
    }
}
