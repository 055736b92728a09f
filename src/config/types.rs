use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arrival::{ArrivalTrace, DEFAULT_SLO_WINDOW, Pacing, TraceError};
use crate::client::ClientConfig;
use crate::load_gen::StopCondition;
use crate::pipeline::{PipelineError, StageGraph, StageSpec};
use crate::replica::ReplicaPolicy;
use crate::transport::TransportKind;

/// Benchmark configuration, read from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Service name -> replica addresses (`host:port` for tcp, URL for http)
    pub services: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub replica_policy: ReplicaPolicy,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub inputs: InputConfig,
    /// Completed executions per stats snapshot
    #[serde(default = "default_trial_length")]
    pub trial_length: usize,
    /// Snapshots per worker before the run stops
    #[serde(default = "default_num_trials")]
    pub num_trials: usize,
    /// Worker processes
    #[serde(default = "default_num_clients")]
    pub num_clients: usize,
    #[serde(default)]
    pub pacing: PacingConfig,
    /// Wall-clock limit per worker (None = unlimited)
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Issuance limit per worker (None = unlimited)
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Requests issued and discarded before measuring
    #[serde(default)]
    pub warmup_requests: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Window for trace peak-throughput analysis
    #[serde(default)]
    pub slo_millis: Option<u64>,
    /// Serving system metrics endpoint, scraped after every snapshot
    #[serde(default)]
    pub metrics_url: Option<String>,
    #[serde(default)]
    pub log: LogSettings,
}

fn default_trial_length() -> usize {
    100
}

fn default_num_trials() -> usize {
    10
}

fn default_num_clients() -> usize {
    1
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub entries: Vec<StageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Entry stage name -> input vector length
    #[serde(default)]
    pub sizes: BTreeMap<String, usize>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_pool_size() -> usize {
    1000
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            sizes: BTreeMap::new(),
            pool_size: default_pool_size(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PacingConfig {
    ClosedLoop {
        #[serde(default)]
        delay_ms: u64,
    },
    FixedInterval {
        delay_ms: u64,
    },
    Trace {
        path: String,
    },
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig::ClosedLoop { delay_ms: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for rolling log files (None = stderr only)
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl BenchConfig {
    /// Minimal configuration: one service, one single-stage pipeline.
    pub fn single_stage(service: &str, addresses: Vec<String>, input_len: usize) -> Self {
        let stage = service.to_string();
        Self {
            services: BTreeMap::from([(service.to_string(), addresses)]),
            transport: TransportKind::default(),
            replica_policy: ReplicaPolicy::default(),
            pipeline: PipelineConfig {
                entries: vec![StageSpec::leaf(stage.clone(), service)],
            },
            inputs: InputConfig {
                sizes: BTreeMap::from([(stage, input_len)]),
                ..Default::default()
            },
            trial_length: default_trial_length(),
            num_trials: default_num_trials(),
            num_clients: default_num_clients(),
            pacing: PacingConfig::default(),
            duration_secs: None,
            max_requests: None,
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            warmup_requests: 0,
            drain_timeout_ms: default_drain_timeout_ms(),
            slo_millis: None,
            metrics_url: None,
            log: LogSettings::default(),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            transport: self.transport,
            services: self.services.clone(),
            replica_policy: self.replica_policy,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn stage_graph(&self) -> Result<StageGraph, PipelineError> {
        StageGraph::new(self.pipeline.entries.clone())
    }

    pub fn pacing(&self) -> Result<Pacing, TraceError> {
        Ok(match &self.pacing {
            PacingConfig::ClosedLoop { delay_ms } => Pacing::ClosedLoop {
                delay: Duration::from_millis(*delay_ms),
            },
            PacingConfig::FixedInterval { delay_ms } => Pacing::FixedInterval {
                delay: Duration::from_millis(*delay_ms),
            },
            PacingConfig::Trace { path } => Pacing::Trace(ArrivalTrace::load(path)?),
        })
    }

    pub fn stop_condition(&self) -> StopCondition {
        StopCondition {
            target_trials: Some(self.num_trials),
            max_duration: self.duration_secs.map(Duration::from_secs),
            max_requests: self.max_requests,
        }
    }

    pub fn slo_window(&self) -> Duration {
        self.slo_millis
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SLO_WINDOW)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
