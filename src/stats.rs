//! Rolling trial-window statistics
//!
//! Latency samples accumulate in a window of `trial_length` entries. The
//! sample that fills the window swaps it out under the same lock that guards
//! appends, turns it into a [`StatsSnapshot`] and starts a fresh window.
//!
//! Percentiles use linear interpolation between the closest ranks:
//! `rank = p / 100 * (n - 1)`. For the samples `1..=100`, p99 is `99.01`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

use crate::metrics::ServerMetrics;

/// Summary of one full trial window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub mean_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Completions per second over the window's wall time
    pub throughput: f64,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Summarize `samples` (milliseconds) collected over `elapsed`. Returns
    /// `None` for an empty window.
    pub fn from_samples(samples: &[f64], elapsed: Duration) -> Option<Self> {
        let mean_latency_ms = mean(samples)?;
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let p99_latency_ms = percentile(&sorted, 99.0)?;
        // A zero-length window would divide by zero; clamp to one microsecond.
        let secs = elapsed.as_secs_f64().max(1e-6);
        Some(StatsSnapshot {
            mean_latency_ms,
            p99_latency_ms,
            throughput: samples.len() as f64 / secs,
            count: samples.len(),
            timestamp: Utc::now(),
        })
    }
}

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// `p`-th percentile of an ascending slice, interpolating linearly between
/// the two closest ranks.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
        }
    }
}

/// Every snapshot of a run, plus every latency that entered a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsHistory {
    pub snapshots: Vec<StatsSnapshot>,
    pub all_latencies_ms: Vec<f64>,
    /// Service -> mean batch size, one map per server metrics scrape
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mean_batch_sizes: Vec<BTreeMap<String, f64>>,
    /// Raw server metrics documents, one per scrape
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_metrics: Vec<serde_json::Value>,
}

impl StatsHistory {
    pub fn throughputs(&self) -> Vec<f64> {
        self.snapshots.iter().map(|s| s.throughput).collect()
    }

    pub fn p99_latencies_ms(&self) -> Vec<f64> {
        self.snapshots.iter().map(|s| s.p99_latency_ms).collect()
    }

    pub fn mean_latencies_ms(&self) -> Vec<f64> {
        self.snapshots.iter().map(|s| s.mean_latency_ms).collect()
    }
}

#[derive(Debug)]
struct TrialWindow {
    samples: Vec<f64>,
    started_at: Instant,
}

impl TrialWindow {
    fn new(capacity: usize, started_at: Instant) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            started_at,
        }
    }
}

#[derive(Debug)]
struct AggregatorState {
    window: TrialWindow,
    history: StatsHistory,
}

#[derive(Debug)]
pub struct StatsAggregator {
    trial_length: usize,
    state: Mutex<AggregatorState>,
    /// Number of snapshots emitted so far
    emitted: watch::Sender<usize>,
}

impl StatsAggregator {
    pub fn new(trial_length: usize) -> Self {
        Self::with_start(trial_length, Instant::now())
    }

    /// Aggregator whose first window is considered to have started at `start`.
    pub fn with_start(trial_length: usize, start: Instant) -> Self {
        let (emitted, _) = watch::channel(0);
        Self {
            trial_length,
            state: Mutex::new(AggregatorState {
                window: TrialWindow::new(trial_length, start),
                history: StatsHistory::default(),
            }),
            emitted,
        }
    }

    pub fn trial_length(&self) -> usize {
        self.trial_length
    }

    pub fn record(&self, latency: Duration) -> Option<StatsSnapshot> {
        self.record_at(latency, Instant::now())
    }

    /// Append one sample observed at `now`. Returns the snapshot if this
    /// sample filled the window.
    pub fn record_at(&self, latency: Duration, now: Instant) -> Option<StatsSnapshot> {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut state = self.state.lock();
        state.window.samples.push(latency_ms);
        if self.trial_length == 0 || state.window.samples.len() < self.trial_length {
            return None;
        }

        let full = std::mem::replace(
            &mut state.window,
            TrialWindow::new(self.trial_length, now),
        );
        let snapshot = StatsSnapshot::from_samples(
            &full.samples,
            now.saturating_duration_since(full.started_at),
        )?;
        info!(
            "p99: {:.3}ms, mean: {:.3}ms, thruput: {:.3}/s",
            snapshot.p99_latency_ms, snapshot.mean_latency_ms, snapshot.throughput
        );
        state.history.all_latencies_ms.extend(full.samples);
        state.history.snapshots.push(snapshot.clone());
        self.emitted.send_replace(state.history.snapshots.len());
        Some(snapshot)
    }

    /// Notified with the snapshot count whenever a snapshot is emitted.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.emitted.subscribe()
    }

    pub fn record_server_metrics(&self, metrics: &ServerMetrics, doc: serde_json::Value) {
        let mut state = self.state.lock();
        state.history.mean_batch_sizes.push(metrics.batch_sizes.clone());
        state.history.all_metrics.push(doc);
    }

    /// Drop the current window and the history, starting over now.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.window = TrialWindow::new(self.trial_length, Instant::now());
        state.history = StatsHistory::default();
        // Subscribers are not woken: no new snapshot exists.
        self.emitted.send_if_modified(|count| {
            *count = 0;
            false
        });
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().history.snapshots.len()
    }

    /// Samples in the current, not yet full, window
    pub fn pending_samples(&self) -> usize {
        self.state.lock().window.samples.len()
    }

    pub fn history(&self) -> StatsHistory {
        self.state.lock().history.clone()
    }
}
