//! Arrival processes: how long the load generator waits between issuances
//!
//! A trace file holds one inter-arrival delay in milliseconds per line. Blank
//! lines and `#` comments are ignored; lines that do not parse as a positive
//! number, or that do not fit in a `Duration`, are skipped with a warning.
//!
//! An [`ArrivalLibrary`] is a directory of such traces keyed by the rate
//! they were generated with. [`ArrivalLibrary::select`] searches it for the
//! fastest trace whose mean or peak throughput stays under a target.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Window used by [`ArrivalTrace::peak_throughput`] when none is configured
pub const DEFAULT_SLO_WINDOW: Duration = Duration::from_millis(250);

/// Window used when selecting traces by peak throughput
pub const SELECTION_SLO_WINDOW: Duration = Duration::from_millis(350);

/// After a rejected candidate the upper bound only shrinks to `middle + SEARCH_SLACK - 1`:
/// peak throughput is not strictly monotone in the generating rate.
const SEARCH_SLACK: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("Failed to read arrival trace {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Arrival trace {path} contains no usable delays")]
    Empty { path: String },

    #[error("No arrival traces with cv {cv} in {dir}")]
    NoTraces { dir: String, cv: f64 },
}

/// A replayable sequence of inter-arrival delays
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalTrace {
    deltas: Vec<Duration>,
    cursor: usize,
}

impl ArrivalTrace {
    pub fn from_deltas(deltas: Vec<Duration>) -> Self {
        ArrivalTrace { deltas, cursor: 0 }
    }

    pub fn from_millis(deltas_ms: &[u64]) -> Self {
        Self::from_deltas(deltas_ms.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let trace = Self::parse(&text);
        if trace.is_empty() {
            return Err(TraceError::Empty {
                path: path.display().to_string(),
            });
        }
        debug!("Loaded {} arrival deltas from {}", trace.len(), path.display());
        Ok(trace)
    }

    pub fn parse(text: &str) -> Self {
        let mut deltas = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<f64>() {
                Ok(ms) if ms.is_finite() && ms > 0.0 => {
                    match Duration::try_from_secs_f64(ms / 1000.0) {
                        Ok(delta) => deltas.push(delta),
                        Err(_) => warn!(
                            "Skipping out-of-range arrival delta {} on line {}",
                            line,
                            lineno + 1
                        ),
                    }
                }
                Ok(ms) => warn!("Skipping non-positive arrival delta {} on line {}", ms, lineno + 1),
                Err(_) => warn!("Skipping malformed arrival delta {:?} on line {}", line, lineno + 1),
            }
        }
        Self::from_deltas(deltas)
    }

    /// Next delay, or `None` once the trace is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.deltas.get(self.cursor).copied();
        if delay.is_some() {
            self.cursor += 1;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn remaining(&self) -> usize {
        self.deltas.len() - self.cursor
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn deltas(&self) -> &[Duration] {
        &self.deltas
    }

    /// Average arrival rate in requests per second
    pub fn mean_throughput(&self) -> f64 {
        let total: f64 = self.deltas.iter().map(Duration::as_secs_f64).sum();
        if total <= 0.0 {
            return 0.0;
        }
        self.deltas.len() as f64 / total
    }

    /// Highest arrival rate (requests per second) seen in any window of
    /// length `slo_window`. Arrivals are at `0, d0, d0 + d1, ...`.
    pub fn peak_throughput(&self, slo_window: Duration) -> f64 {
        if slo_window.is_zero() || self.deltas.is_empty() {
            return 0.0;
        }
        // Nanosecond offsets; a u128 sum of Durations saturates long after any real trace ends.
        let window = slo_window.as_nanos();
        let mut arrivals = Vec::with_capacity(self.deltas.len() + 1);
        let mut at: u128 = 0;
        arrivals.push(at);
        for delta in &self.deltas {
            at = at.saturating_add(delta.as_nanos());
            arrivals.push(at);
        }

        let mut most = 0;
        let mut front = 0;
        for back in 0..arrivals.len() {
            while arrivals[back] - arrivals[front] >= window {
                front += 1;
            }
            most = most.max(back - front + 1);
        }
        most as f64 / slo_window.as_secs_f64()
    }
}

/// Highest-rate candidate accepted by `eval`, searching positions
/// `0..len` ordered by increasing rate.
///
/// Each accepted candidate raises the lower bound to its position.
/// A rejected one lowers the upper bound, but by at most [`SEARCH_SLACK`]
/// positions past it, so a locally non-monotone metric does not hide a
/// faster acceptable candidate further up.
pub fn search_highest<T>(len: usize, mut eval: impl FnMut(usize) -> Option<T>) -> Option<T> {
    // `lo` and `hi` count candidates; step `middle` evaluates position `middle - 1`.
    let mut lo = 0;
    let mut hi = len;
    let mut best = None;
    while lo < hi {
        let middle = lo + (hi - lo).div_ceil(2);
        debug!("Searching arrival traces: min {}, max {}, middle {}", lo, hi, middle);
        match eval(middle - 1) {
            Some(found) => {
                lo = middle;
                best = Some(found);
            }
            None => hi = (hi - 1).min(middle + SEARCH_SLACK - 1),
        }
    }
    best
}

/// Throughput measure used to match a trace to a target rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum SelectionMetric {
    Mean,
    Peak { slo_window: Duration },
}

impl SelectionMetric {
    fn measure(&self, trace: &ArrivalTrace) -> f64 {
        match self {
            SelectionMetric::Mean => trace.mean_throughput(),
            SelectionMetric::Peak { slo_window } => trace.peak_throughput(*slo_window),
        }
    }
}

/// The trace picked for one target throughput
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceChoice {
    pub target: f64,
    /// Rate key of the chosen trace; None when every trace is too fast
    pub rate: Option<u64>,
    pub throughput: Option<f64>,
}

/// Arrival traces keyed by the rate they were generated with
#[derive(Debug, Clone, Default)]
pub struct ArrivalLibrary {
    traces: BTreeMap<u64, ArrivalTrace>,
}

impl ArrivalLibrary {
    pub fn from_traces(traces: BTreeMap<u64, ArrivalTrace>) -> Self {
        Self { traces }
    }

    /// Load every `*deltas*` file in `dir` generated with coefficient of
    /// variation `cv`. Names are `<rate>.deltas` for cv 1 and
    /// `<rate>_<cv>.deltas` otherwise; other files are skipped.
    pub fn load_dir(dir: impl AsRef<Path>, cv: f64) -> Result<Self, TraceError> {
        let dir = dir.as_ref();
        let io_error = |source| TraceError::Io {
            path: dir.display().to_string(),
            source,
        };
        let mut traces = BTreeMap::new();
        for entry in std::fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rate) = trace_rate(name, cv) else {
                continue;
            };
            match ArrivalTrace::load(&path) {
                Ok(trace) => {
                    traces.insert(rate, trace);
                }
                Err(e) => warn!("Skipping arrival trace: {}", e),
            }
        }
        if traces.is_empty() {
            return Err(TraceError::NoTraces {
                dir: dir.display().to_string(),
                cv,
            });
        }
        debug!("Loaded {} arrival trace(s) from {}", traces.len(), dir.display());
        Ok(Self { traces })
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn rates(&self) -> impl Iterator<Item = u64> + '_ {
        self.traces.keys().copied()
    }

    pub fn get(&self, rate: u64) -> Option<&ArrivalTrace> {
        self.traces.get(&rate)
    }

    /// Fastest trace whose `metric` is at most `target`, as `(rate, throughput)`.
    pub fn select(&self, target: f64, metric: SelectionMetric) -> Option<(u64, f64)> {
        let ordered: Vec<(&u64, &ArrivalTrace)> = self.traces.iter().collect();
        search_highest(ordered.len(), |position| {
            let (rate, trace) = ordered[position];
            let throughput = metric.measure(trace);
            (throughput <= target).then_some((*rate, throughput))
        })
    }

    pub fn select_all(&self, targets: &[f64], metric: SelectionMetric) -> Vec<TraceChoice> {
        targets
            .iter()
            .map(|target| {
                let chosen = self.select(*target, metric);
                TraceChoice {
                    target: *target,
                    rate: chosen.map(|(rate, _)| rate),
                    throughput: chosen.map(|(_, throughput)| throughput),
                }
            })
            .collect()
    }
}

fn trace_rate(name: &str, cv: f64) -> Option<u64> {
    let (stem, _) = name.split_once("deltas")?;
    let stem = stem.trim_end_matches(['.', '_']);
    match stem.split_once('_') {
        None if cv == 1.0 => stem.parse().ok(),
        Some((rate, file_cv)) if file_cv.parse::<f64>().ok() == Some(cv) => rate.parse().ok(),
        _ => None,
    }
}

/// How the load generator paces issuances
#[derive(Debug, Clone, PartialEq)]
pub enum Pacing {
    /// Wait for each execution to finish, then sleep `delay`
    ClosedLoop { delay: Duration },
    /// Sleep `delay` between issuances without waiting
    FixedInterval { delay: Duration },
    /// Open loop: sleep the trace's next delta
    Trace(ArrivalTrace),
}

impl Pacing {
    pub fn waits_for_completion(&self) -> bool {
        matches!(self, Pacing::ClosedLoop { .. })
    }

    /// Delay before the next issuance; `None` ends the run.
    pub fn next_delay(&mut self) -> Option<Duration> {
        match self {
            Pacing::ClosedLoop { delay } | Pacing::FixedInterval { delay } => Some(*delay),
            Pacing::Trace(trace) => trace.next_delay(),
        }
    }
}
