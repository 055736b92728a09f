//! Multi-stage pipeline execution
//!
//! A pipeline is a forest of stages. Each logical input sends every entry
//! stage at once; a stage's continuation either records a leaf result or
//! feeds the (transformed) output to its children. A stage that times out or
//! is unavailable marks every leaf beneath it as skipped, so an execution
//! always completes once each leaf has a result or a skip.
//!
//! Only executions in which every leaf completed contribute a latency sample.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::AsyncClient;
use crate::error::ClientError;
use crate::protocol::{Outcome, Payload};
use crate::stats::StatsAggregator;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline has no entry stages")]
    EmptyGraph,

    #[error("Stage name {name} is used more than once")]
    DuplicateStage { name: String },

    #[error("Stage {stage} has no service")]
    MissingService { stage: String },

    #[error("Stage {stage} targets service {service}, which is not configured")]
    UnconfiguredService { stage: String, service: String },

    #[error("No input supplied for entry stage {stage}")]
    MissingInput { stage: String },

    #[error("Input supplied for {stage}, which is not an entry stage")]
    UnknownEntry { stage: String },

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Shapes a parent's output into a child's input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputTransform {
    #[default]
    Identity,
    /// Keep at most `len` leading values
    Truncate { len: usize },
    /// Keep only the first value (e.g. a predicted class)
    TakeFirst,
}

impl InputTransform {
    pub fn apply(&self, payload: Payload) -> Payload {
        match self {
            InputTransform::Identity => payload,
            InputTransform::Truncate { len } => {
                let mut payload = payload;
                payload.truncate(*len);
                payload
            }
            InputTransform::TakeFirst => payload.into_iter().take(1).collect(),
        }
    }
}

/// Declarative description of one stage and its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub service: String,
    #[serde(default)]
    pub transform: InputTransform,
    #[serde(default)]
    pub children: Vec<StageSpec>,
}

impl StageSpec {
    pub fn leaf(name: impl Into<String>, service: impl Into<String>) -> Self {
        StageSpec {
            name: name.into(),
            service: service.into(),
            transform: InputTransform::Identity,
            children: Vec::new(),
        }
    }

    pub fn with_transform(mut self, transform: InputTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_children(mut self, children: Vec<StageSpec>) -> Self {
        self.children = children;
        self
    }
}

#[derive(Debug)]
struct StageNode {
    name: String,
    service: String,
    transform: InputTransform,
    children: Vec<Arc<StageNode>>,
    /// Names of every leaf at or below this stage
    leaves: Vec<String>,
}

impl StageNode {
    fn build(spec: StageSpec, seen: &mut HashSet<String>) -> Result<Arc<Self>, PipelineError> {
        if !seen.insert(spec.name.clone()) {
            return Err(PipelineError::DuplicateStage { name: spec.name });
        }
        if spec.service.is_empty() {
            return Err(PipelineError::MissingService { stage: spec.name });
        }
        let children = spec
            .children
            .into_iter()
            .map(|child| StageNode::build(child, seen))
            .collect::<Result<Vec<_>, _>>()?;
        let leaves = if children.is_empty() {
            vec![spec.name.clone()]
        } else {
            children.iter().flat_map(|c| c.leaves.iter().cloned()).collect()
        };
        Ok(Arc::new(StageNode {
            name: spec.name,
            service: spec.service,
            transform: spec.transform,
            children,
            leaves,
        }))
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a StageNode)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }
}

/// Validated stage forest
#[derive(Debug)]
pub struct StageGraph {
    entries: Vec<Arc<StageNode>>,
    branches: Arc<HashSet<String>>,
}

impl StageGraph {
    pub fn new(entries: Vec<StageSpec>) -> Result<Self, PipelineError> {
        if entries.is_empty() {
            return Err(PipelineError::EmptyGraph);
        }
        let mut seen = HashSet::new();
        let entries = entries
            .into_iter()
            .map(|spec| StageNode::build(spec, &mut seen))
            .collect::<Result<Vec<_>, _>>()?;
        let branches = entries
            .iter()
            .flat_map(|e| e.leaves.iter().cloned())
            .collect();
        Ok(StageGraph {
            entries,
            branches: Arc::new(branches),
        })
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Leaf stage names; each is one branch of an execution
    pub fn branches(&self) -> &HashSet<String> {
        &self.branches
    }

    /// Every service any stage talks to
    pub fn services(&self) -> HashSet<&str> {
        let mut services = HashSet::new();
        for entry in &self.entries {
            entry.visit(&mut |node| {
                services.insert(node.service.as_str());
            });
        }
        services
    }

    pub fn stage_count(&self) -> usize {
        let mut count = 0;
        for entry in &self.entries {
            entry.visit(&mut |_| count += 1);
        }
        count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Timeout,
    Unavailable(String),
}

/// Terminal state of one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BranchResult {
    Completed(Payload),
    /// `stage` is the stage whose failure cut this branch off
    Skipped { stage: String, reason: SkipReason },
}

impl BranchResult {
    pub fn is_skipped(&self) -> bool {
        matches!(self, BranchResult::Skipped { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownBranch,
    AlreadyRecorded,
    AlreadyComplete,
}

#[derive(Debug, PartialEq)]
pub enum RecordOutcome {
    Pending,
    /// Returned to exactly one caller: the one whose record completed the set
    Completed(HashMap<String, BranchResult>),
    Rejected(RejectReason),
}

#[derive(Debug, Default)]
struct TrackerState {
    results: HashMap<String, BranchResult>,
    complete: bool,
}

/// Collects branch results for one execution and detects completion
#[derive(Debug)]
pub struct BranchTracker {
    expected: Arc<HashSet<String>>,
    state: Mutex<TrackerState>,
}

impl BranchTracker {
    pub fn new(expected: Arc<HashSet<String>>) -> Self {
        BranchTracker {
            expected,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn record(&self, branch: &str, result: BranchResult) -> RecordOutcome {
        if !self.expected.contains(branch) {
            return RecordOutcome::Rejected(RejectReason::UnknownBranch);
        }
        let mut state = self.state.lock();
        if state.complete {
            return RecordOutcome::Rejected(RejectReason::AlreadyComplete);
        }
        if state.results.contains_key(branch) {
            return RecordOutcome::Rejected(RejectReason::AlreadyRecorded);
        }
        state.results.insert(branch.to_string(), result);
        if state.results.len() == self.expected.len() {
            state.complete = true;
            RecordOutcome::Completed(std::mem::take(&mut state.results))
        } else {
            RecordOutcome::Pending
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub latency: Duration,
    pub branches: HashMap<String, BranchResult>,
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct ExecutionCounters {
    issued: AtomicU64,
    completed: AtomicU64,
    degraded: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCountersSnapshot {
    pub issued: u64,
    pub completed: u64,
    pub degraded: u64,
    pub in_flight: u64,
}

/// One payload per entry stage, keyed by stage name
pub type PipelineInput = HashMap<String, Payload>;

/// State shared by every continuation of one execution
struct Execution {
    client: Arc<AsyncClient>,
    stats: Arc<StatsAggregator>,
    counters: Arc<ExecutionCounters>,
    tracker: BranchTracker,
    started: Instant,
    reply: Mutex<Option<oneshot::Sender<ExecutionReport>>>,
}

impl Execution {
    fn run_stage(self: &Arc<Self>, node: Arc<StageNode>, input: Payload) {
        let payload = node.transform.apply(input);
        let execution = self.clone();
        let stage = node.clone();
        let sent = self.client.send(&node.service, payload, move |outcome| {
            execution.on_stage_outcome(stage, outcome)
        });
        if let Err(e) = sent {
            warn!("Failed to send stage {}: {}", node.name, e);
            self.skip_below(&node, SkipReason::Unavailable(e.to_string()));
        }
    }

    fn on_stage_outcome(self: Arc<Self>, node: Arc<StageNode>, outcome: Outcome) {
        match outcome {
            Outcome::Success(output) => {
                if node.children.is_empty() {
                    self.record(&node.name, BranchResult::Completed(output));
                } else {
                    for child in &node.children {
                        self.run_stage(child.clone(), output.clone());
                    }
                }
            }
            Outcome::Timeout => self.skip_below(&node, SkipReason::Timeout),
            Outcome::Unavailable { reason } => {
                self.skip_below(&node, SkipReason::Unavailable(reason))
            }
        }
    }

    fn skip_below(&self, node: &StageNode, reason: SkipReason) {
        debug!(
            "Stage {} failed ({:?}), skipping {} branch(es)",
            node.name,
            reason,
            node.leaves.len()
        );
        for leaf in &node.leaves {
            self.record(
                leaf,
                BranchResult::Skipped {
                    stage: node.name.clone(),
                    reason: reason.clone(),
                },
            );
        }
    }

    fn record(&self, branch: &str, result: BranchResult) {
        match self.tracker.record(branch, result) {
            RecordOutcome::Pending => {}
            RecordOutcome::Completed(branches) => self.finish(branches),
            RecordOutcome::Rejected(reason) => {
                warn!("Rejected result for branch {}: {:?}", branch, reason);
            }
        }
    }

    fn finish(&self, branches: HashMap<String, BranchResult>) {
        let latency = self.started.elapsed();
        let degraded = branches.values().any(BranchResult::is_skipped);
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        if degraded {
            self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            self.stats.record(latency);
        }
        if let Some(reply) = self.reply.lock().take() {
            let _ = reply.send(ExecutionReport {
                latency,
                branches,
                degraded,
            });
        }
    }
}

/// Runs logical inputs through a [`StageGraph`] and feeds the stats aggregator
pub struct PipelineExecutor {
    client: Arc<AsyncClient>,
    graph: Arc<StageGraph>,
    stats: Arc<StatsAggregator>,
    counters: Arc<ExecutionCounters>,
}

impl PipelineExecutor {
    /// Fails if a stage targets a service the client does not know.
    pub fn new(
        client: Arc<AsyncClient>,
        graph: StageGraph,
        stats: Arc<StatsAggregator>,
    ) -> Result<Self, PipelineError> {
        for entry in &graph.entries {
            let mut missing = None;
            entry.visit(&mut |node| {
                if missing.is_none() && !client.config().services.contains_key(&node.service) {
                    missing = Some(node);
                }
            });
            if let Some(node) = missing {
                return Err(PipelineError::UnconfiguredService {
                    stage: node.name.clone(),
                    service: node.service.clone(),
                });
            }
        }
        Ok(PipelineExecutor {
            client,
            graph: Arc::new(graph),
            stats,
            counters: Arc::new(ExecutionCounters::default()),
        })
    }

    /// Start one execution. The returned receiver yields the report once
    /// every branch has completed or been skipped; it may be dropped.
    pub fn execute(
        &self,
        mut input: PipelineInput,
    ) -> Result<oneshot::Receiver<ExecutionReport>, PipelineError> {
        if !self.client.is_started() {
            return Err(ClientError::NotStarted.into());
        }
        let mut payloads = Vec::with_capacity(self.graph.entries.len());
        for entry in &self.graph.entries {
            let payload = input
                .remove(&entry.name)
                .ok_or_else(|| PipelineError::MissingInput {
                    stage: entry.name.clone(),
                })?;
            payloads.push((entry.clone(), payload));
        }
        if let Some(stage) = input.into_keys().next() {
            return Err(PipelineError::UnknownEntry { stage });
        }

        let (tx, rx) = oneshot::channel();
        let execution = Arc::new(Execution {
            client: self.client.clone(),
            stats: self.stats.clone(),
            counters: self.counters.clone(),
            tracker: BranchTracker::new(self.graph.branches.clone()),
            started: Instant::now(),
            reply: Mutex::new(Some(tx)),
        });
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        for (entry, payload) in payloads {
            execution.run_stage(entry, payload);
        }
        Ok(rx)
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn client(&self) -> &Arc<AsyncClient> {
        &self.client
    }

    pub fn in_flight(&self) -> u64 {
        self.counters.in_flight.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> ExecutionCountersSnapshot {
        ExecutionCountersSnapshot {
            issued: self.counters.issued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }
}
