//! Load generation
//!
//! [`LoadGenerator::run`] issues logical inputs according to a [`Pacing`]
//! until one of its stop conditions holds. Closed-loop pacing keeps a single
//! execution in flight; the other modes are open loop and never wait.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::arrival::Pacing;
use crate::pipeline::{ExecutionReport, PipelineError, PipelineExecutor, PipelineInput};

/// Something that can start pipeline executions
pub trait Dispatch: Send + Sync {
    fn dispatch(
        &self,
        input: PipelineInput,
    ) -> Result<oneshot::Receiver<ExecutionReport>, PipelineError>;

    /// Stats snapshots emitted so far
    fn completed_trials(&self) -> usize;

    fn in_flight(&self) -> u64;
}

impl Dispatch for PipelineExecutor {
    fn dispatch(
        &self,
        input: PipelineInput,
    ) -> Result<oneshot::Receiver<ExecutionReport>, PipelineError> {
        self.execute(input)
    }

    fn completed_trials(&self) -> usize {
        self.stats().snapshot_count()
    }

    fn in_flight(&self) -> u64 {
        PipelineExecutor::in_flight(self)
    }
}

/// Whichever condition is met first ends the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopCondition {
    pub target_trials: Option<usize>,
    pub max_duration: Option<Duration>,
    pub max_requests: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetTrials,
    Duration,
    MaxRequests,
    InputsExhausted,
    TraceExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRunSummary {
    pub issued: u64,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

pub struct LoadGenerator<'a, D: Dispatch + ?Sized> {
    dispatcher: &'a D,
    pacing: Pacing,
    stop: StopCondition,
}

impl<'a, D: Dispatch + ?Sized> LoadGenerator<'a, D> {
    pub fn new(dispatcher: &'a D, pacing: Pacing, stop: StopCondition) -> Self {
        LoadGenerator {
            dispatcher,
            pacing,
            stop,
        }
    }

    fn should_stop(&self, started: Instant, issued: u64) -> Option<StopReason> {
        if let Some(target) = self.stop.target_trials
            && self.dispatcher.completed_trials() >= target
        {
            return Some(StopReason::TargetTrials);
        }
        if let Some(limit) = self.stop.max_duration
            && started.elapsed() >= limit
        {
            return Some(StopReason::Duration);
        }
        if let Some(limit) = self.stop.max_requests
            && issued >= limit
        {
            return Some(StopReason::MaxRequests);
        }
        None
    }

    /// Issue inputs until a stop condition holds. A dispatch error (a
    /// malformed input or an unstarted client) aborts the run.
    pub async fn run<I>(&mut self, mut inputs: I) -> Result<LoadRunSummary, PipelineError>
    where
        I: Iterator<Item = PipelineInput>,
    {
        let started = Instant::now();
        let mut issued = 0u64;

        let stop_reason = loop {
            if let Some(reason) = self.should_stop(started, issued) {
                break reason;
            }
            let Some(input) = inputs.next() else {
                break StopReason::InputsExhausted;
            };

            let completion = self.dispatcher.dispatch(input)?;
            issued += 1;
            if self.pacing.waits_for_completion() {
                // The sender is dropped without a report only if the
                // execution could never complete; either way move on.
                let _ = completion.await;
            }

            let Some(delay) = self.pacing.next_delay() else {
                break StopReason::TraceExhausted;
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
        };

        let elapsed = started.elapsed();
        info!(
            "Load run stopped ({:?}) after issuing {} request(s) in {:?}",
            stop_reason, issued, elapsed
        );
        Ok(LoadRunSummary {
            issued,
            elapsed,
            stop_reason,
        })
    }
}

/// Wait until nothing is in flight or `timeout` passes. Returns whether the
/// dispatcher drained.
pub async fn drain<D: Dispatch + ?Sized>(dispatcher: &D, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let in_flight = dispatcher.in_flight();
        if in_flight == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            debug!("Drain timed out with {} execution(s) in flight", in_flight);
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
