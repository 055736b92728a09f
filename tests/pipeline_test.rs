mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{client_config, start_tcp_mock, started_client, wait_until};
use sgl_pipeline_bench::client::AsyncClient;
use sgl_pipeline_bench::error::ClientError;
use sgl_pipeline_bench::mock_service::MockBehavior;
use sgl_pipeline_bench::pipeline::{
    BranchResult, InputTransform, PipelineError, PipelineExecutor, SkipReason, StageGraph,
    StageSpec,
};
use sgl_pipeline_bench::stats::StatsAggregator;
use sgl_pipeline_bench::transport::TransportKind;

const SERVICES: [&str; 4] = ["a", "b", "c", "d"];

/// A -> C and B -> D, C keeps only the first value of A's output
fn two_chain_graph() -> StageGraph {
    StageGraph::new(vec![
        StageSpec::leaf("A", "a").with_children(vec![
            StageSpec::leaf("C", "c").with_transform(InputTransform::TakeFirst),
        ]),
        StageSpec::leaf("B", "b").with_children(vec![StageSpec::leaf("D", "d")]),
    ])
    .unwrap()
}

fn input() -> HashMap<String, Vec<f32>> {
    HashMap::from([
        ("A".to_string(), vec![1.0, 2.0, 3.0]),
        ("B".to_string(), vec![4.0, 5.0]),
    ])
}

async fn executor(
    behaviors: &[(&str, MockBehavior)],
    timeout: Duration,
    trial_length: usize,
) -> (sgl_pipeline_bench::mock_service::MockService, PipelineExecutor) {
    let (mock, addr) = start_tcp_mock(behaviors).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &SERVICES, timeout)).await;
    let stats = Arc::new(StatsAggregator::new(trial_length));
    let executor = PipelineExecutor::new(client, two_chain_graph(), stats).unwrap();
    (mock, executor)
}

#[tokio::test]
async fn test_happy_path_completes_both_branches_and_records_one_sample() {
    let (mock, executor) = executor(&[], Duration::from_secs(5), 1).await;

    let report = executor.execute(input()).unwrap().await.unwrap();

    assert!(!report.degraded);
    assert_eq!(report.branches.len(), 2);
    assert_eq!(report.branches["C"], BranchResult::Completed(vec![1.0]));
    assert_eq!(report.branches["D"], BranchResult::Completed(vec![4.0, 5.0]));
    assert_eq!(mock.requests_received(), 4);

    let history = executor.stats().history();
    assert_eq!(history.snapshots.len(), 1);
    assert_eq!(history.all_latencies_ms.len(), 1);
    let counters = executor.counters();
    assert_eq!((counters.issued, counters.completed, counters.in_flight), (1, 1, 0));
}

#[tokio::test]
async fn test_partial_timeout_skips_downstream_and_is_excluded_from_stats() {
    let (mock, executor) = executor(
        &[("b", MockBehavior::dropping())],
        Duration::from_millis(100),
        1,
    )
    .await;

    let report = executor.execute(input()).unwrap().await.unwrap();

    assert!(report.degraded);
    assert_eq!(report.branches["C"], BranchResult::Completed(vec![1.0]));
    assert_eq!(
        report.branches["D"],
        BranchResult::Skipped {
            stage: "B".to_string(),
            reason: SkipReason::Timeout,
        }
    );
    // A, C and B were sent; D never was
    assert_eq!(mock.requests_received(), 3);
    assert_eq!(executor.stats().snapshot_count(), 0);
    assert_eq!(executor.stats().pending_samples(), 0);
    assert_eq!(executor.counters().degraded, 1);
}

#[tokio::test]
async fn test_unavailable_entry_stage_skips_its_branch() {
    let (_mock, executor) = executor(
        &[("a", MockBehavior::failing())],
        Duration::from_secs(5),
        1,
    )
    .await;

    let report = executor.execute(input()).unwrap().await.unwrap();

    assert!(report.degraded);
    assert!(matches!(
        &report.branches["C"],
        BranchResult::Skipped { stage, reason: SkipReason::Unavailable(_) } if stage == "A"
    ));
    assert!(!report.branches["D"].is_skipped());
}

#[tokio::test]
async fn test_one_stage_fanning_out_to_several_children() {
    let (_mock, addr) = start_tcp_mock(&[("c", MockBehavior::failing())]).await;
    let client = started_client(client_config(
        TransportKind::Tcp,
        &addr,
        &SERVICES,
        Duration::from_secs(5),
    ))
    .await;
    let graph = StageGraph::new(vec![StageSpec::leaf("A", "a").with_children(vec![
        StageSpec::leaf("B", "b").with_transform(InputTransform::Truncate { len: 1 }),
        StageSpec::leaf("C", "c"),
        StageSpec::leaf("D", "d"),
    ])])
    .unwrap();
    let executor =
        PipelineExecutor::new(client, graph, Arc::new(StatsAggregator::new(1))).unwrap();

    let report = executor
        .execute(HashMap::from([("A".to_string(), vec![9.0, 8.0])]))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(report.branches.len(), 3);
    assert_eq!(report.branches["B"], BranchResult::Completed(vec![9.0]));
    assert!(report.branches["C"].is_skipped());
    assert_eq!(report.branches["D"], BranchResult::Completed(vec![9.0, 8.0]));
}

#[tokio::test]
async fn test_windows_roll_over_across_executions() {
    let (_mock, executor) = executor(&[], Duration::from_secs(5), 5).await;

    let receivers: Vec<_> = (0..12).map(|_| executor.execute(input()).unwrap()).collect();
    for rx in receivers {
        rx.await.unwrap();
    }

    assert_eq!(executor.stats().snapshot_count(), 2);
    assert_eq!(executor.stats().pending_samples(), 2);
    assert_eq!(executor.counters().completed, 12);
}

#[tokio::test]
async fn test_dropped_report_receiver_still_records() {
    let (_mock, executor) = executor(&[], Duration::from_secs(5), 1).await;
    drop(executor.execute(input()).unwrap());
    assert!(
        wait_until(Duration::from_secs(2), || executor.stats().snapshot_count() == 1).await
    );
}

#[tokio::test]
async fn test_execute_rejects_bad_input_and_unstarted_client() {
    let (_mock, executor) = executor(&[], Duration::from_secs(5), 1).await;

    let mut missing = input();
    missing.remove("B");
    assert!(matches!(
        executor.execute(missing),
        Err(PipelineError::MissingInput { stage }) if stage == "B"
    ));

    let mut extra = input();
    extra.insert("C".to_string(), vec![]);
    assert!(matches!(
        executor.execute(extra),
        Err(PipelineError::UnknownEntry { stage }) if stage == "C"
    ));
    assert_eq!(executor.counters().issued, 0);

    let idle = Arc::new(AsyncClient::new(client_config(
        TransportKind::Tcp,
        "127.0.0.1:1",
        &SERVICES,
        Duration::from_secs(1),
    )));
    let unstarted =
        PipelineExecutor::new(idle, two_chain_graph(), Arc::new(StatsAggregator::new(1))).unwrap();
    assert!(matches!(
        unstarted.execute(input()),
        Err(PipelineError::Client(ClientError::NotStarted))
    ));
}

#[tokio::test]
async fn test_executor_rejects_stage_on_unconfigured_service() {
    let client = Arc::new(AsyncClient::new(client_config(
        TransportKind::Tcp,
        "127.0.0.1:1",
        &["a", "b", "c"],
        Duration::from_secs(1),
    )));
    let result = PipelineExecutor::new(client, two_chain_graph(), Arc::new(StatsAggregator::new(1)));
    assert!(matches!(
        result,
        Err(PipelineError::UnconfiguredService { service, .. }) if service == "d"
    ));
}
