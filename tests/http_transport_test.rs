mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{client_config, start_http_mock, started_client, unused_address};
use sgl_pipeline_bench::client::AsyncClient;
use sgl_pipeline_bench::error::ClientError;
use sgl_pipeline_bench::mock_service::MockBehavior;
use sgl_pipeline_bench::pipeline::{BranchResult, PipelineExecutor, StageGraph, StageSpec};
use sgl_pipeline_bench::protocol::Outcome;
use sgl_pipeline_bench::stats::StatsAggregator;
use sgl_pipeline_bench::transport::TransportKind;

#[actix_web::test]
async fn test_http_call_round_trips_through_mock() {
    let summarize = MockBehavior {
        output_len: Some(2),
        ..Default::default()
    };
    let (mock, url) = start_http_mock(&[("summary", summarize)]);
    let client = started_client(client_config(
        TransportKind::Http,
        &url,
        &["echo", "summary"],
        Duration::from_secs(5),
    ))
    .await;

    assert_eq!(
        client.call("echo", vec![0.5, 1.5]).await,
        Outcome::Success(vec![0.5, 1.5])
    );
    assert_eq!(
        client.call("summary", vec![1.0, 3.0]).await,
        Outcome::Success(vec![2.0, 2.0])
    );
    assert_eq!(mock.requests_received(), 2);
    mock.shutdown().await;
}

#[actix_web::test]
async fn test_http_failure_status_is_unavailable() {
    let (mock, url) = start_http_mock(&[("broken", MockBehavior::failing())]);
    let client = started_client(client_config(
        TransportKind::Http,
        &url,
        &["broken"],
        Duration::from_secs(5),
    ))
    .await;

    assert!(matches!(
        client.call("broken", vec![1.0]).await,
        Outcome::Unavailable { .. }
    ));
    mock.shutdown().await;
}

#[actix_web::test]
async fn test_http_hanging_service_times_out() {
    let (mock, url) = start_http_mock(&[("void", MockBehavior::dropping())]);
    let client = started_client(client_config(
        TransportKind::Http,
        &url,
        &["void"],
        Duration::from_millis(150),
    ))
    .await;

    assert_eq!(client.call("void", vec![1.0]).await, Outcome::Timeout);
    assert_eq!(client.counters().timeouts, 1);
    mock.shutdown().await;
}

#[actix_web::test]
async fn test_http_start_fails_when_health_check_cannot_connect() {
    let url = format!("http://{}", unused_address());
    let client = AsyncClient::new(client_config(
        TransportKind::Http,
        &url,
        &["m"],
        Duration::from_secs(1),
    ));
    assert!(matches!(
        client.start().await,
        Err(ClientError::Unreachable { .. })
    ));
}

#[actix_web::test]
async fn test_pipeline_over_http() {
    let (mock, url) = start_http_mock(&[]);
    let client = started_client(client_config(
        TransportKind::Http,
        &url,
        &["first", "second"],
        Duration::from_secs(5),
    ))
    .await;
    let graph = StageGraph::new(vec![
        StageSpec::leaf("first", "first").with_children(vec![StageSpec::leaf("second", "second")]),
    ])
    .unwrap();
    let executor = PipelineExecutor::new(client, graph, Arc::new(StatsAggregator::new(1))).unwrap();

    let report = executor
        .execute(HashMap::from([("first".to_string(), vec![7.0])]))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(report.branches["second"], BranchResult::Completed(vec![7.0]));
    assert_eq!(executor.stats().snapshot_count(), 1);
    mock.shutdown().await;
}
