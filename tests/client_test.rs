mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{client_config, start_tcp_mock, started_client, unused_address, wait_until};
use parking_lot::Mutex;
use sgl_pipeline_bench::client::AsyncClient;
use sgl_pipeline_bench::error::ClientError;
use sgl_pipeline_bench::mock_service::{MockBehavior, MockService, MockServiceConfig};
use sgl_pipeline_bench::protocol::Outcome;
use sgl_pipeline_bench::replica::ReplicaPolicy;
use sgl_pipeline_bench::transport::TransportKind;
use tokio::sync::oneshot;

const LONG: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_call_echoes_payload() {
    let (_mock, addr) = start_tcp_mock(&[]).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &["echo"], LONG)).await;

    let outcome = client.call("echo", vec![1.0, 2.0, 3.0]).await;
    assert_eq!(outcome, Outcome::Success(vec![1.0, 2.0, 3.0]));
    assert_eq!(client.outstanding(), 0);
    assert_eq!(client.counters().responses, 1);
}

#[tokio::test]
async fn test_outstanding_ids_are_unique_and_start_at_one() {
    let (_mock, addr) = start_tcp_mock(&[("slow", MockBehavior::delayed(200))]).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &["slow"], LONG)).await;

    let mut seqs = HashSet::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = oneshot::channel();
        let id = client
            .send("slow", vec![i as f32], move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();
        assert!(seqs.insert(id.seq), "duplicate id {:?}", id);
        receivers.push(rx);
    }
    assert_eq!(seqs.iter().min(), Some(&1));
    assert_eq!(client.outstanding(), 100);

    for rx in receivers {
        assert!(rx.await.unwrap().is_success());
    }
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_own_continuations() {
    let jittery = MockBehavior {
        delay_ms: 5,
        jitter_ms: 40,
        ..Default::default()
    };
    let (_mock, addr) = start_tcp_mock(&[("jitter", jittery)]).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &["jitter"], LONG)).await;

    let calls = (0..64).map(|i| {
        let client = client.clone();
        async move { (i, client.call("jitter", vec![i as f32]).await) }
    });
    for (i, outcome) in futures::future::join_all(calls).await {
        assert_eq!(outcome, Outcome::Success(vec![i as f32]));
    }
}

#[tokio::test]
async fn test_dropped_request_times_out() {
    let (_mock, addr) = start_tcp_mock(&[("void", MockBehavior::dropping())]).await;
    let client = started_client(client_config(
        TransportKind::Tcp,
        &addr,
        &["void"],
        Duration::from_millis(100),
    ))
    .await;

    let outcome = client.call("void", vec![0.0]).await;
    assert_eq!(outcome, Outcome::Timeout);
    assert_eq!(client.outstanding(), 0);
    assert_eq!(client.counters().timeouts, 1);
}

#[tokio::test]
async fn test_failing_service_is_unavailable() {
    let (_mock, addr) = start_tcp_mock(&[("broken", MockBehavior::failing())]).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &["broken"], LONG)).await;

    let outcome = client.call("broken", vec![0.0]).await;
    assert!(matches!(outcome, Outcome::Unavailable { .. }));
    assert_eq!(client.counters().unavailable, 1);
}

#[tokio::test]
async fn test_duplicate_response_is_counted_stale_and_delivered_once() {
    let duplicating = MockBehavior {
        duplicate_responses: true,
        ..Default::default()
    };
    let (_mock, addr) = start_tcp_mock(&[("dup", duplicating)]).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &["dup"], LONG)).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    client
        .send("dup", vec![4.0], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let client_ref = client.clone();
    assert!(wait_until(Duration::from_secs(2), || client_ref.counters().stale_responses == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_response_racing_timeout_fires_each_continuation_once() {
    let (_mock, addr) = start_tcp_mock(&[(
        "edge",
        MockBehavior {
            delay_ms: 40,
            jitter_ms: 20,
            ..Default::default()
        },
    )])
    .await;
    let client = started_client(client_config(
        TransportKind::Tcp,
        &addr,
        &["edge"],
        Duration::from_millis(50),
    ))
    .await;

    let fired: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; 50]));
    for i in 0..50 {
        let fired = fired.clone();
        client
            .send("edge", vec![i as f32], move |_| fired.lock()[i] += 1)
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fired.lock().iter().all(|count| *count == 1));
    let counters = client.counters();
    assert_eq!(counters.responses + counters.timeouts, 50);
    // every response that lost the race arrives as a stale response
    assert!(wait_until(Duration::from_secs(1), || client.counters().stale_responses == counters.timeouts).await);
}

#[tokio::test]
async fn test_start_fails_fast_on_unreachable_address() {
    let client = AsyncClient::new(client_config(
        TransportKind::Tcp,
        &unused_address(),
        &["gone"],
        LONG,
    ));
    match client.start().await {
        Err(ClientError::Unreachable { service, .. }) => assert_eq!(service, "gone"),
        other => panic!("expected Unreachable, got {:?}", other),
    }
    assert!(!client.is_started());
}

#[tokio::test]
async fn test_send_before_start_and_unknown_service() {
    let (_mock, addr) = start_tcp_mock(&[]).await;
    let client = AsyncClient::new(client_config(TransportKind::Tcp, &addr, &["echo"], LONG));
    assert!(matches!(
        client.send("echo", vec![], |_| {}),
        Err(ClientError::NotStarted)
    ));

    client.start().await.unwrap();
    // idempotent
    client.start().await.unwrap();
    assert!(matches!(
        client.send("nope", vec![], |_| {}),
        Err(ClientError::UnknownService { .. })
    ));
}

#[tokio::test]
async fn test_connection_loss_fails_outstanding_requests() {
    let (mock, addr) = start_tcp_mock(&[("void", MockBehavior::dropping())]).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &["void"], LONG)).await;

    let (tx, rx) = oneshot::channel();
    client
        .send("void", vec![1.0], move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    let client_ref = client.clone();
    assert!(wait_until(Duration::from_secs(1), || client_ref.outstanding() == 1).await);

    mock.shutdown().await;
    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("continuation should fire before the request timeout")
        .unwrap();
    assert!(matches!(outcome, Outcome::Unavailable { .. }));
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn test_round_robin_spreads_over_replicas() {
    let first = MockService::new(MockServiceConfig::default());
    let second = MockService::new(MockServiceConfig::default());
    let a = first.serve_tcp("127.0.0.1:0").await.unwrap().to_string();
    let b = second.serve_tcp("127.0.0.1:0").await.unwrap().to_string();

    let mut config = client_config(TransportKind::Tcp, &a, &["model"], LONG);
    config.services.insert("model".to_string(), vec![a, b]);
    config.replica_policy = ReplicaPolicy::RoundRobin;
    let client = started_client(config).await;

    for i in 0..4 {
        assert!(client.call("model", vec![i as f32]).await.is_success());
    }
    assert_eq!(first.requests_received(), 2);
    assert_eq!(second.requests_received(), 2);
}

#[tokio::test]
async fn test_send_after_connection_loss_is_unavailable_without_waiting() {
    let (mock, addr) = start_tcp_mock(&[]).await;
    let client = started_client(client_config(TransportKind::Tcp, &addr, &["echo"], LONG)).await;
    assert!(client.call("echo", vec![1.0]).await.is_success());

    mock.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), client.call("echo", vec![2.0]))
        .await
        .expect("a closed connection should answer before the request timeout");
    assert!(matches!(outcome, Outcome::Unavailable { .. }));
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn test_round_robin_skips_closed_replica() {
    let first = MockService::new(MockServiceConfig::default());
    let second = MockService::new(MockServiceConfig::default());
    let a = first.serve_tcp("127.0.0.1:0").await.unwrap().to_string();
    let b = second.serve_tcp("127.0.0.1:0").await.unwrap().to_string();

    let mut config = client_config(TransportKind::Tcp, &a, &["model"], LONG);
    config.services.insert("model".to_string(), vec![a, b]);
    config.replica_policy = ReplicaPolicy::RoundRobin;
    let client = started_client(config).await;

    second.shutdown().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..4 {
        let outcome = tokio::time::timeout(Duration::from_secs(2), client.call("model", vec![i as f32]))
            .await
            .expect("calls should not wait on the closed replica");
        assert!(outcome.is_success());
    }
    assert_eq!(first.requests_received(), 4);
    assert_eq!(second.requests_received(), 0);
}
