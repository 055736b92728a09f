// Shared by several test binaries; not every helper is used by each.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sgl_pipeline_bench::client::{AsyncClient, ClientConfig};
use sgl_pipeline_bench::mock_service::{MockBehavior, MockService, MockServiceConfig};
use sgl_pipeline_bench::transport::TransportKind;

/// Mock service on an ephemeral TCP port with the given per-service behaviour
pub async fn start_tcp_mock(services: &[(&str, MockBehavior)]) -> (MockService, String) {
    let mock = MockService::new(mock_config(services));
    let addr = mock
        .serve_tcp("127.0.0.1:0")
        .await
        .expect("Failed to bind mock TCP service");
    (mock, addr.to_string())
}

/// Mock service on an ephemeral HTTP port
pub fn start_http_mock(services: &[(&str, MockBehavior)]) -> (MockService, String) {
    let mock = MockService::new(mock_config(services));
    let addr = mock
        .serve_http("127.0.0.1:0")
        .expect("Failed to bind mock HTTP service");
    (mock, format!("http://{}", addr))
}

fn mock_config(services: &[(&str, MockBehavior)]) -> MockServiceConfig {
    MockServiceConfig {
        default: MockBehavior::default(),
        services: services
            .iter()
            .map(|(name, behavior)| (name.to_string(), behavior.clone()))
            .collect(),
        ..Default::default()
    }
}

/// Every named service served by the single replica at `address`
pub fn client_config(
    transport: TransportKind,
    address: &str,
    services: &[&str],
    request_timeout: Duration,
) -> ClientConfig {
    ClientConfig {
        transport,
        services: services
            .iter()
            .map(|s| (s.to_string(), vec![address.to_string()]))
            .collect::<BTreeMap<_, _>>(),
        request_timeout,
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub async fn started_client(config: ClientConfig) -> Arc<AsyncClient> {
    let client = Arc::new(AsyncClient::new(config));
    client.start().await.expect("Failed to start client");
    client
}

/// A localhost address nothing listens on
pub fn unused_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");
    drop(listener);
    addr.to_string()
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
