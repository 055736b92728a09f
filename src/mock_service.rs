//! Stand-in inference service
//!
//! Serves the binary frame protocol over TCP and the JSON protocol over HTTP.
//! Each service name can be given its own delay, jitter, drop rate and failure
//! mode, which is enough to reproduce out-of-order responses, timeouts and
//! unavailable stages against a real client.
//!
//! The HTTP side also serves `GET /metrics` in the serving system's metrics
//! format: per-service batch-size and queue-size histograms, a prediction
//! throughput meter and a prediction counter.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpResponse, HttpServer, get, post, web};
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, Frame};
use crate::protocol::{Payload, PredictRequest, PredictResponse, RequestFrame, ResponseFrame};

/// How long a dropped HTTP request is held open; the client times out first.
const HTTP_DROP_HOLD: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockBehavior {
    #[serde(default)]
    pub delay_ms: u64,
    /// Extra uniformly random delay in `0..=jitter_ms`
    #[serde(default)]
    pub jitter_ms: u64,
    /// Probability that a request is never answered
    #[serde(default)]
    pub drop_rate: f32,
    /// Answer every request with an unavailable status
    #[serde(default)]
    pub fail: bool,
    /// Output length; None echoes the input
    #[serde(default)]
    pub output_len: Option<usize>,
    /// Send every TCP response twice
    #[serde(default)]
    pub duplicate_responses: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            jitter_ms: 0,
            drop_rate: 0.0,
            fail: false,
            output_len: None,
            duplicate_responses: false,
        }
    }
}

impl MockBehavior {
    pub fn delayed(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    pub fn dropping() -> Self {
        Self {
            drop_rate: 1.0,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn sample_delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::rng().random_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.delay_ms + jitter)
    }

    fn should_drop(&self) -> bool {
        self.drop_rate > 0.0 && rand::random::<f32>() < self.drop_rate
    }

    /// Output for one input: the echo, or `output_len` copies of the input mean.
    fn output_for(&self, input: Payload) -> Payload {
        match self.output_len {
            None => input,
            Some(len) => {
                let mean = if input.is_empty() {
                    0.0
                } else {
                    input.iter().sum::<f32>() / input.len() as f32
                };
                vec![mean; len]
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockServiceConfig {
    /// Behaviour of any service not listed in `services`
    #[serde(default)]
    pub default: MockBehavior,
    #[serde(default)]
    pub services: HashMap<String, MockBehavior>,
    /// Serve a `/metrics` document without the expected sections
    #[serde(default)]
    pub malformed_metrics: bool,
}

#[derive(Debug, Default)]
struct ServiceTally {
    batches: u64,
    predictions: u64,
    /// Responses scheduled but not yet sent
    pending: u64,
}

struct MockState {
    config: RwLock<MockServiceConfig>,
    requests: AtomicU64,
    tallies: Mutex<BTreeMap<String, ServiceTally>>,
    started_at: Instant,
}

impl MockState {
    fn new(config: MockServiceConfig) -> Self {
        Self {
            config: RwLock::new(config),
            requests: AtomicU64::new(0),
            tallies: Mutex::new(BTreeMap::new()),
            started_at: Instant::now(),
        }
    }

    fn record_batch(&self, service: &str, size: usize) {
        self.requests.fetch_add(size as u64, Ordering::Relaxed);
        let mut tallies = self.tallies.lock();
        let tally = tallies.entry(service.to_string()).or_default();
        tally.batches += 1;
        tally.predictions += size as u64;
    }

    fn adjust_pending(&self, service: &str, scheduled: bool) {
        let mut tallies = self.tallies.lock();
        let tally = tallies.entry(service.to_string()).or_default();
        tally.pending = if scheduled {
            tally.pending + 1
        } else {
            tally.pending.saturating_sub(1)
        };
    }

    fn metrics_document(&self) -> Value {
        if self.config.read().malformed_metrics {
            return json!({ "histograms": "unavailable" });
        }
        let elapsed = self.started_at.elapsed().as_secs_f64().max(1e-3);
        let mut histograms = Vec::new();
        let mut meters = Vec::new();
        let mut counters = Vec::new();
        for (service, tally) in self.tallies.lock().iter() {
            let mean_batch = if tally.batches == 0 {
                0.0
            } else {
                tally.predictions as f64 / tally.batches as f64
            };
            histograms.push(named(
                format!("{}:batch_size", service),
                json!({ "mean": format!("{:.2}", mean_batch), "count": tally.batches }),
            ));
            histograms.push(named(
                format!("{}:queue_size", service),
                json!({ "mean": format!("{}", tally.pending) }),
            ));
            meters.push(named(
                format!("{}:prediction_throughput", service),
                json!({
                    "rate": format!("{:.5}", tally.predictions as f64 / elapsed),
                    "unit": "events per second",
                }),
            ));
            counters.push(named(
                format!("{}:num_predictions", service),
                json!({ "count": tally.predictions }),
            ));
        }
        json!({ "histograms": histograms, "meters": meters, "counters": counters })
    }

    fn behavior_for(&self, service: &str) -> MockBehavior {
        let config = self.config.read();
        config
            .services
            .get(service)
            .unwrap_or(&config.default)
            .clone()
    }
}

pub struct MockService {
    state: Arc<MockState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    http_servers: Mutex<Vec<ServerHandle>>,
}

impl MockService {
    pub fn new(config: MockServiceConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(MockState::new(config)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            http_servers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, service: &str, behavior: MockBehavior) {
        self.state
            .config
            .write()
            .services
            .insert(service.to_string(), behavior);
    }

    /// Requests received over either protocol, counting each id in a batch
    pub fn requests_received(&self) -> u64 {
        self.state.requests.load(Ordering::Relaxed)
    }

    /// Listen for framed TCP connections. Returns the bound address.
    pub async fn serve_tcp(&self, addr: &str) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let state = self.state.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Mock service accepted {}", peer);
                            tokio::spawn(serve_connection(
                                stream,
                                state.clone(),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => warn!("Mock service accept failed: {}", e),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
        info!("Mock service listening for frames on {}", local);
        Ok(local)
    }

    /// Serve `GET /health`, `GET /metrics` and `POST /predict/{service}`.
    /// Returns the bound address.
    pub fn serve_http(&self, addr: &str) -> std::io::Result<SocketAddr> {
        let data = web::Data::from(self.state.clone());
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .service(health)
                .service(metrics)
                .service(predict)
        })
        .workers(1)
        .disable_signals()
        .bind(addr)?;
        let local = server
            .addrs()
            .first()
            .copied()
            .ok_or_else(|| std::io::Error::other("HTTP server bound no address"))?;
        let server = server.run();
        self.http_servers.lock().push(server.handle());
        self.tasks.lock().push(tokio::spawn(async move {
            if let Err(e) = server.await {
                warn!("Mock HTTP server stopped with error: {}", e);
            }
        }));
        info!("Mock service listening for HTTP on {}", local);
        Ok(local)
    }

    /// Stop listening and close every open connection.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let servers: Vec<ServerHandle> = self.http_servers.lock().drain(..).collect();
        for server in servers {
            server.stop(false).await;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<MockState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseFrame>();

    let mut writer_shutdown = shutdown.clone();
    let write_task = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = writer_shutdown.changed() => break,
            };
            buf.clear();
            if let Err(e) = codec::encode_response(&frame, &mut buf) {
                warn!("Mock service cannot encode response: {}", e);
                continue;
            }
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(16 * 1024);
    'read: loop {
        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            _ = shutdown.changed() => break 'read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => loop {
                match codec::decode(&mut buf) {
                    Ok(Some(Frame::Request(request))) => handle_frame(request, &state, &tx),
                    Ok(Some(Frame::Response(_))) => {
                        warn!("Mock service ignoring response frame from client");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Mock service closing connection: {}", e);
                        break 'read;
                    }
                }
            },
        }
    }
    write_task.abort();
}

/// Answer each id of a request independently, so responses to one batch can
/// be reordered by jitter.
fn handle_frame(
    request: RequestFrame,
    state: &Arc<MockState>,
    tx: &mpsc::UnboundedSender<ResponseFrame>,
) {
    let behavior = state.behavior_for(&request.service);
    state.record_batch(&request.service, request.ids.len());

    for (id, input) in request.ids.into_iter().zip(request.inputs) {
        if behavior.should_drop() {
            debug!("Mock {} dropping request {}", request.service, id);
            continue;
        }
        let delay = behavior.sample_delay();
        let frame = if behavior.fail {
            ResponseFrame::unavailable(vec![id])
        } else {
            ResponseFrame::ok(vec![id], vec![behavior.output_for(input)])
        };
        let duplicate = behavior.duplicate_responses.then(|| frame.clone());
        let tx = tx.clone();
        let state = state.clone();
        let service = request.service.clone();
        state.adjust_pending(&service, true);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            state.adjust_pending(&service, false);
            let _ = tx.send(frame);
            if let Some(duplicate) = duplicate {
                let _ = tx.send(duplicate);
            }
        });
    }
}

fn named(name: String, fields: Value) -> Value {
    let mut entry = Map::new();
    entry.insert(name, fields);
    Value::Object(entry)
}

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

#[get("/metrics")]
async fn metrics(state: web::Data<MockState>) -> HttpResponse {
    HttpResponse::Ok().json(state.metrics_document())
}

#[post("/predict/{service}")]
async fn predict(
    path: web::Path<String>,
    body: web::Json<PredictRequest>,
    state: web::Data<MockState>,
) -> HttpResponse {
    let service = path.into_inner();
    let behavior = state.behavior_for(&service);
    let PredictRequest { ids, inputs } = body.into_inner();
    state.record_batch(&service, ids.len());

    if behavior.should_drop() {
        tokio::time::sleep(HTTP_DROP_HOLD).await;
    }
    let delay = behavior.sample_delay();
    state.adjust_pending(&service, true);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    state.adjust_pending(&service, false);
    if behavior.fail {
        return HttpResponse::ServiceUnavailable().json(json!({
            "error": format!("service {} is failing", service)
        }));
    }
    let outputs = inputs
        .into_iter()
        .map(|input| behavior.output_for(input))
        .collect();
    HttpResponse::Ok().json(PredictResponse { ids, outputs })
}
