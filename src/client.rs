//! Asynchronous inference client
//!
//! [`AsyncClient::send`] hands a payload to one replica of a named service and
//! returns immediately. Each connection owns a [`CorrelationTable`] and a
//! receive task; when the matching response arrives the receive task removes
//! the entry and runs the continuation. A per-request timer races the response
//! for the same entry, so every continuation runs at most once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::correlation::CorrelationTable;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{Outcome, Payload, RequestFrame};
use crate::replica::{ReplicaPolicy, ReplicaSet};
use crate::transport::{self, Inbound, InboundReceiver, Transport, TransportKind, TransportOptions};

/// Callback run exactly once per successfully sent request.
pub type Continuation = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Identifies a request: the connection it went out on and its id there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    pub connection: usize,
    pub seq: u64,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportKind,
    /// Service name -> replica addresses
    pub services: BTreeMap<String, Vec<String>>,
    pub replica_policy: ReplicaPolicy,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            services: BTreeMap::new(),
            replica_policy: ReplicaPolicy::RoundRobin,
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct ClientCounters {
    sent: AtomicU64,
    responses: AtomicU64,
    timeouts: AtomicU64,
    unavailable: AtomicU64,
    stale: AtomicU64,
}

impl ClientCounters {
    fn record_outcome(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Success(_) => &self.responses,
            Outcome::Unavailable { .. } => &self.unavailable,
            Outcome::Timeout => &self.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCountersSnapshot {
    pub sent: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub unavailable: u64,
    pub stale_responses: u64,
}

/// The mutex only makes the entry `Sync` for the table; it is never contended.
struct PendingRequest {
    continuation: Mutex<Continuation>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn new(continuation: Continuation) -> Self {
        PendingRequest {
            continuation: Mutex::new(continuation),
            timer: None,
        }
    }

    fn resolve(mut self, outcome: Outcome) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        (self.continuation.into_inner())(outcome);
    }
}

type PendingTable = CorrelationTable<PendingRequest>;

/// One transport plus its correlation table and receive task
struct Connection {
    index: usize,
    service: String,
    transport: Box<dyn Transport>,
    table: Arc<PendingTable>,
    counters: Arc<ClientCounters>,
    request_timeout: Duration,
}

impl Connection {
    async fn open(
        index: usize,
        kind: TransportKind,
        service: &str,
        address: &str,
        options: TransportOptions,
        counters: Arc<ClientCounters>,
    ) -> ClientResult<Arc<Self>> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport = transport::connect(kind, service, address, inbound_tx, options).await?;
        let table = Arc::new(PendingTable::new());

        tokio::spawn(receive_loop(
            inbound_rx,
            table.clone(),
            counters.clone(),
            transport.peer().to_string(),
        ));

        Ok(Arc::new(Connection {
            index,
            service: service.to_string(),
            transport,
            table,
            counters,
            request_timeout: options.request_timeout,
        }))
    }

    fn send(&self, payload: Payload, continuation: Continuation) -> ClientResult<RequestId> {
        let id = self.table.allocate_id();
        self.table.insert(id, PendingRequest::new(continuation))?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        let timer = tokio::spawn(expire(
            self.table.clone(),
            id,
            self.request_timeout,
            self.counters.clone(),
        ));
        let mut handle = Some(timer.abort_handle());
        self.table.with_entry(id, |pending| pending.timer = handle.take());
        if let Some(handle) = handle {
            // Already resolved before the timer could be attached.
            handle.abort();
        }

        if let Err(e) = self
            .transport
            .send(RequestFrame::single(&self.service, id, payload))
        {
            if let Some(pending) = self.table.take(id) {
                self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
                let reason = e.to_string();
                tokio::spawn(async move { pending.resolve(Outcome::Unavailable { reason }) });
            }
        }

        Ok(RequestId {
            connection: self.index,
            seq: id,
        })
    }
}

async fn expire(
    table: Arc<PendingTable>,
    id: u64,
    timeout: Duration,
    counters: Arc<ClientCounters>,
) {
    tokio::time::sleep(timeout).await;
    if let Some(mut pending) = table.take(id) {
        // This task is the timer; nothing left to abort.
        pending.timer = None;
        counters.timeouts.fetch_add(1, Ordering::Relaxed);
        debug!("Request {} timed out after {:?}", id, timeout);
        pending.resolve(Outcome::Timeout);
    }
}

async fn receive_loop(
    mut inbound: InboundReceiver,
    table: Arc<PendingTable>,
    counters: Arc<ClientCounters>,
    peer: String,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Response(frame) => {
                for (id, outcome) in frame.into_outcomes() {
                    match table.take(id) {
                        Some(pending) => {
                            counters.record_outcome(&outcome);
                            pending.resolve(outcome);
                        }
                        None => {
                            counters.stale.fetch_add(1, Ordering::Relaxed);
                            debug!("Dropping stale response for request {} from {}", id, peer);
                        }
                    }
                }
            }
            Inbound::Closed { reason } => {
                let pending = table.drain();
                warn!(
                    "Connection to {} closed ({}), failing {} outstanding request(s)",
                    peer,
                    reason,
                    pending.len()
                );
                for request in pending {
                    counters.unavailable.fetch_add(1, Ordering::Relaxed);
                    request.resolve(Outcome::unavailable(format!("connection closed: {}", reason)));
                }
            }
        }
    }
    debug!("Receive loop for {} finished", peer);
}

/// Client for a fixed set of named services
pub struct AsyncClient {
    config: ClientConfig,
    services: OnceCell<HashMap<String, ReplicaSet<Arc<Connection>>>>,
    counters: Arc<ClientCounters>,
}

impl AsyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            services: OnceCell::new(),
            counters: Arc::new(ClientCounters::default()),
        }
    }

    /// Connect to every replica of every service. Idempotent; the first
    /// unreachable address aborts startup.
    pub async fn start(&self) -> ClientResult<()> {
        self.services
            .get_or_try_init(|| self.connect_all())
            .await
            .map(|_| ())
    }

    pub fn is_started(&self) -> bool {
        self.services.initialized()
    }

    async fn connect_all(&self) -> ClientResult<HashMap<String, ReplicaSet<Arc<Connection>>>> {
        let options = TransportOptions {
            connect_timeout: self.config.connect_timeout,
            request_timeout: self.config.request_timeout,
        };
        let mut services = HashMap::new();
        let mut index = 0;
        for (service, addresses) in &self.config.services {
            if addresses.is_empty() {
                return Err(transport::unreachable(service, "-", "no addresses configured"));
            }
            let mut connections = Vec::with_capacity(addresses.len());
            for address in addresses {
                let connection = Connection::open(
                    index,
                    self.config.transport,
                    service,
                    address,
                    options,
                    self.counters.clone(),
                )
                .await?;
                connections.push(connection);
                index += 1;
            }
            info!(
                "Connected to {} replica(s) of service {} over {:?}",
                connections.len(),
                service,
                self.config.transport
            );
            services.insert(
                service.clone(),
                ReplicaSet::new(self.config.replica_policy, connections),
            );
        }
        Ok(services)
    }

    /// Send `payload` to `service`. The continuation later receives the
    /// response, [`Outcome::Timeout`] or [`Outcome::Unavailable`], exactly
    /// once and never on the calling stack. If this returns an error the
    /// continuation is dropped without being called.
    pub fn send<F>(&self, service: &str, payload: Payload, continuation: F) -> ClientResult<RequestId>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let services = self.services.get().ok_or(ClientError::NotStarted)?;
        let connection = services
            .get(service)
            .and_then(|replicas| replicas.select_where(|c| !c.transport.is_closed()))
            .ok_or_else(|| ClientError::UnknownService {
                service: service.to_string(),
            })?;
        connection.send(payload, Box::new(continuation))
    }

    /// Send and wait for the outcome.
    pub async fn call(&self, service: &str, payload: Payload) -> Outcome {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.send(service, payload, move |outcome| {
            let _ = tx.send(outcome);
        }) {
            return Outcome::unavailable(e.to_string());
        }
        rx.await
            .unwrap_or_else(|_| Outcome::unavailable("continuation dropped"))
    }

    /// Requests currently awaiting a response or timeout
    pub fn outstanding(&self) -> usize {
        self.services
            .get()
            .map(|services| {
                services
                    .values()
                    .flat_map(|replicas| replicas.iter())
                    .map(|connection| connection.table.len())
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn counters(&self) -> ClientCountersSnapshot {
        ClientCountersSnapshot {
            sent: self.counters.sent.load(Ordering::Relaxed),
            responses: self.counters.responses.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
            stale_responses: self.counters.stale.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
