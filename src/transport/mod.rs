//! Transports behind the async client
//!
//! A transport turns [`RequestFrame`]s into bytes on the wire and reports what
//! comes back as [`Inbound`] events on the channel it was connected with.
//! `send` only enqueues; it never blocks or awaits.

pub mod http;
pub mod tcp;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ClientError, ClientResult};
use crate::protocol::{RequestFrame, ResponseFrame};

pub use http::HttpTransport;
pub use tcp::TcpTransport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Length-prefixed binary frames over one multiplexed TCP connection
    #[default]
    Tcp,
    /// JSON over HTTP, one request per call
    Http,
}

/// Events delivered from a transport to the connection's receive loop
#[derive(Debug)]
pub enum Inbound {
    Response(ResponseFrame),
    Closed { reason: String },
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

pub trait Transport: Send + Sync {
    /// Enqueue a frame for transmission.
    fn send(&self, frame: RequestFrame) -> ClientResult<()>;

    fn peer(&self) -> &str;

    /// Whether the transport can no longer deliver requests. Once true,
    /// `send` fails with [`ClientError::ConnectionClosed`].
    fn is_closed(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Open a transport to `address`. Fails fast with [`ClientError::Unreachable`].
pub async fn connect(
    kind: TransportKind,
    service: &str,
    address: &str,
    inbound: InboundSender,
    options: TransportOptions,
) -> ClientResult<Box<dyn Transport>> {
    match kind {
        TransportKind::Tcp => {
            let transport = TcpTransport::connect(service, address, inbound, options).await?;
            Ok(Box::new(transport))
        }
        TransportKind::Http => {
            let transport = HttpTransport::connect(service, address, inbound, options).await?;
            Ok(Box::new(transport))
        }
    }
}

pub(crate) fn unreachable(service: &str, address: &str, reason: impl ToString) -> ClientError {
    ClientError::Unreachable {
        service: service.to_string(),
        address: address.to_string(),
        reason: reason.to_string(),
    }
}
