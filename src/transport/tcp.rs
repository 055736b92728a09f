use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Inbound, InboundSender, Transport, TransportOptions, unreachable};
use crate::codec::{self, Frame};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{RequestFrame, ResponseFrame};

/// Soft cap on how many bytes of queued frames are coalesced into one write
const WRITE_COALESCE_BYTES: usize = 256 * 1024;

/// One multiplexed TCP connection. Frames are written by a dedicated writer
/// task; a reader task decodes responses and forwards them as [`Inbound`].
///
/// Either task marks the connection closed before reporting
/// [`Inbound::Closed`], so a request accepted by `send` is always either
/// answered or failed by the receive loop's drain.
pub struct TcpTransport {
    peer: String,
    outbound: mpsc::UnboundedSender<RequestFrame>,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    pub async fn connect(
        service: &str,
        address: &str,
        inbound: InboundSender,
        options: TransportOptions,
    ) -> ClientResult<Self> {
        let stream =
            match tokio::time::timeout(options.connect_timeout, TcpStream::connect(address)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(unreachable(service, address, e)),
                Err(_) => return Err(unreachable(service, address, "connect timed out")),
            };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }

        let peer = address.to_string();
        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(write_loop(
            writer,
            rx,
            inbound.clone(),
            closed.clone(),
            peer.clone(),
        ));
        tokio::spawn(read_loop(reader, inbound, closed.clone(), peer.clone()));
        debug!("Connected to {} for service {}", peer, service);

        Ok(Self {
            peer,
            outbound,
            closed,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: RequestFrame) -> ClientResult<()> {
        let closed = || ClientError::ConnectionClosed {
            peer: self.peer.clone(),
        };
        if self.is_closed() {
            return Err(closed());
        }
        self.outbound.send(frame).map_err(|_| closed())
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn report_closed(inbound: &InboundSender, closed: &AtomicBool, reason: String) {
    closed.store(true, Ordering::SeqCst);
    let _ = inbound.send(Inbound::Closed { reason });
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<RequestFrame>,
    inbound: InboundSender,
    closed: Arc<AtomicBool>,
    peer: String,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(frame) = rx.recv().await {
        buf.clear();
        encode_or_reject(&frame, &mut buf, &inbound);
        while buf.len() < WRITE_COALESCE_BYTES {
            match rx.try_recv() {
                Ok(next) => encode_or_reject(&next, &mut buf, &inbound),
                Err(_) => break,
            }
        }
        if buf.is_empty() {
            continue;
        }
        if let Err(e) = writer.write_all(&buf).await {
            warn!("Write to {} failed: {}", peer, e);
            report_closed(&inbound, &closed, format!("write failed: {}", e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

fn encode_or_reject(frame: &RequestFrame, buf: &mut BytesMut, inbound: &InboundSender) {
    if let Err(e) = codec::encode_request(frame, buf) {
        warn!("Dropping request for {}: {}", frame.service, e);
        let _ = inbound.send(Inbound::Response(ResponseFrame::unavailable(
            frame.ids.clone(),
        )));
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: InboundSender,
    closed: Arc<AtomicBool>,
    peer: String,
) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let reason = 'read: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => break 'read "connection closed by peer".to_string(),
            Ok(_) => loop {
                match codec::decode(&mut buf) {
                    Ok(Some(Frame::Response(resp))) => {
                        if inbound.send(Inbound::Response(resp)).is_err() {
                            // Receive loop is gone; nobody is waiting on this connection.
                            return;
                        }
                    }
                    Ok(Some(Frame::Request(req))) => {
                        warn!("Ignoring request frame for {} sent by {}", req.service, peer);
                    }
                    Ok(None) => break,
                    Err(e) => break 'read format!("undecodable frame: {}", e),
                }
            },
            Err(e) => break 'read format!("read failed: {}", e),
        }
    };
    debug!("Reader for {} stopped: {}", peer, reason);
    report_closed(&inbound, &closed, reason);
}
