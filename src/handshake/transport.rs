use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use super::{ControlTransport, HandshakeError};
use crate::messages::{MessageError, RtspCodec, RtspRequest, RtspResponse};

/// Called once if the connection dies underneath the session.
pub type DropHook = Box<dyn FnOnce(HandshakeError) + Send + 'static>;

type Reply = oneshot::Sender<Result<RtspResponse, HandshakeError>>;

struct PendingRequest {
    request: RtspRequest,
    reply: Reply,
}

/// Cloneable sender side of the control connection.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    requests: mpsc::Sender<PendingRequest>,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("method", &self.request.method)
            .finish()
    }
}

#[async_trait]
impl ControlTransport for ControlHandle {
    async fn request(&mut self, request: RtspRequest) -> Result<RtspResponse, HandshakeError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(PendingRequest { request, reply })
            .await
            .map_err(|_| closed_error())?;
        rx.await.map_err(|_| closed_error())?
    }
}

/// TCP control connection to the receiver.
///
/// A spawned task owns the socket: it writes requests in order, hands each
/// response to the oldest waiting request, and notices when the receiver
/// goes away.
#[derive(Debug)]
pub struct ControlConnection {
    handle: ControlHandle,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ControlConnection {
    /// Opens the TCP connection within `connect_timeout`.
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        on_drop: DropHook,
    ) -> Result<Self, HandshakeError> {
        let stream = match time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(HandshakeError::Connection(format!("{}: {}", addr, e))),
            Err(_) => return Err(HandshakeError::Timeout(format!("TCP connect to {}", addr))),
        };
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        debug!(%local_addr, %peer_addr, "control connection open");

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_connection(
            Framed::new(stream, RtspCodec::new()),
            rx,
            on_drop,
        ));
        Ok(Self {
            handle: ControlHandle { requests: tx },
            task,
            local_addr,
        })
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the connection task and closes the socket. The drop hook is not
    /// invoked.
    pub fn close(self) {
        self.task.abort();
    }
}

async fn run_connection(
    mut framed: Framed<TcpStream, RtspCodec>,
    mut requests: mpsc::Receiver<PendingRequest>,
    on_drop: DropHook,
) {
    let mut pending: VecDeque<Reply> = VecDeque::new();
    let fault = loop {
        tokio::select! {
            next = requests.recv() => match next {
                Some(PendingRequest { request, reply }) => {
                    trace!(method = %request.method, "sending control request");
                    if let Err(e) = framed.send(request).await {
                        let _ = reply.send(Err(closed_error()));
                        break message_error(e);
                    }
                    pending.push_back(reply);
                }
                None => {
                    // Every handle dropped; nothing left to report to.
                    let _ = framed.close().await;
                    return;
                }
            },
            frame = framed.next() => match frame {
                Some(Ok(resp)) => match pending.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(Ok(resp));
                    }
                    None => warn!(status = resp.status, "unsolicited control response"),
                },
                Some(Err(e)) => break message_error(e),
                None => break closed_error(),
            },
        }
    };

    warn!(error = %fault, "control connection lost");
    for reply in pending.drain(..) {
        let _ = reply.send(Err(closed_error()));
    }
    on_drop(fault);
}

fn closed_error() -> HandshakeError {
    HandshakeError::Transport(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "control connection closed",
    ))
}

fn message_error(err: MessageError) -> HandshakeError {
    match err {
        MessageError::Io(e) => HandshakeError::Transport(e),
        other => HandshakeError::Protocol(other.to_string()),
    }
}

/// Wrapper that bounds every request by a timeout.
#[derive(Debug, Clone)]
pub struct TimeoutTransport<T> {
    inner: T,
    request_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, request_timeout: Duration) -> Self {
        Self {
            inner,
            request_timeout,
        }
    }
}

#[async_trait]
impl<T> ControlTransport for TimeoutTransport<T>
where
    T: ControlTransport + Send,
{
    async fn request(&mut self, req: RtspRequest) -> Result<RtspResponse, HandshakeError> {
        let method = req.method;
        match time::timeout(self.request_timeout, self.inner.request(req)).await {
            Ok(res) => res,
            Err(_) => Err(HandshakeError::Timeout(format!("{} response", method))),
        }
    }
}
