use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::endpoint::Endpoint;
use crate::config::ClientConfig;
use crate::control::ControlClient;
use crate::format;
use crate::handshake::keepalive::run_keepalive;
use crate::handshake::transport::{ControlConnection, ControlHandle, TimeoutTransport};
use crate::handshake::{ClientHandshake, HandshakeError};
use crate::session::{ClientState, Session};
use crate::stream::{AudioStream, StreamError, StreamStart, UdpPacketTransport, Written};

/// Errors returned by [`Client`] and handed to its error callback.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The receiver address could not be parsed.
    #[error("invalid receiver address: {0}")]
    Address(String),
    /// Name resolution failed, or the receiver refused or reset the connection.
    #[error("connection failed: {0}")]
    Connection(String),
    /// A connect, handshake step or keepalive went unanswered.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The receiver rejected the session or answered with something unusable.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// An established connection failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("{operation} is not allowed while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ClientState,
    },
    /// `connect` was interrupted through a [`DisconnectHandle`].
    #[error("connect cancelled")]
    Cancelled,
}

impl From<HandshakeError> for ClientError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Connection(msg) => ClientError::Connection(msg),
            HandshakeError::Timeout(msg) => ClientError::Timeout(msg),
            HandshakeError::Negotiation(msg) => ClientError::Negotiation(msg),
            HandshakeError::Transport(e) => ClientError::Transport(e),
            HandshakeError::Protocol(msg) => {
                ClientError::Negotiation(format!("malformed response: {}", msg))
            }
            HandshakeError::Cancelled => ClientError::Cancelled,
            HandshakeError::State(e) => ClientError::Negotiation(e.to_string()),
        }
    }
}

impl From<StreamError> for ClientError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Transport(e) => ClientError::Transport(e),
            StreamError::Closed => ClientError::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "audio stream closed",
            )),
        }
    }
}

/// Everything that exists only while a session is up.
#[derive(Debug)]
struct Active {
    remote: SocketAddr,
    control: ControlClient,
    transport: TimeoutTransport<ControlHandle>,
    connection: ControlConnection,
    keepalive: JoinHandle<()>,
    stream: AudioStream<UdpPacketTransport>,
}

impl Active {
    fn release(self) {
        self.keepalive.abort();
        self.connection.close();
    }
}

/// Streams PCM audio to one receiver.
///
/// # Guarantees
/// * Audio is only accepted while [`ClientState::Playing`].
/// * Only whole frames go on the wire; partial frames wait for the next write.
/// * Background faults (receiver closed the connection, keepalive timed out)
///   move the client to `Error` and reach the `on_error` callback once.
/// * `disconnect` never fails and may be called in any state.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    session: Session,
    active: Option<Active>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Bytes in one frame: two channels of 16-bit samples.
    pub const BYTES_PER_FRAME: usize = format::BYTES_PER_FRAME;

    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            session: Session::new(),
            active: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.session.state()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.session.subscribe()
    }

    /// Installs the callback for faults found outside any call. Replaces the
    /// previous one.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.session.set_error_hook(Arc::new(callback));
    }

    /// Handle that can stop the client from another task, including while
    /// `connect` is still running.
    pub fn disconnect_handle(&self) -> DisconnectHandle {
        DisconnectHandle {
            session: self.session.clone(),
        }
    }

    /// Connects to `addr` (`host[:port]`) and negotiates a session.
    ///
    /// Allowed from `Idle`, `Stopped` and `Error`; each call starts a fresh
    /// stream. On failure the client is left in `Error`, or in `Stopped`
    /// when cancelled through a [`DisconnectHandle`].
    pub async fn connect(&mut self, addr: &str) -> Result<(), ClientError> {
        self.session
            .transition(ClientState::Connecting)
            .map_err(|e| ClientError::InvalidState {
                operation: "connect",
                state: e.from,
            })?;
        if let Some(stale) = self.active.take() {
            stale.release();
        }

        let mut state = self.session.subscribe();
        let result = tokio::select! {
            res = Self::establish(&self.config, &self.session, addr) => res,
            _ = state.wait_for(|s| *s == ClientState::Stopped) => Err(ClientError::Cancelled),
        };

        match result {
            Ok(active) => {
                if self.session.transition(ClientState::Playing).is_err() {
                    // stopped between the last response and now
                    active.release();
                    return Err(ClientError::Cancelled);
                }
                info!(remote = %active.remote, "playing");
                self.active = Some(active);
                Ok(())
            }
            Err(ClientError::Cancelled) => {
                info!(addr, "connect cancelled");
                self.session.stop();
                Err(ClientError::Cancelled)
            }
            Err(err) => {
                warn!(addr, error = %err, "connect failed");
                self.session.fail();
                Err(err)
            }
        }
    }

    /// Connects and returns once the client is `Playing`.
    pub async fn play(&mut self, addr: &str) -> Result<(), ClientError> {
        self.connect(addr).await?;
        match self.session.state() {
            ClientState::Playing => Ok(()),
            state => Err(ClientError::InvalidState {
                operation: "play",
                state,
            }),
        }
    }

    async fn establish(
        config: &ClientConfig,
        session: &Session,
        addr: &str,
    ) -> Result<Active, ClientError> {
        let remote = Endpoint::parse(addr, config.default_port)?
            .resolve(config.connect_timeout)
            .await?;

        let background = session.clone();
        let connection = ControlConnection::connect(
            remote,
            config.connect_timeout,
            Box::new(move |err: HandshakeError| {
                background.report_background(err.into())
            }),
        )
        .await?;
        let local_ip = connection.local_addr().ip();

        let mut data = UdpPacketTransport::bind(SocketAddr::new(local_ip, 0))?;
        let mut control = ControlClient::new(local_ip, remote.ip(), config.user_agent.clone());
        let mut transport = TimeoutTransport::new(connection.handle(), config.request_timeout);
        let start = StreamStart::random();

        let mut handshake = ClientHandshake::new(config.codec, data.local_port()?, start);
        let negotiated = handshake
            .run(&mut control, &mut transport, |n| {
                data.open(
                    SocketAddr::new(remote.ip(), n.server_port),
                    n.control_port.map(|p| SocketAddr::new(remote.ip(), p)),
                );
                Ok(())
            })
            .await?;

        if let Some(db) = config.volume {
            let resp = control.send(&mut transport, control.set_volume(db)).await?;
            if !resp.is_success() {
                warn!(status = resp.status, "initial volume rejected");
            }
        }

        let latency = negotiated.audio_latency.unwrap_or(config.latency_frames);
        let stream = AudioStream::new(data, config.codec, start, latency);

        let background = session.clone();
        let keepalive = tokio::spawn(run_keepalive(
            transport.clone(),
            control.clone(),
            config.keepalive_interval,
            move |err: HandshakeError| background.report_background(err.into()),
        ));

        debug!(
            session = %negotiated.session_id,
            seq = start.sequence,
            rtptime = start.timestamp,
            latency,
            "stream ready"
        );
        Ok(Active {
            remote,
            control,
            transport,
            connection,
            keepalive,
            stream,
        })
    }

    /// Sends every whole frame of the queued audio plus `bytes`.
    ///
    /// Returns the bytes consumed and the timestamp of the last packet sent;
    /// `timestamp` is `None` when no whole frame was available. A send
    /// failure moves the client to `Error`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<Written, ClientError> {
        let stream = match (self.session.state(), self.active.as_mut()) {
            (ClientState::Playing, Some(active)) => &mut active.stream,
            (state, _) => {
                return Err(ClientError::InvalidState {
                    operation: "write",
                    state,
                })
            }
        };
        stream.write(bytes).map_err(|err| {
            warn!(error = %err, "audio send failed");
            self.session.fail();
            ClientError::from(err)
        })
    }

    /// Sets the receiver volume in dB, clamped to `[-30, 0]`; `-144` mutes.
    ///
    /// A rejected request leaves the session playing; a lost or silent
    /// connection moves it to `Error`.
    pub async fn set_volume(&mut self, db: f32) -> Result<(), ClientError> {
        let active = match (self.session.state(), self.active.as_mut()) {
            (ClientState::Playing, Some(active)) => active,
            (state, _) => {
                return Err(ClientError::InvalidState {
                    operation: "set_volume",
                    state,
                })
            }
        };
        let resp = match active
            .control
            .send(&mut active.transport, active.control.set_volume(db))
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                self.session.fail();
                return Err(err.into());
            }
        };
        if resp.is_success() {
            Ok(())
        } else {
            Err(ClientError::Negotiation(format!(
                "volume answered {} {}",
                resp.status, resp.reason
            )))
        }
    }

    /// How far the audio sent so far runs ahead of real time.
    pub fn lead(&self) -> Duration {
        self.active
            .as_ref()
            .map(|a| a.stream.lead())
            .unwrap_or_default()
    }

    /// Sleeps until no more than `max_lead` of sent audio is left to play.
    pub async fn pace(&self, max_lead: Duration) -> Result<(), ClientError> {
        let state = self.session.state();
        if state != ClientState::Playing {
            return Err(ClientError::InvalidState {
                operation: "pace",
                state,
            });
        }
        let lead = self.lead();
        if lead > max_lead {
            tokio::time::sleep(lead - max_lead).await;
        }
        Ok(())
    }

    /// Tears the session down. Never fails and is a no-op when idle or
    /// already stopped.
    ///
    /// A playing session gets a best-effort `TEARDOWN`; failures are logged.
    pub async fn disconnect(&mut self) {
        let was = self.session.state();
        self.session.stop();
        let Some(active) = self.active.take() else {
            return;
        };

        if was == ClientState::Playing {
            active.keepalive.abort();
            let mut transport = active.transport.clone();
            match active
                .control
                .send(&mut transport, active.control.teardown())
                .await
            {
                Ok(resp) if resp.is_success() => debug!("teardown acknowledged"),
                Ok(resp) => warn!(status = resp.status, "teardown answered with error status"),
                Err(err) => warn!(error = %err, "teardown failed"),
            }
        }
        info!(remote = %active.remote, "disconnected");
        active.release();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.release();
        }
    }
}

/// Stops a [`Client`] from another task.
///
/// Cancels an in-flight `connect` (which then returns
/// [`ClientError::Cancelled`]) and moves the client to `Stopped`. Sockets are
/// released by the client's next `disconnect`, `connect` or drop.
#[derive(Debug, Clone)]
pub struct DisconnectHandle {
    session: Session,
}

impl DisconnectHandle {
    pub fn disconnect(&self) {
        if self.session.stop() {
            info!("disconnect requested");
        }
    }
}
