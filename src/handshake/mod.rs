//! Session negotiation over the RTSP control connection.
//!
//! The driver walks `Init → Announced → PortsNegotiated → Recording → Ready`
//! one response at a time. It only talks to a [`ControlTransport`], so the
//! network side is swappable and tests can script the receiver.

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::control::ControlClient;
use crate::format::Codec;
use crate::messages::{advertises, transport_param, Method, RtspRequest, RtspResponse};
use crate::stream::StreamStart;

pub mod keepalive;
pub mod transport;

/// Errors raised while establishing or driving the control connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("receiver rejected session: {0}")]
    Negotiation(String),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("handshake cancelled")]
    Cancelled,
    #[error(transparent)]
    State(#[from] HandshakeStateError),
}

/// Request/response exchange with the receiver.
#[async_trait]
pub trait ControlTransport {
    /// Sends one request and waits for its response.
    async fn request(&mut self, req: RtspRequest) -> Result<RtspResponse, HandshakeError>;
}

/// Negotiation progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    Announced,
    PortsNegotiated,
    Recording,
    Ready,
    Failed(String),
}

#[derive(Debug, Error)]
#[error("handshake cannot move from {from:?} to {to:?}")]
pub struct HandshakeStateError {
    pub from: HandshakeState,
    pub to: HandshakeState,
}

impl HandshakeState {
    /// Moves to `next` if it is the immediate successor; `Failed` is always
    /// reachable except from `Ready`.
    pub fn advance(&self, next: HandshakeState) -> Result<HandshakeState, HandshakeStateError> {
        use HandshakeState::*;
        let allowed = matches!(
            (self, &next),
            (Init, Announced)
                | (Announced, PortsNegotiated)
                | (PortsNegotiated, Recording)
                | (Recording, Ready)
                | (Init | Announced | PortsNegotiated | Recording, Failed(_))
        );
        if allowed {
            Ok(next)
        } else {
            Err(HandshakeStateError {
                from: self.clone(),
                to: next,
            })
        }
    }
}

/// What the receiver handed back during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub session_id: String,
    /// UDP port for audio packets.
    pub server_port: u16,
    /// UDP port for sync packets, when the receiver has one.
    pub control_port: Option<u16>,
    /// Receiver-reported playout latency in frames.
    pub audio_latency: Option<u32>,
}

/// Client side of the negotiation.
#[derive(Debug)]
pub struct ClientHandshake {
    pub codec: Codec,
    /// Local UDP port advertised for control/timing traffic.
    pub local_port: u16,
    pub start: StreamStart,
    state: HandshakeState,
}

impl ClientHandshake {
    pub fn new(codec: Codec, local_port: u16, start: StreamStart) -> Self {
        Self {
            codec,
            local_port,
            start,
            state: HandshakeState::Init,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Runs every step in order. `open_data` is invoked once RECORD has been
    /// accepted and must open the audio path to the negotiated port.
    ///
    /// On any error the state becomes `Failed` and the error is returned.
    pub async fn run<T, F>(
        &mut self,
        control: &mut ControlClient,
        transport: &mut T,
        open_data: F,
    ) -> Result<Negotiated, HandshakeError>
    where
        T: ControlTransport + Send,
        F: FnOnce(&Negotiated) -> io::Result<()> + Send,
    {
        match self.steps(control, transport, open_data).await {
            Ok(negotiated) => Ok(negotiated),
            Err(err) => {
                if self.state != HandshakeState::Ready {
                    self.state = HandshakeState::Failed(err.to_string());
                }
                Err(err)
            }
        }
    }

    async fn steps<T, F>(
        &mut self,
        control: &mut ControlClient,
        transport: &mut T,
        open_data: F,
    ) -> Result<Negotiated, HandshakeError>
    where
        T: ControlTransport + Send,
        F: FnOnce(&Negotiated) -> io::Result<()> + Send,
    {
        let resp = control.send(transport, control.options()).await?;
        expect_success(Method::Options, &resp)?;
        if let Some(public) = resp.headers.get("Public") {
            for method in [Method::Announce, Method::Setup, Method::Record] {
                if !advertises(public, method) {
                    return Err(HandshakeError::Negotiation(format!(
                        "receiver does not support {}",
                        method
                    )));
                }
            }
        }

        let resp = control.send(transport, control.announce(self.codec)).await?;
        expect_success(Method::Announce, &resp)?;
        self.advance(HandshakeState::Announced)?;

        let resp = control
            .send(transport, control.setup(self.local_port))
            .await?;
        expect_success(Method::Setup, &resp)?;
        let mut negotiated = parse_setup(&resp)?;
        control.set_session(negotiated.session_id.clone());
        self.advance(HandshakeState::PortsNegotiated)?;

        let resp = control
            .send(
                transport,
                control.record(self.start.sequence, self.start.timestamp),
            )
            .await?;
        expect_success(Method::Record, &resp)?;
        negotiated.audio_latency = resp
            .headers
            .get("Audio-Latency")
            .and_then(|v| v.trim().parse().ok());
        self.advance(HandshakeState::Recording)?;

        open_data(&negotiated)?;
        self.advance(HandshakeState::Ready)?;
        info!(
            session = %negotiated.session_id,
            server_port = negotiated.server_port,
            "receiver ready"
        );
        Ok(negotiated)
    }

    fn advance(&mut self, next: HandshakeState) -> Result<(), HandshakeError> {
        debug!(from = ?self.state, to = ?next, "handshake step");
        self.state = self.state.advance(next)?;
        Ok(())
    }
}

fn expect_success(method: Method, resp: &RtspResponse) -> Result<(), HandshakeError> {
    if resp.is_success() {
        Ok(())
    } else {
        Err(HandshakeError::Negotiation(format!(
            "{} answered {} {}",
            method, resp.status, resp.reason
        )))
    }
}

fn parse_setup(resp: &RtspResponse) -> Result<Negotiated, HandshakeError> {
    let session_id = resp
        .headers
        .get("Session")
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandshakeError::Negotiation("SETUP response has no Session".into()))?;
    let transport = resp
        .headers
        .get("Transport")
        .ok_or_else(|| HandshakeError::Negotiation("SETUP response has no Transport".into()))?;
    let server_port = transport_param(transport, "server_port")
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            HandshakeError::Negotiation(format!("no usable server_port in {:?}", transport))
        })?;
    let control_port = transport_param(transport, "control_port").and_then(|p| p.parse().ok());
    Ok(Negotiated {
        session_id,
        server_port,
        control_port,
        audio_latency: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_cannot_be_skipped() {
        let init = HandshakeState::Init;
        assert!(init.advance(HandshakeState::PortsNegotiated).is_err());
        let announced = init.advance(HandshakeState::Announced).unwrap();
        assert!(announced.advance(HandshakeState::Ready).is_err());
        let ports = announced.advance(HandshakeState::PortsNegotiated).unwrap();
        let recording = ports.advance(HandshakeState::Recording).unwrap();
        let ready = recording.advance(HandshakeState::Ready).unwrap();
        assert!(ready.advance(HandshakeState::Failed("late".into())).is_err());
    }

    #[test]
    fn failed_reachable_before_ready() {
        for state in [
            HandshakeState::Init,
            HandshakeState::Announced,
            HandshakeState::PortsNegotiated,
            HandshakeState::Recording,
        ] {
            assert!(state.advance(HandshakeState::Failed("x".into())).is_ok());
        }
    }

    #[test]
    fn setup_response_parsing() {
        let resp = RtspResponse::new(200, "OK")
            .header("Session", "1A2B;timeout=60")
            .header(
                "Transport",
                "RTP/AVP/UDP;unicast;mode=record;server_port=6000;control_port=6001;timing_port=6002",
            );
        let negotiated = parse_setup(&resp).unwrap();
        assert_eq!(negotiated.session_id, "1A2B");
        assert_eq!(negotiated.server_port, 6000);
        assert_eq!(negotiated.control_port, Some(6001));
    }

    #[test]
    fn setup_without_server_port_is_rejected() {
        let resp = RtspResponse::new(200, "OK")
            .header("Session", "1")
            .header("Transport", "RTP/AVP/UDP;unicast;mode=record");
        assert!(matches!(
            parse_setup(&resp),
            Err(HandshakeError::Negotiation(_))
        ));
    }
}
