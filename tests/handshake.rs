use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;

use aerial::control::ControlClient;
use aerial::handshake::{ClientHandshake, ControlTransport, HandshakeError, HandshakeState};
use aerial::messages::{Method, RtspRequest, RtspResponse};
use aerial::stream::StreamStart;
use aerial::Codec;

/// Answers requests from a fixed script and keeps what was sent.
struct ScriptedTransport {
    script: VecDeque<RtspResponse>,
    sent: Vec<RtspRequest>,
}

impl ScriptedTransport {
    fn new(script: Vec<RtspResponse>) -> Self {
        Self {
            script: script.into(),
            sent: Vec::new(),
        }
    }

    fn methods(&self) -> Vec<Method> {
        self.sent.iter().map(|r| r.method).collect()
    }
}

#[async_trait]
impl ControlTransport for ScriptedTransport {
    async fn request(&mut self, req: RtspRequest) -> Result<RtspResponse, HandshakeError> {
        let cseq = req.cseq().unwrap_or_default();
        self.sent.push(req);
        match self.script.pop_front() {
            Some(resp) => Ok(resp.header("CSeq", cseq.to_string())),
            None => Err(HandshakeError::Transport(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "script exhausted",
            ))),
        }
    }
}

fn ok() -> RtspResponse {
    RtspResponse::new(200, "OK")
}

fn setup_ok() -> RtspResponse {
    ok().header("Session", "ABC123").header(
        "Transport",
        "RTP/AVP/UDP;unicast;mode=record;server_port=6000;control_port=6001;timing_port=6002",
    )
}

fn control() -> ControlClient {
    ControlClient::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        "test",
    )
}

const START: StreamStart = StreamStart {
    sequence: 7,
    timestamp: 1234,
    ssrc: 99,
};

#[tokio::test]
async fn walks_every_step_in_order() {
    let mut transport = ScriptedTransport::new(vec![
        ok().header("Public", "ANNOUNCE, SETUP, RECORD, TEARDOWN"),
        ok(),
        setup_ok(),
        ok().header("Audio-Latency", "2205"),
    ]);
    let mut control = control();
    let mut handshake = ClientHandshake::new(Codec::AppleLossless, 6010, START);
    let mut opened = None;

    let negotiated = handshake
        .run(&mut control, &mut transport, |n| {
            opened = Some(n.server_port);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(handshake.state(), &HandshakeState::Ready);
    assert_eq!(opened, Some(6000));
    assert_eq!(negotiated.session_id, "ABC123");
    assert_eq!(negotiated.control_port, Some(6001));
    assert_eq!(negotiated.audio_latency, Some(2205));
    assert_eq!(control.session(), Some("ABC123"));
    assert_eq!(
        transport.methods(),
        [Method::Options, Method::Announce, Method::Setup, Method::Record]
    );

    let setup = &transport.sent[2];
    assert!(setup
        .headers
        .get("Transport")
        .unwrap()
        .contains("control_port=6010;timing_port=6010"));
    let record = &transport.sent[3];
    assert_eq!(record.headers.get("RTP-Info"), Some("seq=7;rtptime=1234"));
    assert_eq!(record.headers.get("Session"), Some("ABC123"));
}

#[tokio::test]
async fn rejected_record_fails_before_opening_data() {
    let mut transport = ScriptedTransport::new(vec![
        ok(),
        ok(),
        setup_ok(),
        RtspResponse::new(453, "Not Enough Bandwidth"),
    ]);
    let mut control = control();
    let mut handshake = ClientHandshake::new(Codec::L16, 6010, START);
    let mut opened = false;

    let err = handshake
        .run(&mut control, &mut transport, |_| {
            opened = true;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, HandshakeError::Negotiation(ref m) if m.contains("453")));
    assert!(matches!(handshake.state(), HandshakeState::Failed(_)));
    assert!(!opened);
}

#[tokio::test]
async fn data_path_failure_fails_handshake() {
    let mut transport = ScriptedTransport::new(vec![ok(), ok(), setup_ok(), ok()]);
    let mut control = control();
    let mut handshake = ClientHandshake::new(Codec::L16, 6010, START);

    let err = handshake
        .run(&mut control, &mut transport, |_| {
            Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no route"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, HandshakeError::Transport(_)));
    assert!(matches!(handshake.state(), HandshakeState::Failed(_)));
}

#[tokio::test]
async fn mismatched_cseq_is_a_protocol_error() {
    struct Echo;

    #[async_trait]
    impl ControlTransport for Echo {
        async fn request(&mut self, _req: RtspRequest) -> Result<RtspResponse, HandshakeError> {
            Ok(RtspResponse::new(200, "OK").header("CSeq", "999"))
        }
    }

    let mut handshake = ClientHandshake::new(Codec::L16, 6010, START);
    let err = handshake
        .run(&mut control(), &mut Echo, |_| Ok(()))
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::Protocol(_)));
    assert_eq!(handshake.state(), &HandshakeState::Failed(err.to_string()));
}

#[tokio::test]
async fn announce_carries_sdp_for_codec() {
    let mut transport = ScriptedTransport::new(vec![ok(), ok()]);
    let mut handshake = ClientHandshake::new(Codec::L16, 6010, START);
    let _ = handshake
        .run(&mut control(), &mut transport, |_| Ok(()))
        .await;

    let announce = &transport.sent[1];
    assert_eq!(announce.headers.get("Content-Type"), Some("application/sdp"));
    let sdp = String::from_utf8(announce.body.clone()).unwrap();
    assert!(sdp.contains("a=rtpmap:96 L16/44100/2\r\n"));
    assert!(!sdp.contains("a=fmtp"));
    assert_eq!(
        handshake.state(),
        &HandshakeState::Failed("transport error: script exhausted".into())
    );
}
