use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::format::Codec;
use crate::handshake::{ControlTransport, HandshakeError};
use crate::messages::{Method, RtspRequest, RtspResponse};

/// Lowest volume the receiver understands, in dB; anything below is muted.
pub const MIN_VOLUME_DB: f32 = -30.0;
/// Volume value that mutes the receiver.
pub const MUTE_VOLUME_DB: f32 = -144.0;

/// Builds RTSP requests for one session and keeps the shared `CSeq` counter.
///
/// Clones share the counter, so the keepalive task and the caller's requests
/// stay in a single increasing sequence on the connection.
#[derive(Debug, Clone)]
pub struct ControlClient {
    cseq: Arc<AtomicU32>,
    announce_id: u32,
    client_instance: String,
    user_agent: String,
    local_ip: IpAddr,
    remote_ip: IpAddr,
    session: Option<String>,
}

impl ControlClient {
    pub fn new(local_ip: IpAddr, remote_ip: IpAddr, user_agent: impl Into<String>) -> Self {
        let instance = Uuid::new_v4().simple().to_string().to_uppercase();
        Self {
            cseq: Arc::new(AtomicU32::new(0)),
            announce_id: rand::thread_rng().gen(),
            client_instance: instance[..16].to_string(),
            user_agent: user_agent.into(),
            local_ip,
            remote_ip,
            session: None,
        }
    }

    /// The receiver-issued session id, once SETUP has completed.
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn set_session(&mut self, session: impl Into<String>) {
        self.session = Some(session.into());
    }

    /// URI naming this stream in every request except `OPTIONS *`.
    pub fn uri(&self) -> String {
        format!("rtsp://{}/{}", self.local_ip, self.announce_id)
    }

    /// Stamps the common headers onto a new request.
    pub fn request(&self, method: Method, uri: impl Into<String>) -> RtspRequest {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut req = RtspRequest::new(method, uri)
            .header("CSeq", cseq.to_string())
            .header("User-Agent", self.user_agent.clone())
            .header("Client-Instance", self.client_instance.clone());
        if let Some(session) = &self.session {
            req = req.header("Session", session.clone());
        }
        req
    }

    pub fn options(&self) -> RtspRequest {
        self.request(Method::Options, "*")
    }

    pub fn announce(&self, codec: Codec) -> RtspRequest {
        self.request(Method::Announce, self.uri())
            .body("application/sdp", self.sdp(codec))
    }

    /// SETUP asks for UDP transport; `local_port` receives control and timing
    /// traffic from the receiver.
    pub fn setup(&self, local_port: u16) -> RtspRequest {
        self.request(Method::Setup, self.uri()).header(
            "Transport",
            format!(
                "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port={};timing_port={}",
                local_port, local_port
            ),
        )
    }

    pub fn record(&self, sequence: u16, rtptime: u32) -> RtspRequest {
        self.request(Method::Record, self.uri())
            .header("Range", "npt=0-")
            .header("RTP-Info", format!("seq={};rtptime={}", sequence, rtptime))
    }

    pub fn set_volume(&self, db: f32) -> RtspRequest {
        self.request(Method::SetParameter, self.uri()).body(
            "text/parameters",
            format!("volume: {:.6}\r\n", clamp_volume(db)),
        )
    }

    pub fn teardown(&self) -> RtspRequest {
        self.request(Method::Teardown, self.uri())
    }

    /// Session description announced to the receiver.
    pub fn sdp(&self, codec: Codec) -> String {
        let mut sdp = format!(
            "v=0\r\no=iTunes {id} 0 IN {lfam} {local}\r\ns=iTunes\r\nc=IN {rfam} {remote}\r\nt=0 0\r\nm=audio 0 RTP/AVP 96\r\na=rtpmap:{rtpmap}\r\n",
            id = self.announce_id,
            lfam = addr_family(&self.local_ip),
            local = self.local_ip,
            rfam = addr_family(&self.remote_ip),
            remote = self.remote_ip,
            rtpmap = codec.rtpmap(),
        );
        if let Some(fmtp) = codec.fmtp() {
            sdp.push_str(&format!("a=fmtp:{}\r\n", fmtp));
        }
        sdp
    }

    /// Sends `req` and checks that the response answers it.
    pub async fn send<T: ControlTransport + Send>(
        &self,
        transport: &mut T,
        req: RtspRequest,
    ) -> Result<RtspResponse, HandshakeError> {
        let method = req.method;
        let cseq = req.cseq();
        let resp = transport.request(req).await?;
        debug!(%method, ?cseq, status = resp.status, "rtsp exchange");
        if let (Some(sent), Some(got)) = (cseq, resp.cseq()) {
            if sent != got {
                return Err(HandshakeError::Protocol(format!(
                    "{} answered with CSeq {} (expected {})",
                    method, got, sent
                )));
            }
        }
        Ok(resp)
    }
}

fn addr_family(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    }
}

/// Maps a requested level into the receiver's accepted range.
pub fn clamp_volume(db: f32) -> f32 {
    if db.is_nan() || db < MIN_VOLUME_DB {
        MUTE_VOLUME_DB
    } else {
        db.min(0.0)
    }
}
