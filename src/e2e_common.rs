//! In-process RAOP receiver for integration tests.
//!
//! Answers the RTSP control exchange over TCP on loopback, records every
//! request, and exposes the UDP sockets the client streams audio and sync
//! packets to. Behavior knobs let tests script rejections, stalls and
//! dropped connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::messages::RtspResponse;

pub const MOCK_SESSION_ID: &str = "DEADBEEF";
const DEFAULT_PUBLIC: &str =
    "ANNOUNCE, SETUP, RECORD, PAUSE, FLUSH, TEARDOWN, OPTIONS, GET_PARAMETER, SET_PARAMETER";

/// How the mock receiver answers.
#[derive(Debug, Clone, Default)]
pub struct ReceiverBehavior {
    /// Status returned for ANNOUNCE instead of 200.
    pub reject_announce: Option<u16>,
    /// Leave `server_port` out of the SETUP response.
    pub omit_server_port: bool,
    /// Leave `control_port` out of the SETUP response (no sync packets).
    pub omit_control_port: bool,
    /// Method whose requests are recorded but never answered.
    pub stall_on: Option<String>,
    /// Stop answering OPTIONS once RECORD has been answered, as a receiver
    /// that hung mid-stream would.
    pub stall_keepalive: bool,
    /// `Public` header for OPTIONS; the full method list when unset.
    pub public: Option<String>,
    /// `Audio-Latency` header for RECORD.
    pub audio_latency: Option<u32>,
}

/// One request as the receiver saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub struct MockReceiver {
    addr: SocketAddr,
    audio: UdpSocket,
    sync: UdpSocket,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    generation: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl MockReceiver {
    pub async fn start(behavior: ReceiverBehavior) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let audio = UdpSocket::bind(("127.0.0.1", 0)).await?;
        let sync = UdpSocket::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let ports = (audio.local_addr()?.port(), sync.local_addr()?.port());

        let requests = Arc::new(Mutex::new(Vec::new()));
        let (generation, _) = watch::channel(0u64);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(behavior),
            ports,
            requests.clone(),
            generation.subscribe(),
        ));
        Ok(Self {
            addr,
            audio,
            sync,
            requests,
            generation,
            task,
        })
    }

    /// RTSP address to hand to `Client::connect`.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.method.clone()).collect()
    }

    /// Waits until a request with `method` has been received.
    pub async fn wait_for_request(
        &self,
        method: &str,
        within: Duration,
    ) -> io::Result<RecordedRequest> {
        let deadline = Instant::now() + within;
        loop {
            let found = self
                .requests
                .lock()
                .iter()
                .find(|r| r.method == method)
                .cloned();
            if let Some(req) = found {
                return Ok(req);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no {} request", method),
                ));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Closes every open control connection, as a receiver going away would.
    pub fn drop_connections(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    pub async fn recv_audio(&self, within: Duration) -> io::Result<Vec<u8>> {
        recv_within(&self.audio, within).await
    }

    pub async fn recv_sync(&self, within: Duration) -> io::Result<Vec<u8>> {
        recv_within(&self.sync, within).await
    }
}

impl Drop for MockReceiver {
    fn drop(&mut self) {
        self.task.abort();
        self.drop_connections();
    }
}

/// Loopback address nothing listens on.
pub async fn unused_addr() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    listener.local_addr()
}

async fn recv_within(socket: &UdpSocket, within: Duration) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    match timeout(within, socket.recv_from(&mut buf)).await {
        Ok(res) => {
            let (len, _) = res?;
            buf.truncate(len);
            Ok(buf)
        }
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no packet")),
    }
}

async fn accept_loop(
    listener: TcpListener,
    behavior: Arc<ReceiverBehavior>,
    ports: (u16, u16),
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    generation: watch::Receiver<u64>,
) {
    while let Ok((stream, peer)) = listener.accept().await {
        debug!(%peer, "mock receiver accepted");
        tokio::spawn(serve(
            stream,
            behavior.clone(),
            ports,
            requests.clone(),
            generation.clone(),
        ));
    }
}

async fn serve(
    stream: TcpStream,
    behavior: Arc<ReceiverBehavior>,
    ports: (u16, u16),
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    mut generation: watch::Receiver<u64>,
) {
    generation.borrow_and_update();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut recording = false;
    loop {
        let req = tokio::select! {
            req = read_request(&mut reader) => match req {
                Ok(Some(req)) => req,
                _ => return,
            },
            _ = generation.changed() => return,
        };
        requests.lock().push(req.clone());
        if behavior.stall_on.as_deref() == Some(req.method.as_str()) {
            continue;
        }
        if recording && behavior.stall_keepalive && req.method == "OPTIONS" {
            continue;
        }
        recording |= req.method == "RECORD";
        let resp = respond(&behavior, ports, &req);
        if write.write_all(&resp.to_bytes()).await.is_err() {
            return;
        }
        if req.method == "TEARDOWN" {
            return;
        }
    }
}

fn respond(
    behavior: &ReceiverBehavior,
    (audio, sync): (u16, u16),
    req: &RecordedRequest,
) -> RtspResponse {
    let mut resp = match req.method.as_str() {
        "OPTIONS" => RtspResponse::new(200, "OK").header(
            "Public",
            behavior.public.as_deref().unwrap_or(DEFAULT_PUBLIC),
        ),
        "ANNOUNCE" => match behavior.reject_announce {
            Some(status) => RtspResponse::new(status, "Not Acceptable"),
            None => RtspResponse::new(200, "OK"),
        },
        "SETUP" => {
            let mut transport = String::from("RTP/AVP/UDP;unicast;mode=record");
            if !behavior.omit_server_port {
                transport.push_str(&format!(";server_port={}", audio));
            }
            if !behavior.omit_control_port {
                transport.push_str(&format!(";control_port={};timing_port={}", sync, sync));
            }
            RtspResponse::new(200, "OK")
                .header("Session", MOCK_SESSION_ID)
                .header("Transport", transport)
        }
        "RECORD" => {
            let resp = RtspResponse::new(200, "OK");
            match behavior.audio_latency {
                Some(latency) => resp.header("Audio-Latency", latency.to_string()),
                None => resp,
            }
        }
        _ => RtspResponse::new(200, "OK"),
    };
    if let Some(cseq) = req.header("CSeq") {
        resp = resp.header("CSeq", cseq);
    }
    resp.header("Audio-Jack-Status", "connected; type=analog")
}

async fn read_request<R>(reader: &mut R) -> io::Result<Option<RecordedRequest>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let uri = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let len = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Some(RecordedRequest {
        method,
        uri,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }))
}
