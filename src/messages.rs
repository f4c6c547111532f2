//! RTSP control-plane messages and their line codec.
//!
//! Requests flow client → receiver, responses flow back. The codec is used
//! with `tokio_util::codec::Framed` over the control TCP stream.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Errors produced while framing RTSP messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("response {part} exceeds {limit} bytes")]
    TooLarge { part: &'static str, limit: usize },
}

/// RTSP methods used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Announce,
    Setup,
    Record,
    SetParameter,
    Teardown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Record => "RECORD",
            Method::SetParameter => "SET_PARAMETER",
            Method::Teardown => "TEARDOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Sets `name`, replacing an existing header of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self
            .0
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Outgoing RTSP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RtspRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::default(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attaches a body; `Content-Length` is written by the codec.
    pub fn body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers.insert("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn cseq(&self) -> Option<u32> {
        self.headers.get("CSeq").and_then(|v| v.trim().parse().ok())
    }
}

/// Incoming RTSP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::default(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn cseq(&self) -> Option<u32> {
        self.headers.get("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Encodes the response in wire form. Used by the test receiver.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", RTSP_VERSION, self.status, self.reason);
        for (name, value) in self.headers.iter() {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Looks up `key` in a `Transport` header value such as
/// `RTP/AVP/UDP;unicast;server_port=6000;control_port=6001`.
pub fn transport_param<'a>(transport: &'a str, key: &str) -> Option<&'a str> {
    transport.split(';').find_map(|part| {
        let (name, value) = part.split_once('=')?;
        (name.trim().eq_ignore_ascii_case(key)).then(|| value.trim())
    })
}

/// Returns true when a `Public` header advertises `method`.
pub fn advertises(public: &str, method: Method) -> bool {
    public
        .split(',')
        .any(|m| m.trim().eq_ignore_ascii_case(method.as_str()))
}

/// Framing for RTSP over a byte stream: encodes requests, decodes responses.
#[derive(Debug, Clone)]
pub struct RtspCodec {
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl RtspCodec {
    pub fn new() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Default for RtspCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<RtspRequest> for RtspCodec {
    type Error = MessageError;

    fn encode(&mut self, req: RtspRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = format!("{} {} {}\r\n", req.method, req.uri, RTSP_VERSION);
        for (name, value) in req.headers.iter() {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !req.body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
        }
        head.push_str("\r\n");
        dst.reserve(head.len() + req.body.len());
        dst.put_slice(head.as_bytes());
        dst.put_slice(&req.body);
        Ok(())
    }
}

impl Decoder for RtspCodec {
    type Item = RtspResponse;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(head_end) = find_head_end(src) else {
            if src.len() > self.max_header_bytes {
                return Err(MessageError::TooLarge {
                    part: "header",
                    limit: self.max_header_bytes,
                });
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&src[..head_end])
            .map_err(|e| MessageError::Malformed(format!("non-utf8 header: {}", e)))?;
        let mut lines = head.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| MessageError::Malformed("empty response".into()))?;
        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = Headers::default();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| MessageError::Malformed(format!("bad header line {:?}", line)))?;
            headers.insert(name.trim(), value.trim());
        }

        let body_len = match headers.get("Content-Length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| MessageError::Malformed(format!("bad Content-Length {:?}", v)))?,
            None => 0,
        };
        // Checked before any reservation; the length comes off the wire.
        if body_len > self.max_body_bytes {
            return Err(MessageError::TooLarge {
                part: "body",
                limit: self.max_body_bytes,
            });
        }
        let total = (head_end + 4)
            .checked_add(body_len)
            .ok_or(MessageError::TooLarge {
                part: "body",
                limit: self.max_body_bytes,
            })?;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(head_end + 4);
        let body = src.split_to(body_len).to_vec();
        Ok(Some(RtspResponse {
            status,
            reason,
            headers,
            body,
        }))
    }
}

fn find_head_end(src: &[u8]) -> Option<usize> {
    src.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<(u16, String), MessageError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("RTSP/") {
        return Err(MessageError::Malformed(format!("bad status line {:?}", line)));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| MessageError::Malformed(format!("bad status code in {:?}", line)))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok((status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_request_with_body_length() {
        let req = RtspRequest::new(Method::Announce, "rtsp://10.0.0.2/1")
            .header("CSeq", "2")
            .body("application/sdp", b"v=0\r\n".to_vec());
        let mut dst = BytesMut::new();
        RtspCodec::new().encode(req, &mut dst).unwrap();
        assert_eq!(
            &dst[..],
            b"ANNOUNCE rtsp://10.0.0.2/1 RTSP/1.0\r\nCSeq: 2\r\nContent-Type: application/sdp\r\nContent-Length: 5\r\n\r\nv=0\r\n"
        );
    }

    #[test]
    fn decodes_response_in_pieces() {
        let wire = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: DEADBEEF\r\nContent-Length: 4\r\n\r\nbody";
        let mut codec = RtspCodec::new();
        let mut src = BytesMut::new();
        src.extend_from_slice(&wire[..20]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&wire[20..wire.len() - 2]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&wire[wire.len() - 2..]);
        let resp = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.cseq(), Some(3));
        assert_eq!(resp.headers.get("session"), Some("DEADBEEF"));
        assert_eq!(resp.body, b"body");
        assert!(src.is_empty());
    }

    #[test]
    fn rejects_garbage_status_line() {
        let mut src = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\n"[..]);
        assert!(matches!(
            RtspCodec::new().decode(&mut src),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_content_length_is_refused_before_buffering() {
        for len in ["18446744073709551615", "10000000000000000000", "1000000000000000"] {
            let wire = format!("RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n", len);
            let mut src = BytesMut::from(wire.as_bytes());
            let capacity = src.capacity();
            assert!(matches!(
                RtspCodec::new().decode(&mut src),
                Err(MessageError::TooLarge { part: "body", .. })
            ));
            assert_eq!(src.capacity(), capacity);
        }
    }

    #[test]
    fn body_at_the_limit_is_accepted() {
        let mut codec = RtspCodec {
            max_body_bytes: 4,
            ..RtspCodec::new()
        };
        let mut src = BytesMut::from(&b"RTSP/1.0 200 OK\r\nContent-Length: 4\r\n\r\nbody"[..]);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap().body, b"body");

        let mut src = BytesMut::from(&b"RTSP/1.0 200 OK\r\nContent-Length: 5\r\n\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(MessageError::TooLarge { part: "body", limit: 4 })
        ));
    }

    #[test]
    fn transport_params_and_public_methods() {
        let t = "RTP/AVP/UDP;unicast;mode=record;server_port=53561;control_port=63379";
        assert_eq!(transport_param(t, "server_port"), Some("53561"));
        assert_eq!(transport_param(t, "control_port"), Some("63379"));
        assert_eq!(transport_param(t, "timing_port"), None);
        assert!(advertises("ANNOUNCE, SETUP, RECORD, TEARDOWN", Method::Record));
        assert!(!advertises("ANNOUNCE, SETUP", Method::Record));
    }

    #[test]
    fn response_round_trips_through_wire_form() {
        let resp = RtspResponse::new(453, "Not Enough Bandwidth").header("CSeq", "7");
        let mut src = BytesMut::from(&resp.to_bytes()[..]);
        let decoded = RtspCodec::new().decode(&mut src).unwrap().unwrap();
        assert_eq!(decoded, resp);
        assert!(!decoded.is_success());
    }
}
