//! RTP framing for audio and sync packets.

use std::time::{SystemTime, UNIX_EPOCH};

pub const RTP_HEADER_LEN: usize = 12;
pub const SYNC_PACKET_LEN: usize = 20;
/// Payload type of the sync packets sent to the receiver's control port.
pub const SYNC_PAYLOAD_TYPE: u8 = 0x54;

const RTP_VERSION: u8 = 2 << 6;
/// Seconds between the NTP epoch (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Fixed 12-byte RTP header (no CSRCs, no extension).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(RTP_VERSION);
        out.push((u8::from(self.marker) << 7) | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RTP_HEADER_LEN || bytes[0] >> 6 != 2 {
            return None;
        }
        Some(Self {
            marker: bytes[1] & 0x80 != 0,
            payload_type: bytes[1] & 0x7f,
            sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// Ties an RTP timestamp to wall-clock time for the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    /// Set on the first sync of a stream.
    pub first: bool,
    /// The RTP timestamp that should be playing now.
    pub now_minus_latency: u32,
    /// Current time, NTP format.
    pub ntp_time: u64,
    /// The RTP timestamp of the next packet to be sent.
    pub now: u32,
}

impl SyncPacket {
    pub fn encode(&self) -> [u8; SYNC_PACKET_LEN] {
        let mut out = [0u8; SYNC_PACKET_LEN];
        out[0] = if self.first { 0x90 } else { 0x80 };
        out[1] = 0x80 | SYNC_PAYLOAD_TYPE;
        out[2..4].copy_from_slice(&7u16.to_be_bytes());
        out[4..8].copy_from_slice(&self.now_minus_latency.to_be_bytes());
        out[8..16].copy_from_slice(&self.ntp_time.to_be_bytes());
        out[16..20].copy_from_slice(&self.now.to_be_bytes());
        out
    }
}

/// Current time as a 64-bit NTP timestamp (32.32 fixed point since 1900).
pub fn ntp_now() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}
