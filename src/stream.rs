use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{trace, warn};

use crate::buffer::FrameBuffer;
use crate::codec::{encode_payload, MAX_PAYLOAD_BYTES};
use crate::format::{frames_in, Codec, AUDIO_PAYLOAD_TYPE, MAX_PACKET_PCM_BYTES, SAMPLE_RATE};

pub mod clock;
pub mod packet;

use clock::{FrameClock, Pacer};
use packet::{ntp_now, RtpHeader, SyncPacket, RTP_HEADER_LEN};

/// Sink for serialized packets (UDP in production, recorders in tests).
pub trait PacketTransport: Send + Sync {
    /// Sends one audio packet on the data connection.
    fn send_audio(&self, packet: &[u8]) -> io::Result<()>;

    /// Sends a sync packet to the receiver's control port, if it has one.
    fn send_sync(&self, packet: &[u8]) -> io::Result<()> {
        let _ = packet;
        Ok(())
    }
}

/// Errors emitted from the write path.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("stream closed after an earlier send failure")]
    Closed,
}

/// Random starting point of a stream, announced in RECORD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStart {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl StreamStart {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            sequence: rng.gen(),
            timestamp: rng.gen(),
            ssrc: rng.gen(),
        }
    }
}

/// Outcome of a write: bytes consumed from the queue and the timestamp of the
/// last packet sent, if any was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    pub bytes: usize,
    pub timestamp: Option<u64>,
}

/// Audio write path for one negotiated session.
///
/// # Guarantees
/// * Only whole frames are sent; a trailing partial frame stays queued.
/// * Packets carry at most [`crate::format::FRAMES_PER_PACKET`] frames.
/// * Timestamps strictly increase by each packet's frame count.
/// * After a failed send the stream refuses further writes.
#[derive(Debug)]
pub struct AudioStream<T: PacketTransport> {
    transport: T,
    codec: Codec,
    buffer: FrameBuffer,
    clock: FrameClock,
    pacer: Pacer,
    sequence: u16,
    ssrc: u32,
    latency_frames: u32,
    packets_sent: u64,
    next_sync_at: u64,
    closed: bool,
    scratch: Vec<u8>,
}

impl<T: PacketTransport> AudioStream<T> {
    pub fn new(transport: T, codec: Codec, start: StreamStart, latency_frames: u32) -> Self {
        let first = u64::from(start.timestamp);
        Self {
            transport,
            codec,
            buffer: FrameBuffer::new(),
            clock: FrameClock::starting_at(first),
            pacer: Pacer::new(),
            sequence: start.sequence,
            ssrc: start.ssrc,
            latency_frames,
            packets_sent: 0,
            next_sync_at: first,
            closed: false,
            scratch: Vec::with_capacity(RTP_HEADER_LEN + MAX_PAYLOAD_BYTES),
        }
    }

    /// Queues `bytes` and sends every whole frame now available.
    ///
    /// Packets sent before a failing one stay sent; the failing packet's
    /// bytes are not counted and the stream closes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<Written, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.buffer.append(bytes);
        let aligned = self.buffer.largest_frame_aligned_prefix();

        let mut written = Written {
            bytes: 0,
            timestamp: None,
        };
        while written.bytes < aligned {
            let take = (aligned - written.bytes).min(MAX_PACKET_PCM_BYTES);
            let pcm = self.buffer.consume(take);
            match self.send_packet(&pcm) {
                Ok(stamp) => {
                    written.bytes += take;
                    written.timestamp = Some(stamp);
                }
                Err(err) => {
                    self.closed = true;
                    self.buffer.clear();
                    return Err(err);
                }
            }
        }
        Ok(written)
    }

    fn send_packet(&mut self, pcm: &[u8]) -> Result<u64, StreamError> {
        let frames = frames_in(pcm.len()) as u64;
        let stamp = self.clock.now();
        if stamp >= self.next_sync_at {
            self.send_sync(stamp);
            self.next_sync_at = stamp + u64::from(SAMPLE_RATE);
        }

        self.scratch.clear();
        RtpHeader {
            marker: self.packets_sent == 0,
            payload_type: AUDIO_PAYLOAD_TYPE,
            sequence: self.sequence,
            timestamp: stamp as u32,
            ssrc: self.ssrc,
        }
        .write_to(&mut self.scratch);
        encode_payload(self.codec, pcm, &mut self.scratch);
        self.transport.send_audio(&self.scratch)?;

        trace!(seq = self.sequence, ts = stamp, frames, "audio packet");
        self.sequence = self.sequence.wrapping_add(1);
        self.clock.advance(frames);
        self.pacer.record(frames, Instant::now());
        self.packets_sent += 1;
        Ok(stamp)
    }

    fn send_sync(&self, stamp: u64) {
        let now = stamp as u32;
        let sync = SyncPacket {
            first: self.packets_sent == 0,
            now_minus_latency: now.wrapping_sub(self.latency_frames),
            ntp_time: ntp_now(),
            now,
        };
        if let Err(err) = self.transport.send_sync(&sync.encode()) {
            warn!(error = %err, "sync packet not sent");
        }
    }

    /// How far the sent audio is ahead of real time.
    pub fn lead(&self) -> Duration {
        self.pacer.lead()
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// UDP data connection. Bound before SETUP so its port can be advertised,
/// opened once the receiver has named its ports.
#[derive(Debug)]
pub struct UdpPacketTransport {
    socket: StdUdpSocket,
    audio_peer: Option<SocketAddr>,
    sync_peer: Option<SocketAddr>,
}

impl UdpPacketTransport {
    pub fn bind(local: SocketAddr) -> io::Result<Self> {
        let socket = StdUdpSocket::bind(local)?;
        Ok(Self {
            socket,
            audio_peer: None,
            sync_peer: None,
        })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn open(&mut self, audio: SocketAddr, sync: Option<SocketAddr>) {
        self.audio_peer = Some(audio);
        self.sync_peer = sync;
    }
}

impl PacketTransport for UdpPacketTransport {
    fn send_audio(&self, packet: &[u8]) -> io::Result<()> {
        let peer = self.audio_peer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "data connection not open")
        })?;
        self.socket.send_to(packet, peer)?;
        Ok(())
    }

    fn send_sync(&self, packet: &[u8]) -> io::Result<()> {
        if let Some(peer) = self.sync_peer {
            self.socket.send_to(packet, peer)?;
        }
        Ok(())
    }
}
