//! AirTunes (RAOP) streaming client.
//!
//! Negotiates a session with a receiver over RTSP, then streams 44.1 kHz
//! 16-bit stereo PCM to it as RTP over UDP, either as uncompressed Apple
//! Lossless frames or as raw L16. Callers feed little-endian PCM to
//! [`Client::write`]; framing, packetization and timestamps are handled here.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod control;
pub mod e2e_common;
pub mod format;
pub mod handshake;
pub mod messages;
pub mod sdk;
pub mod session;
pub mod stream;

pub use config::ClientConfig;
pub use format::{Codec, BYTES_PER_FRAME};
pub use handshake::{HandshakeError, HandshakeState};
pub use sdk::{Client, ClientError, DisconnectHandle};
pub use session::ClientState;
pub use stream::{StreamError, Written};
