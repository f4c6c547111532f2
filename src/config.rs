use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::format::Codec;

pub const DEFAULT_PORT: u16 = 5000;
/// A quarter second of audio at 44.1 kHz.
pub const DEFAULT_LATENCY_FRAMES: u32 = 11_025;

/// Tunables for a [`crate::Client`].
///
/// Durations are read from JSON as milliseconds (`connect_timeout_ms`, ...)
/// and must be non-zero. Missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_timeout_ms", deserialize_with = "millis")]
    pub request_timeout: Duration,
    #[serde(rename = "keepalive_interval_ms", deserialize_with = "millis")]
    pub keepalive_interval: Duration,
    pub codec: Codec,
    pub user_agent: String,
    /// Frames between the sync packet's `now` and the frame playing now.
    pub latency_frames: u32,
    /// Control port used when the address names none.
    pub default_port: u16,
    /// Initial volume in dB, sent once the session is recording.
    pub volume: Option<f32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(2),
            codec: Codec::default(),
            user_agent: format!("aerial/{}", env!("CARGO_PKG_VERSION")),
            latency_frames: DEFAULT_LATENCY_FRAMES,
            default_port: DEFAULT_PORT,
            volume: None,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match u64::deserialize(deserializer)? {
        0 => Err(D::Error::custom("duration must be at least 1 ms")),
        ms => Ok(Duration::from_millis(ms)),
    }
}
