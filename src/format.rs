//! The single PCM format the client accepts and the codecs it can announce.
//!
//! Input is always 44.1 kHz, 16-bit signed little-endian, interleaved stereo.
//! Nothing is resampled or converted here; callers hand in frames in this
//! exact layout.

use serde::Deserialize;

/// Sample rate in frames per second.
pub const SAMPLE_RATE: u32 = 44_100;
/// Interleaved channel count.
pub const CHANNELS: u16 = 2;
/// Bits per sample, per channel.
pub const BITS_PER_SAMPLE: u16 = 16;
/// Size of one frame (one sample for every channel) in bytes.
pub const BYTES_PER_FRAME: usize = (CHANNELS as usize) * (BITS_PER_SAMPLE as usize / 8);
/// Frames carried by one full audio packet (the Apple Lossless frame length).
pub const FRAMES_PER_PACKET: usize = 352;
/// Largest PCM slice a single packet carries.
pub const MAX_PACKET_PCM_BYTES: usize = FRAMES_PER_PACKET * BYTES_PER_FRAME;
/// RTP payload type used for audio in the announced SDP.
pub const AUDIO_PAYLOAD_TYPE: u8 = 96;

/// Payload codec negotiated in ANNOUNCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Apple Lossless frames, sent uncompressed ("escape" frames).
    #[default]
    AppleLossless,
    /// Raw big-endian 16-bit PCM.
    L16,
}

impl Codec {
    /// The `a=rtpmap` attribute value for this codec.
    pub fn rtpmap(&self) -> String {
        match self {
            Codec::AppleLossless => format!("{} AppleLossless", AUDIO_PAYLOAD_TYPE),
            Codec::L16 => format!("{} L16/{}/{}", AUDIO_PAYLOAD_TYPE, SAMPLE_RATE, CHANNELS),
        }
    }

    /// The `a=fmtp` attribute value, if the codec needs one.
    ///
    /// For Apple Lossless this is the decoder cookie: frame length, compatible
    /// version, bit depth, rice history/initial/limit, channels, max run,
    /// max frame bytes, average bitrate and sample rate.
    pub fn fmtp(&self) -> Option<String> {
        match self {
            Codec::AppleLossless => Some(format!(
                "{} {} 0 {} 40 10 14 {} 255 0 0 {}",
                AUDIO_PAYLOAD_TYPE, FRAMES_PER_PACKET, BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE
            )),
            Codec::L16 => None,
        }
    }
}

/// Number of whole frames in `len` bytes.
pub fn frames_in(len: usize) -> usize {
    len / BYTES_PER_FRAME
}

/// Duration of `frames` frames of audio.
pub fn frames_to_duration(frames: u64) -> std::time::Duration {
    std::time::Duration::from_nanos(frames.saturating_mul(1_000_000_000) / u64::from(SAMPLE_RATE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_matches_layout() {
        assert_eq!(BYTES_PER_FRAME, 4);
        assert_eq!(MAX_PACKET_PCM_BYTES, 1408);
    }

    #[test]
    fn alac_fmtp_describes_stereo_cd_audio() {
        assert_eq!(
            Codec::AppleLossless.fmtp().unwrap(),
            "96 352 0 16 40 10 14 2 255 0 0 44100"
        );
        assert_eq!(Codec::L16.rtpmap(), "96 L16/44100/2");
        assert!(Codec::L16.fmtp().is_none());
    }

    #[test]
    fn one_second_of_frames() {
        assert_eq!(frames_to_duration(44_100), std::time::Duration::from_secs(1));
        assert_eq!(frames_in(9), 2);
    }
}
