//! Packet payload encoders.
//!
//! Both codecs are lossless re-packings of the input PCM. Apple Lossless is
//! emitted as "escape" frames: the element header followed by the verbatim
//! samples, which every ALAC decoder accepts without a compression pass.

use crate::format::{Codec, BYTES_PER_FRAME, FRAMES_PER_PACKET, MAX_PACKET_PCM_BYTES};

const ID_CPE: u32 = 1;
const ID_END: u32 = 7;

/// Upper bound on the encoded size of one full packet.
pub const MAX_PAYLOAD_BYTES: usize = MAX_PACKET_PCM_BYTES + 16;

/// Appends the encoded form of `pcm` to `out`.
///
/// `pcm` must hold whole frames, at most [`FRAMES_PER_PACKET`] of them.
pub fn encode_payload(codec: Codec, pcm: &[u8], out: &mut Vec<u8>) {
    debug_assert_eq!(pcm.len() % BYTES_PER_FRAME, 0);
    debug_assert!(pcm.len() <= MAX_PACKET_PCM_BYTES);
    match codec {
        Codec::L16 => encode_l16(pcm, out),
        Codec::AppleLossless => encode_alac_escape(pcm, out),
    }
}

fn encode_l16(pcm: &[u8], out: &mut Vec<u8>) {
    out.reserve(pcm.len());
    for sample in pcm.chunks_exact(2) {
        out.push(sample[1]);
        out.push(sample[0]);
    }
}

fn encode_alac_escape(pcm: &[u8], out: &mut Vec<u8>) {
    let frames = pcm.len() / BYTES_PER_FRAME;
    let partial = frames < FRAMES_PER_PACKET;

    let mut bits = BitWriter::new(out);
    bits.write(ID_CPE, 3);
    bits.write(0, 4); // element instance
    bits.write(0, 12);
    bits.write(u32::from(partial), 1);
    bits.write(0, 2); // bytes shifted
    bits.write(1, 1); // escape
    if partial {
        bits.write(frames as u32, 32);
    }
    for sample in pcm.chunks_exact(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]);
        bits.write(u32::from(value as u16), 16);
    }
    bits.write(ID_END, 3);
    bits.finish();
}

/// MSB-first bit packer over a byte vector.
struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    acc: u64,
    pending: u32,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self {
            out,
            acc: 0,
            pending: 0,
        }
    }

    fn write(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
        self.acc = (self.acc << bits) | u64::from(value & mask);
        self.pending += bits;
        while self.pending >= 8 {
            self.pending -= 8;
            self.out.push((self.acc >> self.pending) as u8);
        }
        self.acc &= (1u64 << self.pending) - 1;
    }

    fn finish(self) {
        if self.pending > 0 {
            self.out.push((self.acc << (8 - self.pending)) as u8);
        }
    }
}
