use bytes::{Bytes, BytesMut};

use crate::format::BYTES_PER_FRAME;

/// Queue of audio bytes that have been handed to the client but not sent.
///
/// Callers may append arbitrary chunk sizes; only whole frames ever leave
/// the queue, so a trailing partial frame waits for the next append.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    queue: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes; any length is accepted.
    pub fn append(&mut self, bytes: &[u8]) {
        self.queue.extend_from_slice(bytes);
    }

    /// Bytes currently queued, including any partial frame.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Longest queued prefix that is a whole number of frames.
    pub fn largest_frame_aligned_prefix(&self) -> usize {
        (self.queue.len() / BYTES_PER_FRAME) * BYTES_PER_FRAME
    }

    /// Removes and returns the first `n` bytes.
    ///
    /// # Panics
    /// If `n` is not a multiple of [`BYTES_PER_FRAME`] or exceeds the queue
    /// length. Both are caller bugs.
    pub fn consume(&mut self, n: usize) -> Bytes {
        assert!(
            n % BYTES_PER_FRAME == 0,
            "consume({n}) is not frame aligned"
        );
        assert!(n <= self.queue.len(), "consume({n}) past end of buffer");
        self.queue.split_to(n).freeze()
    }

    /// Drops everything still queued, partial frames included.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_prefix_is_floor_of_frames() {
        let mut buf = FrameBuffer::new();
        for len in 0..(BYTES_PER_FRAME * 5) {
            buf.clear();
            buf.append(&vec![0u8; len]);
            assert_eq!(
                buf.largest_frame_aligned_prefix(),
                (len / BYTES_PER_FRAME) * BYTES_PER_FRAME
            );
        }
    }

    #[test]
    fn partial_frame_stays_queued() {
        let mut buf = FrameBuffer::new();
        buf.append(&[1, 2, 3, 4, 5, 6]);
        let n = buf.largest_frame_aligned_prefix();
        assert_eq!(n, 4);
        assert_eq!(&buf.consume(n)[..], &[1, 2, 3, 4]);
        assert_eq!(buf.len(), 2);
        buf.append(&[7, 8]);
        assert_eq!(&buf.consume(4)[..], &[5, 6, 7, 8]);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "not frame aligned")]
    fn misaligned_consume_is_a_bug() {
        let mut buf = FrameBuffer::new();
        buf.append(&[0; 8]);
        buf.consume(3);
    }
}
