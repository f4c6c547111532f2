//! Frame clock and real-time pacing.
//!
//! The clock counts frames, not wall time: every packet is stamped with the
//! clock value at its first frame and the clock moves on by the packet's frame
//! count. The pacer compares that count with elapsed wall time.

use std::time::{Duration, Instant};

use crate::format::frames_to_duration;

/// Monotonic 64-bit frame counter for one stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    next: u64,
}

impl FrameClock {
    pub fn starting_at(start: u64) -> Self {
        Self { next: start }
    }

    /// Timestamp the next packet will carry.
    pub fn now(&self) -> u64 {
        self.next
    }

    /// Stamps a packet of `frames` frames and returns its timestamp.
    pub fn advance(&mut self, frames: u64) -> u64 {
        let stamp = self.next;
        self.next += frames;
        stamp
    }
}

/// Tracks how far the sent audio runs ahead of real time.
#[derive(Debug, Default)]
pub struct Pacer {
    anchor: Option<Instant>,
    frames_sent: u64,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `frames` sent at `now`; the first call anchors the stream.
    pub fn record(&mut self, frames: u64, now: Instant) {
        self.anchor.get_or_insert(now);
        self.frames_sent += frames;
    }

    /// Audio sent beyond what has played out by `now`; zero when behind.
    pub fn lead_at(&self, now: Instant) -> Duration {
        match self.anchor {
            Some(anchor) => {
                frames_to_duration(self.frames_sent).saturating_sub(now.saturating_duration_since(anchor))
            }
            None => Duration::ZERO,
        }
    }

    pub fn lead(&self) -> Duration {
        self.lead_at(Instant::now())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SAMPLE_RATE;

    #[test]
    fn advance_returns_packet_start() {
        let mut clock = FrameClock::starting_at(10);
        assert_eq!(clock.advance(352), 10);
        assert_eq!(clock.advance(1), 362);
        assert_eq!(clock.now(), 363);
    }

    #[test]
    fn clock_does_not_wrap_at_u32() {
        let mut clock = FrameClock::starting_at(u64::from(u32::MAX) - 1);
        clock.advance(352);
        assert!(clock.now() > u64::from(u32::MAX));
    }

    #[test]
    fn lead_shrinks_with_time() {
        let mut pacer = Pacer::new();
        let t0 = Instant::now();
        assert_eq!(pacer.lead_at(t0), Duration::ZERO);
        pacer.record(u64::from(SAMPLE_RATE) * 2, t0);
        assert_eq!(pacer.lead_at(t0), Duration::from_secs(2));
        assert_eq!(
            pacer.lead_at(t0 + Duration::from_millis(500)),
            Duration::from_millis(1500)
        );
        assert_eq!(pacer.lead_at(t0 + Duration::from_secs(3)), Duration::ZERO);
    }
}
