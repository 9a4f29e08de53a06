// Timestamp resampling to a fixed output cadence
//
// Input frames arrive whenever the source produces them. The output stream
// advances in whole multiples of its frame interval `d`: a frame that lands
// k intervals after the last emitted slot fills k slots, a frame that lands
// before the next slot is due is dropped. `last_emitted_ns` only ever moves
// by exact multiples of `d`, so jitter never accumulates into drift.

/// What to do with one input frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resample {
    /// Write the frame into `count` consecutive slots ending at `timestamp_ns`
    Emit { count: u32, timestamp_ns: u64 },
    /// The frame arrived before the next slot was due
    Drop { timestamp_ns: u64, next_due_ns: u64 },
}

/// Maps variable-rate input timestamps onto a fixed slot grid
#[derive(Debug, Clone)]
pub struct Resampler {
    interval_ns: u64,
    last_emitted_ns: Option<u64>,
}

impl Resampler {
    /// `interval_ns` is clamped to at least 1ns
    pub fn new(interval_ns: u64) -> Self {
        Self {
            interval_ns: interval_ns.max(1),
            last_emitted_ns: None,
        }
    }

    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    /// Timestamp of the most recent slot, `None` before the first frame
    pub fn last_emitted_ns(&self) -> Option<u64> {
        self.last_emitted_ns
    }

    /// Forget the grid so the next frame is treated as the first one
    pub fn reset(&mut self) {
        self.last_emitted_ns = None;
    }

    pub fn next(&mut self, timestamp_ns: u64) -> Resample {
        let Some(last) = self.last_emitted_ns else {
            self.last_emitted_ns = Some(timestamp_ns);
            return Resample::Emit {
                count: 1,
                timestamp_ns,
            };
        };

        let slots = timestamp_ns.saturating_sub(last) / self.interval_ns;
        if slots == 0 {
            return Resample::Drop {
                timestamp_ns,
                next_due_ns: last.saturating_add(self.interval_ns),
            };
        }

        let count = match u32::try_from(slots) {
            Ok(count) => count,
            Err(_) => {
                // The grid catches up over the following frames
                log::warn!(
                    "timestamp jumped {} slots past {}, emitting {} now",
                    slots,
                    last,
                    u32::MAX
                );
                u32::MAX
            }
        };
        let emitted = last + count as u64 * self.interval_ns;
        self.last_emitted_ns = Some(emitted);
        Resample::Emit {
            count,
            timestamp_ns: emitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: u64 = 33_333_333;

    #[test]
    fn test_first_frame_emits_once() {
        for first in [0, 1, 123_456_789_000, u64::MAX / 2] {
            let mut r = Resampler::new(D);
            assert_eq!(r.next(first), Resample::Emit { count: 1, timestamp_ns: first });
            assert_eq!(r.last_emitted_ns(), Some(first));
        }
    }

    #[test]
    fn test_steady_input_one_slot_each() {
        let t = 5_000_000_000;
        let mut r = Resampler::new(D);
        let mut total = 0;
        for i in 0..30 {
            match r.next(t + i * D) {
                Resample::Emit { count, .. } => total += count,
                Resample::Drop { .. } => panic!("steady frame {} dropped", i),
            }
        }
        assert_eq!(total, 30);
        assert_eq!(r.last_emitted_ns(), Some(t + 29 * D));
    }

    #[test]
    fn test_stall_fills_gap() {
        let t = 1_000;
        let mut r = Resampler::new(D);
        for i in 0..10 {
            r.next(t + i * D);
        }
        let last = t + 9 * D;
        assert_eq!(
            r.next(last + 5 * D),
            Resample::Emit { count: 5, timestamp_ns: last + 5 * D }
        );
        assert_eq!(
            r.next(last + 6 * D),
            Resample::Emit { count: 1, timestamp_ns: last + 6 * D }
        );
    }

    #[test]
    fn test_early_and_regressing_frames_dropped() {
        let mut r = Resampler::new(D);
        r.next(10 * D);
        assert_eq!(
            r.next(10 * D + D / 2),
            Resample::Drop { timestamp_ns: 10 * D + D / 2, next_due_ns: 11 * D }
        );
        assert!(matches!(r.next(3 * D), Resample::Drop { .. }));
        assert!(matches!(r.next(10 * D), Resample::Drop { .. }));
        assert_eq!(r.last_emitted_ns(), Some(10 * D));
    }

    #[test]
    fn test_jitter_does_not_drift() {
        // Frames arrive late by up to 40% of an interval; the grid stays exact
        let base = 777;
        let mut r = Resampler::new(D);
        r.next(base);
        let jitter = [0, D * 2 / 5, D / 10, D * 3 / 10, 0, D / 5];
        for (i, j) in jitter.iter().cycle().take(60).enumerate() {
            let ts = base + (i as u64 + 1) * D + j;
            if let Resample::Emit { timestamp_ns, .. } = r.next(ts) {
                assert_eq!((timestamp_ns - base) % D, 0);
                assert!(timestamp_ns <= ts);
            }
        }
        assert_eq!(r.last_emitted_ns(), Some(base + 60 * D));
    }

    #[test]
    fn test_reset_restarts_grid() {
        let mut r = Resampler::new(D);
        r.next(100 * D);
        r.reset();
        assert_eq!(r.next(7), Resample::Emit { count: 1, timestamp_ns: 7 });
    }

    #[test]
    fn test_huge_jump_clamped_to_slot_limit() {
        let mut r = Resampler::new(1);
        r.next(0);
        let limit = u32::MAX as u64;
        assert_eq!(
            r.next(3 * limit),
            Resample::Emit { count: u32::MAX, timestamp_ns: limit }
        );
        // Still on the grid, so the rest of the gap is covered next time
        assert_eq!(
            r.next(3 * limit),
            Resample::Emit { count: u32::MAX, timestamp_ns: 2 * limit }
        );
        assert_eq!(r.next(2 * limit + 5), Resample::Emit { count: 5, timestamp_ns: 2 * limit + 5 });
    }

    #[test]
    fn test_zero_interval_clamped() {
        let mut r = Resampler::new(0);
        assert_eq!(r.interval_ns(), 1);
        r.next(10);
        assert_eq!(r.next(13), Resample::Emit { count: 3, timestamp_ns: 13 });
    }
}
