//! Wall-clock bookkeeping for the end-of-run summary.

use std::time::{Duration, Instant};

/// Counts relayed frames against the wall clock.
///
/// The GPU-side copy latency comes from timestamp queries; this only tells the
/// operator how fast the loop itself turned over.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    started: Instant,
    frames: u64,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
        }
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Frames per second since [`RunClock::start`]; zero until time has passed.
    pub fn frames_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_recorded_frames() {
        let mut clock = RunClock::start();
        assert_eq!(clock.frames(), 0);
        clock.record_frame();
        clock.record_frame();
        assert_eq!(clock.frames(), 2);
    }

    #[test]
    fn test_rate_is_zero_without_frames() {
        let clock = RunClock::start();
        assert_eq!(clock.frames_per_second(), 0.0);
        assert!(clock.elapsed() <= clock.elapsed());
    }
}
