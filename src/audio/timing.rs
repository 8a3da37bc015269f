// Host timing for MIDI scheduling
// Monotonic microsecond clocks shared between the player thread and the transport

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source in microseconds
pub trait HostClock: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// Wall clock measured from its creation
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Instant corresponding to a timestamp of this clock
    pub fn instant_at(&self, micros: u64) -> Instant {
        self.origin + std::time::Duration::from_micros(micros)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
    }
}

/// Clock advanced by hand (tests, offline rendering)
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::Relaxed);
    }

    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }
}

impl HostClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::Relaxed)
    }
}

impl<C: HostClock + ?Sized> HostClock for Arc<C> {
    fn now_micros(&self) -> u64 {
        (**self).now_micros()
    }
}

/// Converts an audio frame count to microseconds at `sample_rate`
pub fn frames_to_micros(frames: u64, sample_rate: f64) -> u64 {
    if sample_rate <= 0.0 {
        return 0;
    }
    ((frames as f64 * 1_000_000.0) / sample_rate) as u64
}

/// Converts microseconds to an audio frame count at `sample_rate`
pub fn micros_to_frames(micros: u64, sample_rate: f64) -> u64 {
    ((micros as f64 * sample_rate) / 1_000_000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        other.advance(500);
        assert_eq!(clock.now_micros(), 1_500);
        clock.set(42);
        assert_eq!(other.now_micros(), 42);
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(b >= a);
    }

    #[test]
    fn test_frame_conversions() {
        assert_eq!(frames_to_micros(48_000, 48_000.0), 1_000_000);
        assert_eq!(micros_to_frames(500_000, 44_100.0), 22_050);
        assert_eq!(frames_to_micros(100, 0.0), 0);
    }
}
