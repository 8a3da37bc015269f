// Transport - Player state shared between the control and scheduler threads

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Player lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerStatus {
    /// No position set yet
    #[default]
    Idle = 0,
    /// Positioned, not running
    Ready = 1,
    /// Prerolled; `start` resumes without seeking again
    Suspended = 2,
    Playing = 3,
    /// Reached the end (or the scheduled stop); the thread has exited
    Exhausted = 4,
}

impl PlayerStatus {
    /// Playing or finished but not yet stopped
    pub fn is_running(&self) -> bool {
        matches!(self, PlayerStatus::Playing | PlayerStatus::Exhausted)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            PlayerStatus::Idle | PlayerStatus::Ready | PlayerStatus::Suspended
        )
    }
}

impl From<u8> for PlayerStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => PlayerStatus::Ready,
            2 => PlayerStatus::Suspended,
            3 => PlayerStatus::Playing,
            4 => PlayerStatus::Exhausted,
            _ => PlayerStatus::Idle,
        }
    }
}

/// Atomic wrapper to share the status between threads
#[derive(Debug, Clone)]
pub struct AtomicPlayerStatus {
    inner: Arc<AtomicU8>,
}

impl AtomicPlayerStatus {
    pub fn new(status: PlayerStatus) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(status as u8)),
        }
    }

    pub fn get(&self) -> PlayerStatus {
        PlayerStatus::from(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, status: PlayerStatus) {
        self.inner.store(status as u8, Ordering::Release);
    }

    /// Moves to `new` only from `current`; returns whether it did
    pub fn transition(&self, current: PlayerStatus, new: PlayerStatus) -> bool {
        self.inner
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicPlayerStatus {
    fn default() -> Self {
        Self::new(PlayerStatus::Idle)
    }
}

/// Termination flag observed by the scheduler thread between sleep slices
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    inner: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.inner.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}
