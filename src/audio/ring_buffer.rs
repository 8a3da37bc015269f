// Ring buffer - Time-stamped multi-channel sample ring
// One writer stores frames at absolute sample times; readers on other threads
// fetch by sample time and are told where they stand relative to the valid
// range. Bounds are published through a small queue so that a reader never
// sees a start time from one update paired with an end time from another.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering, fence};

/// Absolute frame number
pub type SampleTime = i64;

const BOUNDS_QUEUE_SIZE: usize = 32;
const BOUNDS_QUEUE_MASK: u32 = BOUNDS_QUEUE_SIZE as u32 - 1;
const BOUNDS_READ_RETRIES: usize = 8;

/// Outcome of a store, fetch or bounds check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferStatus {
    /// Both read times precede the buffered range
    WayBehind,
    /// Read starts before the buffered range, ends inside it
    SlightlyBehind,
    Ok,
    /// Read starts inside the buffered range, ends after it
    SlightlyAhead,
    /// Both read times follow the buffered range
    WayAhead,
    /// Read covers more than the buffered range, or a write exceeds capacity
    TooMuch,
    /// The bounds kept changing while being read
    CpuOverload,
    /// Caller's slice is shorter than frames × channels
    BufferNotLargeEnough,
}

impl RingBufferStatus {
    pub fn is_ok(self) -> bool {
        self == RingBufferStatus::Ok
    }
}

#[derive(Debug, Default)]
struct TimeBounds {
    start: AtomicI64,
    end: AtomicI64,
    update_counter: AtomicU32,
}

/// Lock-free sample ring for one producer and any number of readers.
///
/// Samples are kept as `f32` bit patterns in atomics so the reader and the
/// writer may touch the same frame concurrently; a reader that raced with an
/// overwrite finds out from the second bounds check done after copying.
#[derive(Debug)]
pub struct RingBuffer {
    channels: usize,
    capacity_frames: usize,
    data: Vec<Box<[AtomicU32]>>,
    bounds: [TimeBounds; BOUNDS_QUEUE_SIZE],
    bounds_ptr: AtomicU32,
}

impl RingBuffer {
    /// `frames` is rounded up to a power of two
    pub fn new(channels: usize, frames: usize) -> Self {
        let capacity_frames = frames.max(1).next_power_of_two();
        let data = (0..channels.max(1))
            .map(|_| (0..capacity_frames).map(|_| AtomicU32::new(0)).collect())
            .collect();
        Self {
            channels: channels.max(1),
            capacity_frames,
            data,
            bounds: Default::default(),
            bounds_ptr: AtomicU32::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    #[inline]
    fn frame_offset(&self, time: SampleTime) -> usize {
        (time & (self.capacity_frames as i64 - 1)) as usize
    }

    fn current_bounds(&self) -> &TimeBounds {
        let ptr = self.bounds_ptr.load(Ordering::Acquire);
        &self.bounds[(ptr & BOUNDS_QUEUE_MASK) as usize]
    }

    fn start_time(&self) -> SampleTime {
        self.current_bounds().start.load(Ordering::Acquire)
    }

    fn end_time(&self) -> SampleTime {
        self.current_bounds().end.load(Ordering::Acquire)
    }

    /// Writer only: fills the next queue slot, then publishes it
    fn set_time_bounds(&self, start: SampleTime, end: SampleTime) {
        let next = self.bounds_ptr.load(Ordering::Relaxed).wrapping_add(1);
        let slot = &self.bounds[(next & BOUNDS_QUEUE_MASK) as usize];
        // Matches no pointer that maps to this slot while the pair is rewritten
        slot.update_counter.store(next.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        slot.start.store(start, Ordering::Relaxed);
        slot.end.store(end, Ordering::Relaxed);
        slot.update_counter.store(next, Ordering::Release);
        self.bounds_ptr.store(next, Ordering::Release);
    }

    /// Valid range `[start, end)` of buffered frames
    pub fn time_bounds(&self) -> Result<(SampleTime, SampleTime), RingBufferStatus> {
        for _ in 0..BOUNDS_READ_RETRIES {
            let ptr = self.bounds_ptr.load(Ordering::Acquire);
            let slot = &self.bounds[(ptr & BOUNDS_QUEUE_MASK) as usize];
            let before = slot.update_counter.load(Ordering::Acquire);
            let start = slot.start.load(Ordering::Relaxed);
            let end = slot.end.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            let after = slot.update_counter.load(Ordering::Relaxed);
            if before == ptr && after == ptr {
                return Ok((start, end));
            }
        }
        Err(RingBufferStatus::CpuOverload)
    }

    /// Where `[start_read, end_read)` lies relative to the buffered range.
    /// With `ahead_ok`, reading past the end is fine (zeros come back).
    pub fn check_time_bounds(
        &self,
        start_read: SampleTime,
        end_read: SampleTime,
        ahead_ok: bool,
    ) -> RingBufferStatus {
        let (start, end) = match self.time_bounds() {
            Ok(bounds) => bounds,
            Err(status) => return status,
        };
        if start_read < start {
            return if end_read > end {
                RingBufferStatus::TooMuch
            } else if end_read < start {
                RingBufferStatus::WayBehind
            } else {
                RingBufferStatus::SlightlyBehind
            };
        }
        if end_read > end {
            return if ahead_ok {
                RingBufferStatus::Ok
            } else if start_read > end {
                RingBufferStatus::WayAhead
            } else {
                RingBufferStatus::SlightlyAhead
            };
        }
        RingBufferStatus::Ok
    }

    fn zero_range(&self, from: SampleTime, to: SampleTime) {
        for time in from..to {
            let offset = self.frame_offset(time);
            for channel in &self.data {
                channel[offset].store(0, Ordering::Relaxed);
            }
        }
    }

    /// Stores `frames` frames starting at `start_write`. `data` is
    /// interleaved (`frame * channels + ch`) unless `non_interleaved`, in
    /// which case channel planes follow each other (`ch * frames + frame`).
    /// Writing before the current end discards everything buffered; a gap
    /// after the current end is zero-filled.
    pub fn store(
        &self,
        start_write: SampleTime,
        frames: usize,
        data: &[f32],
        non_interleaved: bool,
    ) -> RingBufferStatus {
        if frames > self.capacity_frames {
            return RingBufferStatus::TooMuch;
        }
        if data.len() < frames * self.channels {
            return RingBufferStatus::BufferNotLargeEnough;
        }
        let end_write = start_write + frames as SampleTime;
        let capacity = self.capacity_frames as SampleTime;

        if start_write < self.end_time() {
            // Going backwards: throw everything out
            self.set_time_bounds(start_write, start_write);
        } else if end_write - self.start_time() > capacity {
            // Advance the start past the region about to be overwritten
            let new_start = end_write - capacity;
            let new_end = self.end_time().max(new_start);
            self.set_time_bounds(new_start, new_end);
        }

        let current_end = self.end_time();
        if start_write > current_end {
            self.zero_range(current_end.max(start_write - capacity), start_write);
        }

        for frame in 0..frames {
            let offset = self.frame_offset(start_write + frame as SampleTime);
            for (ch, channel) in self.data.iter().enumerate() {
                let sample = if non_interleaved {
                    data[ch * frames + frame]
                } else {
                    data[frame * self.channels + ch]
                };
                channel[offset].store(sample.to_bits(), Ordering::Relaxed);
            }
        }

        // Sample writes are ordered before the publish by the release store
        self.set_time_bounds(self.start_time(), end_write);
        RingBufferStatus::Ok
    }

    /// Copies `frames` interleaved frames starting at `start_read` into
    /// `out`. The bounds are checked before and after the copy; a non-`Ok`
    /// status means the copied data must not be trusted.
    pub fn fetch(
        &self,
        start_read: SampleTime,
        frames: usize,
        out: &mut [f32],
        ahead_ok: bool,
    ) -> RingBufferStatus {
        if frames > self.capacity_frames {
            return RingBufferStatus::TooMuch;
        }
        if out.len() < frames * self.channels {
            return RingBufferStatus::BufferNotLargeEnough;
        }
        let end_read = start_read + frames as SampleTime;
        let status = self.check_time_bounds(start_read, end_read, ahead_ok);
        if !status.is_ok() {
            return status;
        }
        let end = self.end_time();
        for frame in 0..frames {
            let time = start_read + frame as SampleTime;
            let offset = self.frame_offset(time);
            for (ch, channel) in self.data.iter().enumerate() {
                out[frame * self.channels + ch] = if time < end {
                    f32::from_bits(channel[offset].load(Ordering::Relaxed))
                } else {
                    0.0
                };
            }
        }
        self.check_time_bounds(start_read, end_read, ahead_ok)
    }
}
