//! Concurrent writer/reader checks on the sample ring

use mymusic_sequencer::audio::ring_buffer::{RingBuffer, RingBufferStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const CHANNELS: usize = 2;
const BLOCK: usize = 256;

/// Sample value for (time, channel); exact in f32 for the times used here
fn sample(time: i64, channel: usize) -> f32 {
    (time * 2 + channel as i64) as f32
}

#[test]
fn test_reader_never_trusts_overwritten_frames() {
    let ring = Arc::new(RingBuffer::new(CHANNELS, 1000));
    assert_eq!(ring.capacity_frames(), 1024);
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let ring = Arc::clone(&ring);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut block = vec![0.0f32; BLOCK * CHANNELS];
            for n in 0..400i64 {
                let start = n * BLOCK as i64;
                for frame in 0..BLOCK {
                    for ch in 0..CHANNELS {
                        block[frame * CHANNELS + ch] = sample(start + frame as i64, ch);
                    }
                }
                assert_eq!(ring.store(start, BLOCK, &block, false), RingBufferStatus::Ok);
                thread::yield_now();
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut out = vec![0.0f32; 64 * CHANNELS];
    let mut verified = 0usize;
    while !done.load(Ordering::Acquire) {
        let Ok((start, end)) = ring.time_bounds() else {
            continue;
        };
        if end - start < 64 {
            continue;
        }
        let read_at = start.max(end - 64 - 128);
        if ring.fetch(read_at, 64, &mut out, false) == RingBufferStatus::Ok {
            for frame in 0..64 {
                for ch in 0..CHANNELS {
                    assert_eq!(out[frame * CHANNELS + ch], sample(read_at + frame as i64, ch));
                }
            }
            verified += 1;
        }
    }
    writer.join().unwrap();

    let (start, end) = ring.time_bounds().unwrap();
    assert_eq!(end, 400 * BLOCK as i64);
    assert_eq!(end - start, 1024);
    // The reader may lose every race on a loaded machine; the last block is
    // still readable afterwards
    assert_eq!(ring.fetch(end - 64, 64, &mut out, false), RingBufferStatus::Ok);
    assert_eq!(out[0], sample(end - 64, 0));
    let _ = verified;
}

#[test]
fn test_status_relative_to_bounds() {
    let ring = RingBuffer::new(1, 256);
    let data: Vec<f32> = (0..128).map(|i| i as f32).collect();
    assert!(ring.store(1000, 128, &data, false).is_ok());
    // The first store into an empty ring keeps a zero-filled lead-in
    assert_eq!(ring.time_bounds(), Ok((1128 - 256, 1128)));

    assert_eq!(ring.check_time_bounds(1000, 1128, false), RingBufferStatus::Ok);
    assert_eq!(ring.check_time_bounds(800, 850, false), RingBufferStatus::WayBehind);
    assert_eq!(ring.check_time_bounds(860, 900, false), RingBufferStatus::SlightlyBehind);
    assert_eq!(ring.check_time_bounds(1100, 1140, false), RingBufferStatus::SlightlyAhead);
    assert_eq!(ring.check_time_bounds(1200, 1300, false), RingBufferStatus::WayAhead);
    assert_eq!(ring.check_time_bounds(1200, 1300, true), RingBufferStatus::Ok);
    assert_eq!(ring.check_time_bounds(860, 1200, false), RingBufferStatus::TooMuch);

    let mut out = vec![1.0f32; 64];
    assert_eq!(ring.fetch(900, 64, &mut out, false), RingBufferStatus::Ok);
    assert!(out.iter().all(|&s| s == 0.0));
    assert_eq!(ring.fetch(1100, 64, &mut out, true), RingBufferStatus::Ok);
    assert_eq!(out[27], 127.0);
    assert_eq!(out[28], 0.0);
    assert_eq!(
        ring.fetch(1000, 64, &mut out[..10], false),
        RingBufferStatus::BufferNotLargeEnough
    );
}
