// Recording - Captures incoming MIDI bytes while the player records
// Raw packets are queued with their time stamp in fixed-size chunks; the
// consumer side turns them back into events and assembles a track.

use crate::error::{SeqResult, SequencerError};
use crate::midi::event::{Event, Message, Tick, channel_message_data_len, decode_channel_message};
use crate::sequencer::calibrator::MicroTime;
use crate::sequencer::track::Track;
use std::collections::VecDeque;

/// Default size of one recording chunk in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 32_768;

/// Time stamp (i64) followed by the packet length (u32)
const HEADER_SIZE: usize = 12;

/// Unbounded byte queue of time-stamped MIDI packets.
///
/// Chunks that have been fully read go to a free list and are reused by
/// later writes, so steady recording does not allocate.
#[derive(Debug)]
pub struct RecordingBuffer {
    chunk_size: usize,
    chunks: VecDeque<Box<[u8]>>,
    free: Vec<Box<[u8]>>,
    /// Write offset in the last chunk
    top_pos: usize,
    /// Read offset in the first chunk
    bottom_pos: usize,
    /// Total bytes written and read since the last clear
    top_size: u64,
    bottom_size: u64,
    /// Reusable packet storage handed back by `get`
    scratch: Vec<u8>,
}

impl Default for RecordingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl RecordingBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(HEADER_SIZE),
            chunks: VecDeque::new(),
            free: Vec::new(),
            top_pos: 0,
            bottom_pos: 0,
            top_size: 0,
            bottom_size: 0,
            scratch: Vec::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes waiting to be read, headers included
    pub fn pending_bytes(&self) -> u64 {
        self.top_size - self.bottom_size
    }

    pub fn is_empty(&self) -> bool {
        self.pending_bytes() == 0
    }

    /// Chunks currently holding data
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks kept for reuse
    pub fn free_chunk_count(&self) -> usize {
        self.free.len()
    }

    fn allocate_chunk(&mut self) -> SeqResult<()> {
        let chunk = match self.free.pop() {
            Some(chunk) => chunk,
            None => {
                let mut data = Vec::new();
                data.try_reserve_exact(self.chunk_size)
                    .map_err(|_| SequencerError::OutOfMemory)?;
                data.resize(self.chunk_size, 0);
                data.into_boxed_slice()
            }
        };
        self.chunks.push_back(chunk);
        self.top_pos = 0;
        Ok(())
    }

    fn write_bytes(&mut self, mut bytes: &[u8]) -> SeqResult<()> {
        while !bytes.is_empty() {
            if self.chunks.is_empty() || self.top_pos >= self.chunk_size {
                self.allocate_chunk()?;
            }
            let room = self.chunk_size - self.top_pos;
            let n = room.min(bytes.len());
            let Some(chunk) = self.chunks.back_mut() else {
                return Err(SequencerError::OutOfMemory);
            };
            chunk[self.top_pos..self.top_pos + n].copy_from_slice(&bytes[..n]);
            self.top_pos += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn read_bytes(&mut self, out: &mut [u8]) {
        let mut filled = 0;
        while filled < out.len() {
            if self.bottom_pos >= self.chunk_size {
                if let Some(chunk) = self.chunks.pop_front() {
                    self.free.push(chunk);
                }
                self.bottom_pos = 0;
            }
            let Some(chunk) = self.chunks.front() else {
                break;
            };
            let n = (self.chunk_size - self.bottom_pos).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&chunk[self.bottom_pos..self.bottom_pos + n]);
            self.bottom_pos += n;
            filled += n;
        }
        // Recycle a chunk as soon as its last byte is consumed
        if self.bottom_pos >= self.chunk_size && self.chunks.len() > 1 {
            if let Some(chunk) = self.chunks.pop_front() {
                self.free.push(chunk);
            }
            self.bottom_pos = 0;
        }
    }

    /// Queues one packet stamped with `time` (µs since playback start)
    pub fn put(&mut self, time: MicroTime, bytes: &[u8]) -> SeqResult<()> {
        let size = u32::try_from(bytes.len())
            .map_err(|_| SequencerError::BadParameter(format!("packet of {} bytes", bytes.len())))?;
        let mut header = [0u8; HEADER_SIZE];
        header[..8].copy_from_slice(&time.to_ne_bytes());
        header[8..].copy_from_slice(&size.to_ne_bytes());
        self.write_bytes(&header)?;
        self.write_bytes(bytes)?;
        self.top_size += (HEADER_SIZE + bytes.len()) as u64;
        Ok(())
    }

    /// Takes the oldest packet. The returned slice is valid until the next
    /// call. `None` when nothing is pending.
    pub fn get(&mut self) -> SeqResult<Option<(MicroTime, &[u8])>> {
        let pending = self.pending_bytes();
        if pending == 0 {
            return Ok(None);
        }
        if pending < HEADER_SIZE as u64 {
            return Err(SequencerError::InconsistentCursor(format!(
                "{pending} stray bytes in the recording buffer"
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        self.read_bytes(&mut header);
        let mut time = [0u8; 8];
        time.copy_from_slice(&header[..8]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&header[8..]);
        let time = MicroTime::from_ne_bytes(time);
        let size = u32::from_ne_bytes(size) as usize;
        if pending < (HEADER_SIZE + size) as u64 {
            return Err(SequencerError::InconsistentCursor(format!(
                "packet of {size} bytes exceeds the recorded data"
            )));
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(size, 0);
        self.read_bytes(&mut scratch);
        self.scratch = scratch;
        self.bottom_size += (HEADER_SIZE + size) as u64;
        Ok(Some((time, &self.scratch)))
    }

    /// Drops everything, keeping one chunk for reuse
    pub fn clear(&mut self) {
        while let Some(chunk) = self.chunks.pop_front() {
            self.free.push(chunk);
        }
        self.free.truncate(1);
        self.top_pos = 0;
        self.bottom_pos = 0;
        self.top_size = 0;
        self.bottom_size = 0;
    }
}

/// Splits one incoming packet into events (tick 0), keeping running
/// status across packets.
///
/// Realtime bytes (0xF8 and above) are skipped. System common bytes cancel
/// running status. A sysex runs up to its 0xF7 or to the end of the packet.
/// Incomplete channel messages at the end of a packet are dropped.
pub fn decode_packet(bytes: &[u8], running_status: &mut u8) -> Vec<Event> {
    let mut events = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        match byte {
            0xf0 => {
                let end = bytes[i + 1..]
                    .iter()
                    .position(|&b| b == 0xf7)
                    .map_or(bytes.len(), |p| i + 1 + p + 1);
                events.push(Event::sysex(0, &bytes[i..end]));
                *running_status = 0;
                i = end;
            }
            0xf1..=0xf7 => {
                *running_status = 0;
                i += 1;
            }
            0xf8..=0xff => i += 1,
            _ => {
                let status = if byte >= 0x80 {
                    i += 1;
                    byte
                } else {
                    *running_status
                };
                let Some(len) = channel_message_data_len(status) else {
                    // Data byte without a status to apply it to
                    i += 1;
                    continue;
                };
                *running_status = status;
                if i + len > bytes.len() {
                    tracing::warn!(status, "incomplete MIDI message in recorded packet");
                    break;
                }
                if let Ok(message) = decode_channel_message(status, &bytes[i..i + len]) {
                    events.push(Event::new(0, status & 0x0f, message));
                }
                i += len;
            }
        }
    }
    events
}

/// Builds a track from recorded events: note-ons and note-offs are paired
/// into notes, everything else is kept as is.
/// Returns the track and the number of note-offs that found no note-on.
pub fn assemble_track(events: impl IntoIterator<Item = Event>) -> SeqResult<(Track, usize)> {
    let mut track = Track::new();
    let mut orphans = 0;
    for event in events {
        match event.message {
            Message::NoteOff { key, velocity } => {
                if let Err(SequencerError::OrphanedNoteOff { tick, code, channel }) =
                    track.match_note_off(event.tick, event.channel, key, velocity)
                {
                    tracing::warn!(tick, key = code, channel, "orphaned note-off while recording");
                    orphans += 1;
                }
            }
            _ => {
                track.append_events(std::iter::once(event))?;
            }
        }
    }
    // Notes still held when recording stopped end at the last event
    let last: Tick = track.iter().map(|e| e.tick).max().unwrap_or(0);
    let open: Vec<(Tick, u8, u8)> = track
        .iter()
        .filter_map(|e| match e.message {
            Message::NoteOn { key, .. } => Some((e.tick, e.channel, key)),
            _ => None,
        })
        .collect();
    for (tick, channel, key) in open {
        tracing::debug!(tick, key, channel, "closing note held at end of recording");
        track.match_note_off(last.max(tick + 1), channel, key, 0)?;
    }
    Ok((track, orphans))
}
