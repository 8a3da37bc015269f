// Standard MIDI File import and export
// Formats 0 and 1. Notes are stored with their duration; on import note-offs
// are paired with the most recent open note-on of the same key and channel.
// Where that pairing would be ambiguous the exporter writes the private
// duration meta (0x7E) in front of the note-on.

use crate::error::{SeqResult, SequencerError};
use crate::midi::event::{
    channel_message_data_len, decode_channel_message, meta, Event, Message, Payload, Tick, MAX_TICK,
    META_CHANNEL, SYSEX_CHANNEL,
};
use crate::sequencer::sequence::Sequence;
use crate::sequencer::timeline::{Tempo, TimeSignature};
use crate::sequencer::track::Track;
use std::io::Write;
use std::path::Path;

const HEADER_TAG: &[u8; 4] = b"MThd";
const TRACK_TAG: &[u8; 4] = b"MTrk";

/// Byte cursor over an in-memory file
struct SmfReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SmfReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> SeqResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(SequencerError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> SeqResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(SequencerError::UnexpectedEof)?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(SequencerError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_u16(&mut self) -> SeqResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> SeqResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Variable-length quantity, at most four bytes
    fn read_var_len(&mut self) -> SeqResult<u32> {
        let mut value: u32 = 0;
        for _ in 0..4 {
            let byte = self.read_u8()?;
            value = (value << 7) | u32::from(byte & 0x7f);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(SequencerError::UnsupportedFormat("variable-length quantity too long".into()))
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn decode_var_len(bytes: &[u8]) -> Tick {
    bytes
        .iter()
        .take(5)
        .fold(0, |value, &b| (value << 7) | Tick::from(b & 0x7f))
}

fn write_var_len(out: &mut Vec<u8>, value: u32) {
    let mut stack = [0u8; 5];
    let mut n = 0;
    let mut v = value;
    loop {
        stack[n] = (v & 0x7f) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        out.push(if i > 0 { stack[i] | 0x80 } else { stack[i] });
    }
}

/// What reading one file found besides the events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmfReport {
    pub format: u16,
    pub orphaned_note_offs: usize,
    /// Note-ons that never saw their note-off
    pub unterminated_notes: usize,
    pub skipped_chunks: usize,
}

/// Reads a standard MIDI file into a new sequence
pub fn read_smf(data: &[u8]) -> SeqResult<(Sequence, SmfReport)> {
    let mut reader = SmfReader::new(data);
    let tag = reader.read_bytes(4).map_err(|_| SequencerError::HeaderChunkNotFound)?;
    if tag != HEADER_TAG {
        return Err(SequencerError::HeaderChunkNotFound);
    }
    let size = reader.read_u32()? as usize;
    if size < 6 {
        return Err(SequencerError::HeaderChunkNotFound);
    }
    let header = reader.read_bytes(size)?;
    let format = u16::from_be_bytes([header[0], header[1]]);
    let track_count = u16::from_be_bytes([header[2], header[3]]);
    let division = i16::from_be_bytes([header[4], header[5]]);
    if format > 1 {
        return Err(SequencerError::UnsupportedFormat(format!("SMF format {format}")));
    }
    if division <= 0 {
        return Err(SequencerError::UnsupportedFormat("SMPTE time division".into()));
    }

    let mut seq = Sequence::new(i64::from(division));
    let mut report = SmfReport {
        format,
        ..SmfReport::default()
    };
    let mut remaining = track_count;
    while remaining > 0 && !reader.is_at_end() {
        let tag = reader.read_bytes(4)?;
        let size = reader.read_u32()? as usize;
        let body = reader.read_bytes(size)?;
        if tag != TRACK_TAG {
            tracing::debug!(tag = %String::from_utf8_lossy(tag), size, "skipping unknown chunk");
            report.skipped_chunks += 1;
            continue;
        }
        let track = read_track(body, &mut report)?;
        seq.insert_track(-1, track)?;
        remaining -= 1;
    }
    if remaining > 0 {
        tracing::warn!(missing = remaining, "file ends before all declared tracks");
    }
    tracing::debug!(
        format,
        tracks = seq.track_count(),
        timebase = seq.timebase(),
        "standard MIDI file read"
    );
    Ok((seq, report))
}

pub fn read_smf_file(path: &Path) -> SeqResult<(Sequence, SmfReport)> {
    let data = std::fs::read(path)?;
    read_smf(&data)
}

fn read_meta(tick: Tick, code: u8, data: &[u8]) -> SeqResult<Event> {
    // Fixed-size metas are zero-padded; eight bytes or more is malformed
    let fixed = || -> SeqResult<[u8; 8]> {
        if data.len() >= 8 {
            return Err(SequencerError::WrongMetaEvent(code));
        }
        let mut s = [0u8; 8];
        s[..data.len()].copy_from_slice(data);
        Ok(s)
    };
    let message = match code {
        meta::PORT_NUMBER => Message::PortNumber(fixed()?[0]),
        meta::TEMPO => {
            let s = fixed()?;
            let micros = (u32::from(s[0]) << 16) | (u32::from(s[1]) << 8) | u32::from(s[2]);
            Message::Tempo(Tempo::from_micros_per_quarter(micros))
        }
        meta::SMPTE => {
            let s = fixed()?;
            Message::Smpte([s[0], s[1], s[2], s[3], s[4]])
        }
        meta::TIME_SIGNATURE => {
            let s = fixed()?;
            Message::TimeSignature(TimeSignature::from_bytes([s[0], s[1], s[2], s[3]]))
        }
        meta::KEY => {
            let s = fixed()?;
            Message::Key {
                sharps: s[0] as i8,
                minor: s[1] != 0,
            }
        }
        code if meta::is_text(code) => Message::MetaText {
            code,
            text: Payload::from(data),
        },
        code => Message::MetaMessage {
            code,
            data: Payload::from(data),
        },
    };
    Ok(Event::new(tick, META_CHANNEL, message))
}

fn read_track(body: &[u8], report: &mut SmfReport) -> SeqResult<Track> {
    let mut reader = SmfReader::new(body);
    let mut track = Track::new();
    let mut tick: Tick = 0;
    let mut running_status: u8 = 0;
    let mut pending_duration: Tick = 0;
    let mut name: Option<String> = None;
    let mut device_name: Option<String> = None;
    let mut end_of_track = false;

    while !reader.is_at_end() {
        tick = (tick + Tick::from(reader.read_var_len()?)).min(MAX_TICK);
        let first = reader.read_u8()?;
        let event = match first {
            0xf0 => {
                let len = reader.read_var_len()? as usize;
                let mut bytes = Vec::with_capacity(len + 1);
                bytes.push(0xf0);
                bytes.extend_from_slice(reader.read_bytes(len)?);
                Event::new(tick, SYSEX_CHANNEL, Message::Sysex(Payload::new(bytes)))
            }
            0xf7 => {
                let len = reader.read_var_len()? as usize;
                let bytes = reader.read_bytes(len)?;
                Event::new(tick, SYSEX_CHANNEL, Message::SysexCont(Payload::from(bytes)))
            }
            0xff => {
                let code = reader.read_u8()?;
                let len = reader.read_var_len()? as usize;
                let data = reader.read_bytes(len)?;
                match code {
                    meta::END_OF_TRACK => {
                        end_of_track = true;
                        break;
                    }
                    meta::DURATION => {
                        pending_duration = decode_var_len(data);
                        continue;
                    }
                    meta::SEQUENCE_NAME if name.is_none() => {
                        name = Some(String::from_utf8_lossy(data).into_owned());
                        pending_duration = 0;
                        continue;
                    }
                    meta::DEVICE_NAME if device_name.is_none() => {
                        device_name = Some(String::from_utf8_lossy(data).into_owned());
                        pending_duration = 0;
                        continue;
                    }
                    _ => read_meta(tick, code, data)?,
                }
            }
            _ => {
                let (status, data_start) = if first < 0x80 {
                    (running_status, Some(first))
                } else {
                    running_status = first;
                    (first, None)
                };
                let len = channel_message_data_len(status).ok_or(SequencerError::UnknownChannelEvent(status))?;
                let mut data = [0u8; 2];
                let mut filled = 0;
                if let Some(byte) = data_start {
                    data[0] = byte;
                    filled = 1;
                }
                while filled < len {
                    data[filled] = reader.read_u8()?;
                    filled += 1;
                }
                let message = decode_channel_message(status, &data[..len])?;
                Event::new(tick, status & 0x0f, message)
            }
        };

        match event.message {
            Message::NoteOff { key, velocity } => {
                match track.match_note_off(event.tick, event.channel, key, velocity) {
                    Ok(()) => {}
                    Err(SequencerError::OrphanedNoteOff { tick, code, channel }) => {
                        tracing::warn!(tick, key = code, channel, "orphaned note-off skipped");
                        report.orphaned_note_offs += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Message::NoteOn { key, velocity, .. } => {
                let event = Event::new(
                    event.tick,
                    event.channel,
                    Message::NoteOn {
                        key,
                        velocity,
                        duration: pending_duration,
                    },
                );
                track.append_events(std::iter::once(event))?;
            }
            _ => {
                track.append_events(std::iter::once(event))?;
            }
        }
        pending_duration = 0;
    }
    if !end_of_track {
        tracing::warn!(tick, "track chunk ends without end-of-track");
    }

    report.unterminated_notes += close_open_notes(&mut track)?;
    track.set_duration(tick);
    match name {
        Some(name) if !name.is_empty() => track.set_name(name),
        _ => {
            if let Some(guess) = track.guess_name() {
                track.set_name(guess);
            }
        }
    }
    match device_name {
        Some(device) if !device.is_empty() => track.set_device_name(device),
        _ => {
            if let Some(guess) = track.guess_device_name() {
                track.set_device_name(guess);
            }
        }
    }
    Ok(track)
}

/// Note-ons left without a note-off become notes of their expected duration
/// (zero when none was given)
fn close_open_notes(track: &mut Track) -> SeqResult<usize> {
    let positions = track.search_events(|e| matches!(e.message, Message::NoteOn { .. }));
    if positions.is_empty() {
        return Ok(0);
    }
    let cursor = track.new_cursor();
    for &position in &positions {
        track.set_position(cursor, position);
        let Some(event) = track.current(cursor).cloned() else {
            continue;
        };
        if let Message::NoteOn {
            key,
            velocity,
            duration,
        } = event.message
        {
            tracing::debug!(tick = event.tick, key, channel = event.channel, "note-on without note-off");
            let note = Event::new(
                event.tick,
                event.channel,
                Message::Note {
                    key,
                    on_velocity: velocity,
                    off_velocity: 0,
                    duration,
                },
            );
            track.replace_event(cursor, note)?;
        }
    }
    track.release_cursor(cursor);
    Ok(positions.len())
}

/// Track body being written; delta times are taken against `tick`
struct TrackWriter {
    buf: Vec<u8>,
    tick: Tick,
}

impl TrackWriter {
    fn delta(&mut self, tick: Tick) {
        let delta = (tick - self.tick).max(0);
        write_var_len(&mut self.buf, delta.min(Tick::from(u32::MAX >> 4)) as u32);
        self.tick += delta;
    }

    fn meta(&mut self, tick: Tick, code: u8, data: &[u8]) {
        self.delta(tick);
        self.buf.extend_from_slice(&[0xff, code]);
        write_var_len(&mut self.buf, data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    fn channel(&mut self, tick: Tick, event: &Event, track_channel: Option<u8>) -> SeqResult<()> {
        let message = event
            .to_midi_message()
            .ok_or_else(|| SequencerError::UnknownChannelEvent(event.code().unwrap_or(0)))?;
        let mut bytes = [0u8; 3];
        let len = message.as_bytes().len();
        bytes[..len].copy_from_slice(message.as_bytes());
        if let Some(channel) = track_channel {
            bytes[0] = (bytes[0] & 0xf0) | (channel & 0x0f);
        }
        self.delta(tick);
        self.buf.extend_from_slice(&bytes[..len]);
        Ok(())
    }
}

fn meta_payload(event: &Event) -> Option<(u8, Vec<u8>)> {
    let data = match &event.message {
        Message::MetaText { code, text } => return Some((*code, text.as_bytes().to_vec())),
        Message::MetaMessage { code, data } => return Some((*code, data.as_bytes().to_vec())),
        Message::Tempo(tempo) => {
            let micros = tempo.micros_per_quarter().min(0x00ff_ffff);
            (meta::TEMPO, micros.to_be_bytes()[1..].to_vec())
        }
        Message::TimeSignature(signature) => (meta::TIME_SIGNATURE, signature.to_bytes().to_vec()),
        Message::Key { sharps, minor } => (meta::KEY, vec![*sharps as u8, u8::from(*minor)]),
        Message::Smpte(smpte) => (meta::SMPTE, smpte.to_vec()),
        Message::PortNumber(port) => (meta::PORT_NUMBER, vec![*port]),
        _ => return None,
    };
    Some(data)
}

fn encode_track(track: &Track, track_channel: Option<u8>) -> SeqResult<Vec<u8>> {
    let mut w = TrackWriter {
        buf: Vec::new(),
        tick: 0,
    };
    w.meta(0, meta::SEQUENCE_NAME, track.name().as_bytes());
    w.meta(0, meta::DEVICE_NAME, track.device_name().as_bytes());

    let mut note_offs = Track::new();
    let off_cursor = note_offs.new_cursor();

    for event in track.iter() {
        // Pending note-offs due at or before this event go first
        while let Some(off) = note_offs.event_at(0).filter(|off| off.tick <= event.tick).cloned() {
            w.channel(off.tick, &off, track_channel)?;
            note_offs.set_position(off_cursor, 0);
            note_offs.delete_event(off_cursor)?;
        }

        match &event.message {
            Message::Null
            | Message::Stop
            | Message::Special(_)
            | Message::Duration(_) => {}
            Message::Sysex(payload) => {
                let bytes = payload.as_bytes();
                let body = bytes.strip_prefix(&[0xf0_u8]).unwrap_or(bytes);
                w.delta(event.tick);
                w.buf.push(0xf0);
                write_var_len(&mut w.buf, body.len() as u32);
                w.buf.extend_from_slice(body);
            }
            Message::SysexCont(payload) => {
                w.delta(event.tick);
                w.buf.push(0xf7);
                write_var_len(&mut w.buf, payload.len() as u32);
                w.buf.extend_from_slice(payload.as_bytes());
            }
            Message::Note {
                key,
                off_velocity,
                duration,
                ..
            } => {
                let ambiguous = note_offs.iter().any(|off| {
                    off.channel == event.channel && matches!(off.message, Message::NoteOff { key: k, .. } if k == *key)
                });
                if ambiguous {
                    let mut ber = Vec::with_capacity(5);
                    write_var_len(&mut ber, (*duration).clamp(0, MAX_TICK) as u32);
                    w.meta(event.tick, meta::DURATION, &ber);
                }
                w.channel(event.tick, event, track_channel)?;
                let off_tick = (event.tick + (*duration).max(0)).min(MAX_TICK);
                let off = Event::new(
                    off_tick,
                    event.channel,
                    Message::NoteOff {
                        key: *key,
                        velocity: *off_velocity,
                    },
                );
                note_offs.jump_to_tick(off_cursor, off_tick + 1);
                note_offs.insert_event(off_cursor, off)?;
            }
            _ => {
                if let Some((code, data)) = meta_payload(event) {
                    w.meta(event.tick, code, &data);
                } else {
                    w.channel(event.tick, event, track_channel)?;
                }
            }
        }
    }
    for off in note_offs.iter() {
        w.channel(off.tick, off, track_channel)?;
    }
    let end = track.duration().max(w.tick);
    w.meta(end, meta::END_OF_TRACK, &[]);
    Ok(w.buf)
}

/// Writes `seq` as format 0 (one track) or format 1
pub fn write_smf<W: Write>(seq: &Sequence, out: &mut W) -> SeqResult<()> {
    let track_count = u16::try_from(seq.track_count())
        .map_err(|_| SequencerError::BadParameter("too many tracks for a MIDI file".into()))?;
    let timebase = u16::try_from(seq.timebase())
        .ok()
        .filter(|&t| t > 0 && t <= 0x7fff)
        .ok_or_else(|| SequencerError::BadParameter(format!("timebase {}", seq.timebase())))?;
    let format: u16 = if track_count == 1 { 0 } else { 1 };

    out.write_all(HEADER_TAG)?;
    out.write_all(&6u32.to_be_bytes())?;
    out.write_all(&format.to_be_bytes())?;
    out.write_all(&track_count.to_be_bytes())?;
    out.write_all(&timebase.to_be_bytes())?;

    let single_channel = seq.is_single_channel_mode();
    for track in seq.tracks() {
        let channel = single_channel.then(|| track.track_channel());
        let body = encode_track(track, channel)?;
        out.write_all(TRACK_TAG)?;
        out.write_all(&(body.len() as u32).to_be_bytes())?;
        out.write_all(&body)?;
    }
    tracing::debug!(format, tracks = track_count, "standard MIDI file written");
    Ok(())
}

pub fn write_smf_file(seq: &Sequence, path: &Path) -> SeqResult<()> {
    let mut buf = Vec::new();
    write_smf(seq, &mut buf)?;
    std::fs::write(path, buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn header(format: u16, tracks: u16, division: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&format.to_be_bytes());
        body.extend_from_slice(&tracks.to_be_bytes());
        body.extend_from_slice(&division.to_be_bytes());
        chunk(HEADER_TAG, &body)
    }

    #[test]
    fn test_var_len() {
        for (value, bytes) in [
            (0u32, vec![0x00]),
            (0x40, vec![0x40]),
            (0x7f, vec![0x7f]),
            (0x80, vec![0x81, 0x00]),
            (0x2000, vec![0xc0, 0x00]),
            (0x0fff_ffff, vec![0xff, 0xff, 0xff, 0x7f]),
        ] {
            let mut out = Vec::new();
            write_var_len(&mut out, value);
            assert_eq!(out, bytes);
            assert_eq!(SmfReader::new(&bytes).read_var_len().unwrap(), value);
        }
    }

    #[test]
    fn test_read_running_status_and_note_pairing() {
        let body = [
            0x00, 0x90, 60, 100, // note on
            0x00, 64, 90, // running status
            0x83, 0x60, 60, 0, // 480: note on vel 0 = off
            0x00, 0x80, 64, 0, // 480: off
            0x00, 0xff, 0x2f, 0x00,
        ];
        let mut file = header(0, 1, 480);
        file.extend(chunk(TRACK_TAG, &body));
        let (seq, report) = read_smf(&file).unwrap();
        assert_eq!(report.format, 0);
        assert_eq!(report.orphaned_note_offs, 0);
        let track = seq.track(0).unwrap();
        let notes: Vec<(u8, Tick)> = track
            .iter()
            .filter_map(|e| match e.message {
                Message::Note { key, duration, .. } => Some((key, duration)),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec![(60, 480), (64, 480)]);
        assert_eq!(track.duration(), 481);
    }

    #[test]
    fn test_orphaned_note_off_is_counted() {
        let body = [0x00, 0x80, 60, 0, 0x00, 0xff, 0x2f, 0x00];
        let mut file = header(0, 1, 96);
        file.extend(chunk(TRACK_TAG, &body));
        let (seq, report) = read_smf(&file).unwrap();
        assert_eq!(report.orphaned_note_offs, 1);
        assert_eq!(seq.track(0).unwrap().number_of_events(), 0);
    }

    #[test]
    fn test_names_and_unknown_chunks() {
        let mut body = vec![0x00, 0xff, 0x03, 4];
        body.extend_from_slice(b"Bass");
        body.extend_from_slice(&[0x00, 0xff, 0x09, 3]);
        body.extend_from_slice(b"Out");
        body.extend_from_slice(&[0x00, 0xff, 0x2f, 0x00]);
        let mut file = header(1, 1, 480);
        file.extend(chunk(b"XFIH", &[1, 2, 3]));
        file.extend(chunk(TRACK_TAG, &body));
        let (seq, report) = read_smf(&file).unwrap();
        assert_eq!(report.skipped_chunks, 1);
        let track = seq.track(0).unwrap();
        assert_eq!(track.name(), "Bass");
        assert_eq!(track.device_name(), "Out");
        assert_eq!(track.number_of_events(), 0);
    }

    #[test]
    fn test_header_errors() {
        assert!(matches!(
            read_smf(b"RIFF\0\0\0\x06\0\0\0\x01\x01\xe0"),
            Err(SequencerError::HeaderChunkNotFound)
        ));
        assert!(matches!(
            read_smf(&header(2, 1, 480)),
            Err(SequencerError::UnsupportedFormat(_))
        ));
        let mut truncated = header(0, 1, 480);
        truncated.extend(chunk(TRACK_TAG, &[0x00, 0x90, 60]));
        assert!(matches!(read_smf(&truncated), Err(SequencerError::UnexpectedEof)));
    }

    #[test]
    fn test_bad_meta_length() {
        let body = [0x00, 0xff, 0x51, 0x08, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut file = header(0, 1, 480);
        file.extend(chunk(TRACK_TAG, &body));
        assert!(matches!(read_smf(&file), Err(SequencerError::WrongMetaEvent(0x51))));
    }

    #[test]
    fn test_write_header_format() {
        let mut seq = Sequence::new(480);
        seq.insert_track(-1, Track::new()).unwrap();
        let mut out = Vec::new();
        write_smf(&seq, &mut out).unwrap();
        assert_eq!(&out[..4], HEADER_TAG);
        assert_eq!(&out[8..14], &[0, 0, 0, 1, 0x01, 0xe0]);

        seq.insert_track(-1, Track::new()).unwrap();
        let mut out = Vec::new();
        write_smf(&seq, &mut out).unwrap();
        assert_eq!(&out[8..10], &[0, 1]);
    }

    #[test]
    fn test_sysex_written_without_leading_f0() {
        let track = Track::from_events(vec![Event::sysex(0, &[0xf0, 0x7e, 0x7f, 0xf7])]).unwrap();
        let body = encode_track(&track, None).unwrap();
        // name and device metas: 00 FF 03 00, 00 FF 09 00
        assert_eq!(&body[8..14], &[0x00, 0xf0, 0x03, 0x7e, 0x7f, 0xf7]);
    }

    #[test]
    fn test_duration_meta_only_when_ambiguous() {
        let plain = Track::from_events(vec![Event::note(0, 0, 60, 100, 100), Event::note(200, 0, 60, 100, 100)]).unwrap();
        let body = encode_track(&plain, None).unwrap();
        assert!(!body.windows(2).any(|w| w == [0xff, meta::DURATION]));

        let overlapping =
            Track::from_events(vec![Event::note(0, 0, 60, 100, 1000), Event::note(100, 0, 60, 100, 100)]).unwrap();
        let body = encode_track(&overlapping, None).unwrap();
        assert!(body.windows(4).any(|w| w == [0xff, meta::DURATION, 0x01, 100]));
    }

    #[test]
    fn test_single_channel_mode_forces_channel() {
        let mut track = Track::from_events(vec![Event::program(0, 5, 3)]).unwrap();
        track.set_track_channel(2);
        let body = encode_track(&track, Some(track.track_channel())).unwrap();
        assert_eq!(&body[8..11], &[0x00, 0xc2, 3]);
    }
}
