// MIDI event model and byte-level message codec

use crate::error::{SeqResult, SequencerError};
use crate::sequencer::timeline::{Tempo, TimeSignature};
use std::sync::Arc;

/// Absolute position in a track, `timebase` ticks per quarter note
pub type Tick = i64;

/// Largest tick an event may carry
pub const MAX_TICK: Tick = 0x7fff_fff0;

/// "Before the first event" sentinel
pub const NEGATIVE_TICK: Tick = -1;

/// Channel value stored on system exclusive events
pub const SYSEX_CHANNEL: u8 = 16;

/// Channel value stored on meta and internal events
pub const META_CHANNEL: u8 = 17;

/// Standard MIDI file meta event codes
pub mod meta {
    pub const SEQUENCE_NUMBER: u8 = 0x00;
    pub const TEXT: u8 = 0x01;
    pub const COPYRIGHT: u8 = 0x02;
    pub const SEQUENCE_NAME: u8 = 0x03;
    pub const INSTRUMENT_NAME: u8 = 0x04;
    pub const LYRIC: u8 = 0x05;
    pub const MARKER: u8 = 0x06;
    pub const CUE_POINT: u8 = 0x07;
    pub const PROGRAM_NAME: u8 = 0x08;
    pub const DEVICE_NAME: u8 = 0x09;
    pub const CHANNEL_PREFIX: u8 = 0x20;
    pub const PORT_NUMBER: u8 = 0x21;
    pub const END_OF_TRACK: u8 = 0x2f;
    pub const TEMPO: u8 = 0x51;
    pub const SMPTE: u8 = 0x54;
    pub const TIME_SIGNATURE: u8 = 0x58;
    pub const KEY: u8 = 0x59;
    /// Private: exact duration of the following note-on
    pub const DURATION: u8 = 0x7e;
    pub const SEQUENCER_SPECIFIC: u8 = 0x7f;

    /// Text metas occupy codes 0x01..=0x0F
    pub fn is_text(code: u8) -> bool {
        (TEXT..=0x0f).contains(&code)
    }
}

/// Reference-counted byte buffer shared between event copies.
/// Writers go through [`Payload::make_mut`], which copies on first mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(Arc<Vec<u8>>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mutable access; detaches from other holders first
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.0)
    }

    /// True when another event copy shares this buffer
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

/// Player-internal markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCode {
    EndOfSequence,
    StopPlaying,
}

/// Kind-specific content of an event
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Null,
    Tempo(Tempo),
    TimeSignature(TimeSignature),
    Key { sharps: i8, minor: bool },
    Smpte([u8; 5]),
    PortNumber(u8),
    MetaText { code: u8, text: Payload },
    MetaMessage { code: u8, data: Payload },
    Program(u8),
    Note { key: u8, on_velocity: u8, off_velocity: u8, duration: Tick },
    /// Unpaired note-off, only alive while a stream is being ingested
    NoteOff { key: u8, velocity: u8 },
    /// Unpaired note-on; a non-zero duration is the expected one
    NoteOn { key: u8, velocity: u8, duration: Tick },
    /// Expected duration of the note-on that follows
    Duration(Tick),
    Control { controller: u8, value: u8 },
    /// Centred at zero, -8192..=8191
    PitchBend(i16),
    ChannelPressure(u8),
    KeyPressure { key: u8, value: u8 },
    /// Complete system exclusive message, starting with 0xF0
    Sysex(Payload),
    SysexCont(Payload),
    Special(SpecialCode),
    Stop,
}

/// Fieldless mirror of [`Message`] used by filters and selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Null,
    Tempo,
    TimeSignature,
    Key,
    Smpte,
    PortNumber,
    MetaText,
    MetaMessage,
    Program,
    Note,
    InternalNoteOff,
    InternalNoteOn,
    InternalDuration,
    Control,
    PitchBend,
    ChannelPressure,
    KeyPressure,
    Sysex,
    SysexCont,
    Special,
    Stop,
}

impl EventKind {
    pub fn is_channel_kind(self) -> bool {
        matches!(
            self,
            EventKind::Program
                | EventKind::Note
                | EventKind::InternalNoteOff
                | EventKind::InternalNoteOn
                | EventKind::Control
                | EventKind::PitchBend
                | EventKind::ChannelPressure
                | EventKind::KeyPressure
        )
    }

    pub fn is_meta_kind(self) -> bool {
        matches!(
            self,
            EventKind::Tempo
                | EventKind::TimeSignature
                | EventKind::Key
                | EventKind::Smpte
                | EventKind::PortNumber
                | EventKind::MetaText
                | EventKind::MetaMessage
        )
    }
}

/// A 1..3 byte channel voice message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiMessage {
    bytes: [u8; 3],
    len: u8,
}

impl MidiMessage {
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(3);
        let mut buf = [0u8; 3];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            bytes: buf,
            len: len as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }
}

/// One time-stamped item of a track
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub tick: Tick,
    pub channel: u8,
    pub message: Message,
}

impl Event {
    pub fn new(tick: Tick, channel: u8, message: Message) -> Self {
        Self {
            tick,
            channel,
            message,
        }
    }

    /// Blank slot, as produced by `insert_blanks`
    pub fn null(tick: Tick) -> Self {
        Self::new(tick, META_CHANNEL, Message::Null)
    }

    pub fn note(tick: Tick, channel: u8, key: u8, velocity: u8, duration: Tick) -> Self {
        Self::new(
            tick,
            channel & 0x0f,
            Message::Note {
                key,
                on_velocity: velocity,
                off_velocity: 0,
                duration,
            },
        )
    }

    pub fn control(tick: Tick, channel: u8, controller: u8, value: u8) -> Self {
        Self::new(tick, channel & 0x0f, Message::Control { controller, value })
    }

    pub fn program(tick: Tick, channel: u8, program: u8) -> Self {
        Self::new(tick, channel & 0x0f, Message::Program(program))
    }

    pub fn pitch_bend(tick: Tick, channel: u8, value: i16) -> Self {
        Self::new(tick, channel & 0x0f, Message::PitchBend(value.clamp(-8192, 8191)))
    }

    pub fn tempo(tick: Tick, bpm: f32) -> Self {
        Self::new(tick, META_CHANNEL, Message::Tempo(Tempo::new(bpm)))
    }

    pub fn time_signature(tick: Tick, signature: TimeSignature) -> Self {
        Self::new(tick, META_CHANNEL, Message::TimeSignature(signature))
    }

    pub fn meta_text(tick: Tick, code: u8, text: &str) -> Self {
        Self::new(
            tick,
            META_CHANNEL,
            Message::MetaText {
                code,
                text: Payload::from(text),
            },
        )
    }

    /// `bytes` must include the leading 0xF0
    pub fn sysex(tick: Tick, bytes: &[u8]) -> Self {
        Self::new(tick, SYSEX_CHANNEL, Message::Sysex(Payload::from(bytes)))
    }

    pub fn special(tick: Tick, code: SpecialCode) -> Self {
        Self::new(tick, META_CHANNEL, Message::Special(code))
    }

    pub fn kind(&self) -> EventKind {
        match &self.message {
            Message::Null => EventKind::Null,
            Message::Tempo(_) => EventKind::Tempo,
            Message::TimeSignature(_) => EventKind::TimeSignature,
            Message::Key { .. } => EventKind::Key,
            Message::Smpte(_) => EventKind::Smpte,
            Message::PortNumber(_) => EventKind::PortNumber,
            Message::MetaText { .. } => EventKind::MetaText,
            Message::MetaMessage { .. } => EventKind::MetaMessage,
            Message::Program(_) => EventKind::Program,
            Message::Note { .. } => EventKind::Note,
            Message::NoteOff { .. } => EventKind::InternalNoteOff,
            Message::NoteOn { .. } => EventKind::InternalNoteOn,
            Message::Duration(_) => EventKind::InternalDuration,
            Message::Control { .. } => EventKind::Control,
            Message::PitchBend(_) => EventKind::PitchBend,
            Message::ChannelPressure(_) => EventKind::ChannelPressure,
            Message::KeyPressure { .. } => EventKind::KeyPressure,
            Message::Sysex(_) => EventKind::Sysex,
            Message::SysexCont(_) => EventKind::SysexCont,
            Message::Special(_) => EventKind::Special,
            Message::Stop => EventKind::Stop,
        }
    }

    /// Secondary key: note number, controller number or meta code
    pub fn code(&self) -> Option<u8> {
        match &self.message {
            Message::Note { key, .. }
            | Message::NoteOn { key, .. }
            | Message::NoteOff { key, .. }
            | Message::KeyPressure { key, .. } => Some(*key),
            Message::Control { controller, .. } => Some(*controller),
            Message::MetaText { code, .. } | Message::MetaMessage { code, .. } => Some(*code),
            Message::Tempo(_) => Some(meta::TEMPO),
            Message::TimeSignature(_) => Some(meta::TIME_SIGNATURE),
            Message::Key { .. } => Some(meta::KEY),
            Message::Smpte(_) => Some(meta::SMPTE),
            Message::PortNumber(_) => Some(meta::PORT_NUMBER),
            _ => None,
        }
    }

    pub fn is_channel_event(&self) -> bool {
        self.kind().is_channel_kind()
    }

    pub fn is_meta(&self) -> bool {
        self.kind().is_meta_kind()
    }

    pub fn is_sysex(&self) -> bool {
        matches!(self.message, Message::Sysex(_) | Message::SysexCont(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.message, Message::Null)
    }

    /// Counter slot: 0..=15 channel events, 16 sysex, 17 everything else.
    /// Blank slots are not counted.
    pub fn channel_slot(&self) -> Option<usize> {
        if self.is_null() {
            None
        } else if self.is_channel_event() {
            Some((self.channel & 0x0f) as usize)
        } else if self.is_sysex() {
            Some(16)
        } else {
            Some(17)
        }
    }

    pub fn duration(&self) -> Tick {
        match self.message {
            Message::Note { duration, .. }
            | Message::NoteOn { duration, .. }
            | Message::Duration(duration) => duration,
            _ => 0,
        }
    }

    pub fn has_duration(&self) -> bool {
        matches!(
            self.message,
            Message::Note { .. } | Message::NoteOn { .. } | Message::Duration(_)
        )
    }

    pub fn set_duration(&mut self, value: Tick) {
        match &mut self.message {
            Message::Note { duration, .. }
            | Message::NoteOn { duration, .. }
            | Message::Duration(duration) => *duration = value,
            _ => {}
        }
    }

    /// Last tick covered by this event
    pub fn end_tick(&self) -> Tick {
        self.tick + self.duration().max(0)
    }

    /// Channel voice bytes for this event, or `None` for events that are not
    /// sent as a short message (meta, sysex, internal).
    pub fn to_midi_message(&self) -> Option<MidiMessage> {
        let ch = self.channel & 0x0f;
        let bytes = match self.message {
            Message::Note {
                key, on_velocity, ..
            } => [0x90 | ch, key & 0x7f, on_velocity & 0x7f],
            Message::NoteOn { key, velocity, .. } => [0x90 | ch, key & 0x7f, velocity & 0x7f],
            Message::NoteOff { key, velocity } => [0x80 | ch, key & 0x7f, velocity & 0x7f],
            Message::KeyPressure { key, value } => [0xa0 | ch, key & 0x7f, value & 0x7f],
            Message::Control { controller, value } => {
                [0xb0 | ch, controller & 0x7f, value & 0x7f]
            }
            Message::Program(program) => {
                return Some(MidiMessage::new(&[0xc0 | ch, program & 0x7f]));
            }
            Message::ChannelPressure(value) => {
                return Some(MidiMessage::new(&[0xd0 | ch, value & 0x7f]));
            }
            Message::PitchBend(value) => {
                let v = i32::from(value) + 8192;
                [0xe0 | ch, (v & 0x7f) as u8, ((v >> 7) & 0x7f) as u8]
            }
            _ => return None,
        };
        Some(MidiMessage::new(&bytes))
    }

    /// Decodes one complete channel voice message (status byte included).
    /// Note-on with velocity 0 is a note-off.
    pub fn from_midi_message(tick: Tick, bytes: &[u8]) -> SeqResult<Self> {
        let status = *bytes.first().ok_or(SequencerError::UnexpectedEof)?;
        let len = channel_message_data_len(status)
            .ok_or(SequencerError::UnknownChannelEvent(status))?;
        if bytes.len() < len + 1 {
            return Err(SequencerError::UnexpectedEof);
        }
        let message = decode_channel_message(status, &bytes[1..=len])?;
        Ok(Self::new(tick, status & 0x0f, message))
    }
}

/// Number of data bytes following a channel status byte
pub fn channel_message_data_len(status: u8) -> Option<usize> {
    match status & 0xf0 {
        0x80 | 0x90 | 0xa0 | 0xb0 | 0xe0 => Some(2),
        0xc0 | 0xd0 => Some(1),
        _ => None,
    }
}

/// Decodes the data bytes of a channel voice message whose status is already
/// known (running status resolved by the caller)
pub fn decode_channel_message(status: u8, data: &[u8]) -> SeqResult<Message> {
    let d0 = data.first().copied().unwrap_or(0) & 0x7f;
    let d1 = data.get(1).copied().unwrap_or(0) & 0x7f;
    let message = match status & 0xf0 {
        0x80 => Message::NoteOff {
            key: d0,
            velocity: d1,
        },
        0x90 if d1 == 0 => Message::NoteOff {
            key: d0,
            velocity: 0,
        },
        0x90 => Message::NoteOn {
            key: d0,
            velocity: d1,
            duration: 0,
        },
        0xa0 => Message::KeyPressure { key: d0, value: d1 },
        0xb0 => Message::Control {
            controller: d0,
            value: d1,
        },
        0xc0 => Message::Program(d0),
        0xd0 => Message::ChannelPressure(d0),
        0xe0 => Message::PitchBend((i16::from(d0) + (i16::from(d1) << 7)) - 8192),
        _ => return Err(SequencerError::UnknownChannelEvent(status)),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on() {
        let event = Event::from_midi_message(0, &[0x90, 60, 100]).unwrap();

        match event.message {
            Message::NoteOn { key, velocity, .. } => {
                assert_eq!(key, 60);
                assert_eq!(velocity, 100);
            }
            _ => panic!("Expected NoteOn event"),
        }
        assert_eq!(event.channel, 0);
    }

    #[test]
    fn test_note_off_velocity_zero() {
        let event = Event::from_midi_message(0, &[0x93, 64, 0]).unwrap();

        match event.message {
            Message::NoteOff { key, .. } => assert_eq!(key, 64),
            _ => panic!("Expected NoteOff event (velocity 0)"),
        }
        assert_eq!(event.channel, 3);
    }

    #[test]
    fn test_pitch_bend_centre() {
        let event = Event::from_midi_message(0, &[0xE0, 0x00, 0x40]).unwrap();

        match event.message {
            Message::PitchBend(value) => assert_eq!(value, 0),
            _ => panic!("Expected PitchBend event"),
        }

        let extreme = Event::from_midi_message(0, &[0xE0, 0x7f, 0x7f]).unwrap();
        assert_eq!(extreme.message, Message::PitchBend(8191));
    }

    #[test]
    fn test_pitch_bend_encoding() {
        let bytes = Event::pitch_bend(0, 2, -8192).to_midi_message().unwrap();
        assert_eq!(bytes.as_bytes(), &[0xE2, 0x00, 0x00]);

        let bytes = Event::pitch_bend(0, 0, 100).to_midi_message().unwrap();
        let decoded = Event::from_midi_message(0, bytes.as_bytes()).unwrap();
        assert_eq!(decoded.message, Message::PitchBend(100));
    }

    #[test]
    fn test_two_byte_messages() {
        let program = Event::program(0, 5, 42).to_midi_message().unwrap();
        assert_eq!(program.as_bytes(), &[0xC5, 42]);

        let decoded = Event::from_midi_message(10, &[0xD1, 99]).unwrap();
        assert_eq!(decoded.message, Message::ChannelPressure(99));
        assert_eq!(decoded.tick, 10);
    }

    #[test]
    fn test_invalid_messages() {
        assert!(matches!(
            Event::from_midi_message(0, &[]),
            Err(SequencerError::UnexpectedEof)
        ));
        assert!(matches!(
            Event::from_midi_message(0, &[0x90, 60]),
            Err(SequencerError::UnexpectedEof)
        ));
        assert!(matches!(
            Event::from_midi_message(0, &[0xF0, 0x00, 0x00]),
            Err(SequencerError::UnknownChannelEvent(0xF0))
        ));
    }

    #[test]
    fn test_channel_slots() {
        assert_eq!(Event::note(0, 9, 36, 100, 10).channel_slot(), Some(9));
        assert_eq!(Event::sysex(0, &[0xF0, 0x7E, 0xF7]).channel_slot(), Some(16));
        assert_eq!(Event::tempo(0, 120.0).channel_slot(), Some(17));
        assert_eq!(Event::null(0).channel_slot(), None);
    }

    #[test]
    fn test_payload_copy_on_write() {
        let original = Event::sysex(0, &[0xF0, 0x41, 0xF7]);
        let mut copy = original.clone();

        if let Message::Sysex(payload) = &copy.message {
            assert!(payload.is_shared());
        }
        if let Message::Sysex(payload) = &mut copy.message {
            payload.make_mut()[1] = 0x43;
            assert!(!payload.is_shared());
        }

        match (&original.message, &copy.message) {
            (Message::Sysex(a), Message::Sysex(b)) => {
                assert_eq!(a.as_bytes(), &[0xF0, 0x41, 0xF7]);
                assert_eq!(b.as_bytes(), &[0xF0, 0x43, 0xF7]);
            }
            _ => panic!("Expected Sysex events"),
        }
    }

    #[test]
    fn test_end_tick() {
        let note = Event::note(100, 0, 60, 90, 240);
        assert_eq!(note.end_tick(), 340);
        assert!(note.has_duration());
        assert_eq!(Event::control(100, 0, 7, 100).end_tick(), 100);
    }
}
