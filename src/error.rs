// Sequencer error types

use crate::midi::event::Tick;

/// Errors surfaced by the sequence engine, the file codecs and the player
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Bad index: {0}")]
    BadIndex(i64),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Orphaned note-off at tick {tick} (key {code}, channel {channel})")]
    OrphanedNoteOff { tick: Tick, code: u8, channel: u8 },

    #[error("Tick disorder at position {position} (tick {tick})")]
    TickDisorder { position: i64, tick: Tick },

    #[error("Transport error on destination {destination}: {message}")]
    Transport { destination: usize, message: String },

    #[error("Cannot set up MIDI device: {0}")]
    CannotSetupDevice(String),

    #[error("Unexpected end of file")]
    UnexpectedEof,

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Header chunk not found")]
    HeaderChunkNotFound,

    #[error("Malformed meta event 0x{0:02X}")]
    WrongMetaEvent(u8),

    #[error("Unknown channel event 0x{0:02X}")]
    UnknownChannelEvent(u8),

    #[error("Sequence is locked by another thread")]
    SequenceLocked,

    #[error("Another track is already recording")]
    AlreadyRecording,

    #[error("Cannot start playing: {0}")]
    CannotStartPlaying(String),

    #[error("Inconsistent cursor: {0}")]
    InconsistentCursor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<ron::Error> for SequencerError {
    fn from(err: ron::Error) -> Self {
        SequencerError::Config(err.to_string())
    }
}

impl From<ron::error::SpannedError> for SequencerError {
    fn from(err: ron::error::SpannedError) -> Self {
        SequencerError::Config(err.to_string())
    }
}

pub type SeqResult<T> = Result<T, SequencerError>;
