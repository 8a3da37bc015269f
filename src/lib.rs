// MyMusic Sequencer - Library exports for the player binary, tests and benchmarks

pub mod audio;
pub mod config;
pub mod error;
pub mod midi;
pub mod sequencer;

// Re-export commonly used types for convenience
pub use audio::ring_buffer::{RingBuffer, RingBufferStatus};
pub use audio::timing::{HostClock, ManualClock, MonotonicClock};
pub use config::PlayerConfig;
pub use error::{SeqResult, SequencerError};
pub use midi::catalog::Catalog;
pub use midi::device::{CollectingSink, DeviceContext, OutputSink};
pub use midi::event::{Event, Message, Tick};
pub use sequencer::{Calibrator, Player, PlayerStatus, Sequence, SequenceMerger, SharedSequence, Track};
