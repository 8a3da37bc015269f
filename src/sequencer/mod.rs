// Sequencer module
// Event store, cursors, merging, tempo calibration and the real-time player

pub mod calibrator;
pub mod cursor;
pub mod merger;
pub mod metronome;
pub mod player;
pub mod recording;
pub mod sequence;
pub mod timeline;
pub mod track;
pub mod transport;

pub use calibrator::{Calibrator, CalibratorFilter, MicroTime};
pub use cursor::CursorId;
pub use merger::{SequenceMerger, TrackMerger};
pub use metronome::{ClickType, MetronomeScheduler};
pub use player::{EventSelector, Player};
pub use sequence::{Sequence, SharedSequence};
pub use timeline::{MusicalTime, Tempo, TimeSignature};
pub use track::{Track, TrackAttribute};
pub use transport::PlayerStatus;
