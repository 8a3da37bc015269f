// Module midi - Event model, device plumbing and file formats

pub mod catalog;
pub mod device;
pub mod event;
pub mod input;
pub mod output;
pub mod smf;

pub use device::{CollectingSink, DestinationId, DeviceContext, OutputSink};
pub use event::{Event, EventKind, Message, Tick};
