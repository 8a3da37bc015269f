// Output devices - Destination registry and the sink the player schedules into

use crate::audio::timing::HostClock;
use crate::error::{SeqResult, SequencerError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Index of an output destination in a [`DeviceContext`]
pub type DestinationId = usize;

/// Receiver of time-stamped MIDI bytes
pub trait OutputSink: Send {
    /// Queues `bytes` for delivery at host time `host_time_us`; 0 means now.
    /// An error means the destination is busy and the caller retries later.
    fn schedule_event(
        &mut self,
        destination: DestinationId,
        host_time_us: u64,
        bytes: &[u8],
    ) -> SeqResult<()>;

    /// Drops everything queued but not yet delivered; `None` for all
    fn flush(&mut self, destination: Option<DestinationId>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationInfo {
    pub name: String,
    /// False for names registered before the device showed up
    pub online: bool,
}

/// Destinations, sink and clock the player works with.
/// Cheap to clone; clones share the same sink.
#[derive(Clone)]
pub struct DeviceContext {
    destinations: Arc<Mutex<Vec<DestinationInfo>>>,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
    clock: Arc<dyn HostClock>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("destinations", &*self.destinations.lock())
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    pub fn new(
        names: impl IntoIterator<Item = String>,
        sink: impl OutputSink + 'static,
        clock: impl HostClock + 'static,
    ) -> Self {
        let destinations = names
            .into_iter()
            .map(|name| DestinationInfo { name, online: true })
            .collect();
        Self {
            destinations: Arc::new(Mutex::new(destinations)),
            sink: Arc::new(Mutex::new(Box::new(sink))),
            clock: Arc::new(clock),
        }
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.lock().len()
    }

    pub fn destination_name(&self, id: DestinationId) -> Option<String> {
        self.destinations.lock().get(id).map(|d| d.name.clone())
    }

    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.lock().iter().map(|d| d.name.clone()).collect()
    }

    /// Exact name match first, then case-insensitive
    pub fn destination_by_name(&self, name: &str) -> Option<DestinationId> {
        if name.is_empty() {
            return None;
        }
        let destinations = self.destinations.lock();
        destinations
            .iter()
            .position(|d| d.name == name)
            .or_else(|| {
                destinations
                    .iter()
                    .position(|d| d.name.eq_ignore_ascii_case(name))
            })
    }

    /// Registers an offline placeholder so that tracks routed to a missing
    /// device keep a stable index. Returns the existing index if known.
    pub fn add_destination_name(&self, name: &str) -> DestinationId {
        if let Some(id) = self.destination_by_name(name) {
            return id;
        }
        let mut destinations = self.destinations.lock();
        destinations.push(DestinationInfo {
            name: name.to_string(),
            online: false,
        });
        destinations.len() - 1
    }

    pub fn is_online(&self, id: DestinationId) -> bool {
        self.destinations.lock().get(id).is_some_and(|d| d.online)
    }

    pub fn now_micros(&self) -> u64 {
        self.clock.now_micros()
    }

    pub fn clock(&self) -> Arc<dyn HostClock> {
        Arc::clone(&self.clock)
    }

    pub fn send(&self, destination: DestinationId, host_time_us: u64, bytes: &[u8]) -> SeqResult<()> {
        if !self.is_online(destination) {
            return Err(SequencerError::Transport {
                destination,
                message: "destination offline".into(),
            });
        }
        self.sink.lock().schedule_event(destination, host_time_us, bytes)
    }

    pub fn flush(&self, destination: Option<DestinationId>) {
        self.sink.lock().flush(destination);
    }
}

/// One message handed to a [`CollectingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMessage {
    pub destination: DestinationId,
    pub host_time_us: u64,
    pub bytes: Vec<u8>,
}

/// In-memory sink for tests and offline rendering
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    log: Arc<Mutex<Vec<ScheduledMessage>>>,
    busy: Arc<Mutex<HashMap<DestinationId, usize>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything scheduled so far, in call order
    pub fn messages(&self) -> Vec<ScheduledMessage> {
        self.log.lock().clone()
    }

    pub fn take_messages(&self) -> Vec<ScheduledMessage> {
        std::mem::take(&mut *self.log.lock())
    }

    /// Makes the next `failures` sends to `destination` fail
    pub fn set_busy(&self, destination: DestinationId, failures: usize) {
        self.busy.lock().insert(destination, failures);
    }
}

impl OutputSink for CollectingSink {
    fn schedule_event(
        &mut self,
        destination: DestinationId,
        host_time_us: u64,
        bytes: &[u8],
    ) -> SeqResult<()> {
        if let Some(left) = self.busy.lock().get_mut(&destination) {
            if *left > 0 {
                *left -= 1;
                return Err(SequencerError::Transport {
                    destination,
                    message: "busy".into(),
                });
            }
        }
        self.log.lock().push(ScheduledMessage {
            destination,
            host_time_us,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn flush(&mut self, _destination: Option<DestinationId>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::timing::ManualClock;

    #[test]
    fn test_lookup_by_name() {
        let ctx = DeviceContext::new(
            vec!["Synth A".to_string(), "Drums".to_string()],
            CollectingSink::new(),
            ManualClock::new(0),
        );
        assert_eq!(ctx.destination_by_name("Drums"), Some(1));
        assert_eq!(ctx.destination_by_name("synth a"), Some(0));
        assert_eq!(ctx.destination_by_name("Nope"), None);
        assert_eq!(ctx.destination_by_name(""), None);

        let id = ctx.add_destination_name("Later");
        assert_eq!(id, 2);
        assert_eq!(ctx.add_destination_name("Later"), 2);
        assert!(!ctx.is_online(id));
        assert!(ctx.send(id, 0, &[0x90, 60, 100]).is_err());
    }

    #[test]
    fn test_collecting_sink_busy() {
        let sink = CollectingSink::new();
        let ctx = DeviceContext::new(vec!["Out".to_string()], sink.clone(), ManualClock::new(5));
        sink.set_busy(0, 1);
        assert!(ctx.send(0, 10, &[0x90, 60, 100]).is_err());
        ctx.send(0, 20, &[0x80, 60, 0]).unwrap();
        assert_eq!(
            sink.messages(),
            vec![ScheduledMessage {
                destination: 0,
                host_time_us: 20,
                bytes: vec![0x80, 60, 0],
            }]
        );
        assert_eq!(ctx.now_micros(), 5);
    }
}
