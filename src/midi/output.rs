// MIDI Output - midir-backed sink with timed delivery
// midir sends immediately, so a dispatcher thread holds scheduled messages in
// a time-ordered heap and writes each one when its host time comes.

use crate::audio::timing::{HostClock, MonotonicClock};
use crate::error::{SeqResult, SequencerError};
use crate::midi::device::{DestinationId, DeviceContext, OutputSink};
use midir::{MidiOutput, MidiOutputConnection};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const CLIENT_NAME: &str = "mymusic-sequencer";

/// Names of the available output ports
pub fn list_output_ports() -> SeqResult<Vec<String>> {
    let output = MidiOutput::new(CLIENT_NAME)
        .map_err(|e| SequencerError::CannotSetupDevice(e.to_string()))?;
    Ok(output
        .ports()
        .iter()
        .enumerate()
        .map(|(i, port)| {
            output
                .port_name(port)
                .unwrap_or_else(|_| format!("Port {i}"))
        })
        .collect())
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Pending {
    host_time_us: u64,
    serial: u64,
    destination: DestinationId,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Pending>>,
    serial: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Sink delivering to midir output connections
pub struct MidirOutputSink {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl MidirOutputSink {
    /// Opens the given output ports; destination ids follow the order of
    /// `ports`. Returns the sink and the port names.
    pub fn connect(ports: &[usize], clock: MonotonicClock) -> SeqResult<(Self, Vec<String>)> {
        let mut connections = Vec::with_capacity(ports.len());
        let mut names = Vec::with_capacity(ports.len());
        for &index in ports {
            let output = MidiOutput::new(CLIENT_NAME)
                .map_err(|e| SequencerError::CannotSetupDevice(e.to_string()))?;
            let available = output.ports();
            let port = available.get(index).ok_or_else(|| {
                SequencerError::CannotSetupDevice(format!("no output port {index}"))
            })?;
            let name = output
                .port_name(port)
                .unwrap_or_else(|_| format!("Port {index}"));
            let connection = output
                .connect(port, "mymusic-sequencer-out")
                .map_err(|e| SequencerError::CannotSetupDevice(e.to_string()))?;
            tracing::info!(port = index, %name, "MIDI output connected");
            connections.push(connection);
            names.push(name);
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let dispatcher = std::thread::Builder::new()
            .name("midi-out".into())
            .spawn(move || dispatch(worker, connections, clock))
            .map_err(SequencerError::Io)?;
        Ok((
            Self {
                shared,
                dispatcher: Some(dispatcher),
            },
            names,
        ))
    }

    /// Device context over the given ports, sharing one monotonic clock
    pub fn open_context(ports: &[usize]) -> SeqResult<DeviceContext> {
        let clock = MonotonicClock::new();
        let (sink, names) = Self::connect(ports, clock.clone())?;
        Ok(DeviceContext::new(names, sink, clock))
    }

    /// Messages waiting for their delivery time
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }
}

fn dispatch(shared: Arc<Shared>, mut connections: Vec<MidiOutputConnection>, clock: MonotonicClock) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }
        let now = clock.now_micros();
        let next_time = queue.heap.peek().map(|Reverse(p)| p.host_time_us);
        match next_time {
            None => shared.wake.wait(&mut queue),
            Some(time) if time > now => {
                shared
                    .wake
                    .wait_for(&mut queue, Duration::from_micros(time - now));
            }
            Some(_) => {
                let Some(Reverse(message)) = queue.heap.pop() else {
                    continue;
                };
                // Do not hold the queue while writing to the device
                drop(queue);
                if let Some(connection) = connections.get_mut(message.destination) {
                    if let Err(e) = connection.send(&message.bytes) {
                        tracing::warn!(
                            destination = message.destination,
                            error = %e,
                            "MIDI send failed"
                        );
                    }
                }
                queue = shared.queue.lock();
            }
        }
    }
    drop(queue);
    for connection in connections {
        connection.close();
    }
}

impl OutputSink for MidirOutputSink {
    fn schedule_event(
        &mut self,
        destination: DestinationId,
        host_time_us: u64,
        bytes: &[u8],
    ) -> SeqResult<()> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(SequencerError::Transport {
                destination,
                message: "output closed".into(),
            });
        }
        queue.serial += 1;
        let serial = queue.serial;
        queue.heap.push(Reverse(Pending {
            host_time_us,
            serial,
            destination,
            bytes: bytes.to_vec(),
        }));
        drop(queue);
        self.shared.wake.notify_one();
        Ok(())
    }

    fn flush(&mut self, destination: Option<DestinationId>) {
        let mut queue = self.shared.queue.lock();
        match destination {
            None => queue.heap.clear(),
            Some(d) => queue.heap.retain(|Reverse(p)| p.destination != d),
        }
    }
}

impl Drop for MidirOutputSink {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}
