// MIDI Input - Incoming messages for recording and MIDI thru
// The midir callback runs on its own thread and must not block, so it only
// time-stamps the bytes and pushes them into a lock-free ring. The control
// thread drains the ring into the player.

use crate::audio::timing::HostClock;
use crate::error::{SeqResult, SequencerError};
use crate::sequencer::player::Player;
use midir::{MidiInput, MidiInputConnection};
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use std::sync::Arc;

const CLIENT_NAME: &str = "mymusic-sequencer";

/// Packets the ring holds before the callback starts dropping input
pub const INPUT_QUEUE_CAPACITY: usize = 1024;

pub type InputProducer = ringbuf::HeapProd<RawMidiInput>;
pub type InputConsumer = ringbuf::HeapCons<RawMidiInput>;

/// One packet as delivered by the input port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMidiInput {
    pub host_time_us: u64,
    pub bytes: Vec<u8>,
}

pub fn create_input_channel(capacity: usize) -> (InputProducer, InputConsumer) {
    HeapRb::<RawMidiInput>::new(capacity.max(1)).split()
}

/// Sets the channel of every channel voice status byte in `bytes`.
/// Channel 16 (or above) leaves the message untouched.
pub fn rechannelize(bytes: &mut [u8], channel: u8) {
    if channel >= 16 {
        return;
    }
    let mut in_sysex = false;
    for byte in bytes.iter_mut() {
        match *byte {
            0xf0 => in_sysex = true,
            0xf7 => in_sysex = false,
            0x80..=0xef if !in_sysex => *byte = (*byte & 0xf0) | channel,
            _ => {}
        }
    }
}

/// Names of the available input ports
pub fn list_input_ports() -> SeqResult<Vec<String>> {
    let input = MidiInput::new(CLIENT_NAME).map_err(|e| SequencerError::CannotSetupDevice(e.to_string()))?;
    Ok(input
        .ports()
        .iter()
        .enumerate()
        .map(|(i, port)| input.port_name(port).unwrap_or_else(|_| format!("Port {i}")))
        .collect())
}

/// Open input port feeding a ring of [`RawMidiInput`]
pub struct MidiInputRecorder {
    _connection: MidiInputConnection<InputProducer>,
    consumer: InputConsumer,
    name: String,
}

impl MidiInputRecorder {
    /// Connects to input port `index`. Time stamps come from `clock`, which
    /// must be the clock of the player's device context.
    pub fn connect(index: usize, clock: Arc<dyn HostClock>) -> SeqResult<Self> {
        let mut input =
            MidiInput::new(CLIENT_NAME).map_err(|e| SequencerError::CannotSetupDevice(e.to_string()))?;
        // Sysex is recorded as well
        input.ignore(midir::Ignore::TimeAndActiveSense);
        let ports = input.ports();
        let port = ports
            .get(index)
            .ok_or_else(|| SequencerError::CannotSetupDevice(format!("no input port {index}")))?;
        let name = input
            .port_name(port)
            .unwrap_or_else(|_| format!("Port {index}"));

        let (producer, consumer) = create_input_channel(INPUT_QUEUE_CAPACITY);
        let connection = input
            .connect(
                port,
                "mymusic-sequencer-in",
                move |_timestamp, message, producer| {
                    let packet = RawMidiInput {
                        host_time_us: clock.now_micros(),
                        bytes: message.to_vec(),
                    };
                    // try_push never blocks the driver thread
                    if producer.try_push(packet).is_err() {
                        tracing::warn!("MIDI input queue full, packet dropped");
                    }
                },
                producer,
            )
            .map_err(|e| SequencerError::CannotSetupDevice(e.to_string()))?;
        tracing::info!(port = index, %name, "MIDI input connected");

        Ok(Self {
            _connection: connection,
            consumer,
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hands everything received so far to `player`; returns the packet count
    pub fn drain_into(&mut self, player: &Player) -> usize {
        drain_packets(&mut self.consumer, player)
    }
}

/// Feeds queued packets to the player's input handler
pub fn drain_packets(consumer: &mut InputConsumer, player: &Player) -> usize {
    let mut count = 0;
    while let Some(packet) = consumer.try_pop() {
        if let Err(e) = player.handle_input(packet.host_time_us, &packet.bytes) {
            tracing::warn!(error = %e, "MIDI input packet dropped");
        }
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rechannelize_voice_messages() {
        let mut bytes = [0x90, 60, 100, 0xb3, 7, 90];
        rechannelize(&mut bytes, 5);
        assert_eq!(bytes, [0x95, 60, 100, 0xb5, 7, 90]);
    }

    #[test]
    fn test_rechannelize_keeps_channel_16() {
        let mut bytes = [0x92, 60, 100];
        rechannelize(&mut bytes, 16);
        assert_eq!(bytes, [0x92, 60, 100]);
    }

    #[test]
    fn test_rechannelize_skips_system_and_sysex() {
        let mut bytes = [0xf0, 0x43, 0x10, 0xf7, 0xf8, 0xc1, 3];
        rechannelize(&mut bytes, 0);
        assert_eq!(bytes, [0xf0, 0x43, 0x10, 0xf7, 0xf8, 0xc0, 3]);
    }

    #[test]
    fn test_input_channel_overflow() {
        let (mut producer, mut consumer) = create_input_channel(2);
        for i in 0..3u64 {
            let packet = RawMidiInput {
                host_time_us: i,
                bytes: vec![0x90, 60, 100],
            };
            let pushed = producer.try_push(packet).is_ok();
            assert_eq!(pushed, i < 2);
        }
        assert_eq!(consumer.try_pop().map(|p| p.host_time_us), Some(0));
        assert_eq!(consumer.try_pop().map(|p| p.host_time_us), Some(1));
        assert!(consumer.try_pop().is_none());
    }
}
