// Player - Schedules a sequence on output destinations from a background thread
// Each destination gets its own merger over the tracks routed to it, plus a
// small track of pending note-offs. A timer thread wakes up periodically and
// hands everything due before the lookahead horizon to the output sink.

use crate::config::PlayerConfig;
use crate::error::{SeqResult, SequencerError};
use crate::midi::device::{DestinationId, DeviceContext};
use crate::midi::event::{Event, EventKind, MAX_TICK, Message, SpecialCode, Tick};
use crate::midi::input::rechannelize;
use crate::sequencer::calibrator::{Calibrator, CalibratorFilter, MicroTime};
use crate::sequencer::cursor::CursorId;
use crate::sequencer::merger::SequenceMerger;
use crate::sequencer::metronome::{ClickType, MetronomeScheduler, SignatureSpan, count_off_clicks};
use crate::sequencer::recording::{RecordingBuffer, assemble_track, decode_packet};
use crate::sequencer::sequence::{Sequence, SharedSequence};
use crate::sequencer::track::Track;
use crate::sequencer::transport::{AtomicPlayerStatus, PlayerStatus, StopFlag};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Spacing between events that would otherwise share a time stamp
const TIME_STAMP_SPACING: MicroTime = 10;

/// Longest uninterrupted sleep of the timer thread between stop flag checks
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Event kind plus optional code (controller number, note number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSelector {
    pub kind: EventKind,
    /// `None` matches any code
    pub code: Option<u8>,
}

impl EventSelector {
    pub const fn kind(kind: EventKind) -> Self {
        Self { kind, code: None }
    }

    pub const fn control(controller: u8) -> Self {
        Self {
            kind: EventKind::Control,
            code: Some(controller),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        Track::kind_matches(event, self.kind, self.code)
    }
}

/// Resent in order when playback starts in the middle of a sequence:
/// sysex, key pressure and the bank select / RPN / NRPN / data entry controllers
pub fn default_backtrack_types() -> Vec<EventSelector> {
    vec![
        EventSelector::kind(EventKind::Sysex),
        EventSelector::kind(EventKind::SysexCont),
        EventSelector::kind(EventKind::KeyPressure),
        EventSelector::control(0),
        EventSelector::control(6),
        EventSelector::control(32),
        EventSelector::control(100),
        EventSelector::control(101),
        EventSelector::control(98),
        EventSelector::control(99),
    ]
}

/// Only the latest value per destination, channel and controller is resent
pub fn default_last_only_types() -> Vec<EventSelector> {
    vec![
        EventSelector::kind(EventKind::PitchBend),
        EventSelector::kind(EventKind::ChannelPressure),
        EventSelector::kind(EventKind::Program),
        EventSelector::kind(EventKind::Control),
    ]
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackRoute {
    destination: Option<DestinationId>,
    channel: u8,
    silent: bool,
}

/// Events of the tracks routed to one destination
#[derive(Debug)]
struct Lane {
    destination: DestinationId,
    merger: SequenceMerger,
    note_offs: Track,
    cursor: CursorId,
}

impl Lane {
    fn new(seq: &mut Sequence, destination: DestinationId, tracks: &[usize]) -> Self {
        let mut note_offs = Track::new();
        let cursor = note_offs.new_cursor();
        Self {
            destination,
            merger: SequenceMerger::with_tracks(seq, tracks),
            note_offs,
            cursor,
        }
    }

    fn next_note_off_tick(&self) -> Tick {
        self.note_offs.event_at(0).map_or(MAX_TICK, |e| e.tick)
    }

    /// Note-offs at the same tick come out in registration order
    fn register_note_off(&mut self, event: Event) -> SeqResult<()> {
        self.note_offs.jump_to_tick(self.cursor, event.tick + 1);
        self.note_offs.insert_event(self.cursor, event)
    }

    fn pop_note_off(&mut self) -> SeqResult<Option<Event>> {
        self.note_offs.set_position(self.cursor, 0);
        self.note_offs.delete_event(self.cursor)
    }
}

/// What the scheduling code needs from outside the engine
struct Output<'a> {
    devices: &'a DeviceContext,
    config: &'a PlayerConfig,
    start_time: MicroTime,
    recording: bool,
}

impl Output<'_> {
    /// Host time of a player time; 0 (immediate) when it lies before the
    /// host clock origin
    fn host_time(&self, time: MicroTime) -> u64 {
        u64::try_from(self.start_time + time).unwrap_or(0)
    }

    fn metronome_destination(&self) -> Option<DestinationId> {
        let metronome = &self.config.metronome;
        let enabled = metronome.enable_when_playing || (self.recording && metronome.enable_when_recording);
        if !enabled {
            return None;
        }
        self.devices.destination_by_name(&metronome.destination)
    }
}

/// Scheduling state, shared by the control thread and the timer thread
#[derive(Debug)]
struct Engine {
    routes: Vec<TrackRoute>,
    lanes: Vec<Lane>,
    calibrator: Calibrator,
    /// EndOfSequence and StopPlaying markers
    control: Track,
    control_cursor: CursorId,
    metronome: MetronomeScheduler,
    /// Player time while not playing, and at the last timer cycle
    time: MicroTime,
    stop_tick: Tick,
    /// Tick of the marker that ended playback
    finished_at: Option<Tick>,
}

impl Engine {
    fn new(seq: &mut Sequence) -> SeqResult<Self> {
        let calibrator = Calibrator::for_playback(seq)?;
        let mut control = Track::new();
        let control_cursor = control.new_cursor();
        Ok(Self {
            routes: Vec::new(),
            lanes: Vec::new(),
            calibrator,
            control,
            control_cursor,
            metronome: MetronomeScheduler::new(),
            time: 0,
            stop_tick: MAX_TICK,
            finished_at: None,
        })
    }

    /// Unregisters every cursor the engine holds in `seq`
    fn release(&mut self, seq: &mut Sequence) {
        for lane in &mut self.lanes {
            lane.merger.release(seq);
        }
        self.lanes.clear();
        self.calibrator.release(seq);
    }

    fn refresh_destinations(&mut self, seq: &mut Sequence, devices: &DeviceContext) {
        let old_tick = self.calibrator.time_to_tick(seq, self.time);
        for lane in &mut self.lanes {
            lane.merger.release(seq);
        }
        self.lanes.clear();

        self.routes = seq
            .tracks()
            .iter()
            .map(|track| {
                let destination = if track.device_name().is_empty() {
                    track.device()
                } else {
                    devices.destination_by_name(track.device_name())
                }
                .filter(|&d| devices.is_online(d));
                TrackRoute {
                    destination,
                    channel: track.track_channel(),
                    silent: track.attribute().is_silent(),
                }
            })
            .collect();

        let mut groups: Vec<(DestinationId, Vec<usize>)> = Vec::new();
        for (index, route) in self.routes.iter().enumerate() {
            let Some(destination) = route.destination else {
                if seq.track(index).is_some_and(|t| t.midi_event_count() > 0) {
                    tracing::debug!(track = index, "track has no output destination");
                }
                continue;
            };
            match groups.iter_mut().find(|(d, _)| *d == destination) {
                Some((_, tracks)) => tracks.push(index),
                None => groups.push((destination, vec![index])),
            }
        }
        self.lanes = groups
            .into_iter()
            .map(|(destination, tracks)| Lane::new(seq, destination, &tracks))
            .collect();
        self.jump_to_tick(seq, old_tick);
    }

    fn jump_to_tick(&mut self, seq: &mut Sequence, tick: Tick) {
        for lane in &mut self.lanes {
            lane.merger.jump_to_tick(seq, tick);
            lane.note_offs.clear();
        }
        self.calibrator.jump_to_tick(seq, tick);
        self.time = self.calibrator.tick_to_time(seq, tick);
        self.metronome.reset();
        self.finished_at = None;
    }

    fn pending_note_off_count(&self) -> usize {
        self.lanes.iter().map(|l| l.note_offs.number_of_events()).sum()
    }

    fn schedule_special_events(&mut self, duration: Tick, recording: bool) -> SeqResult<()> {
        self.control.clear();
        let end = if recording { MAX_TICK - 1 } else { duration };
        let mut markers = vec![Event::special(end, SpecialCode::EndOfSequence)];
        if self.stop_tick < MAX_TICK {
            markers.push(Event::special(self.stop_tick.max(0), SpecialCode::StopPlaying));
        }
        markers.sort_by_key(|e| e.tick);
        self.control.append_events(markers)?;
        Ok(())
    }

    fn next_marker_tick(&self) -> Tick {
        self.control.event_at(0).map_or(MAX_TICK, |e| e.tick)
    }

    fn signature_span(calibrator: &mut Calibrator, seq: &mut Sequence, tick: Tick) -> SignatureSpan {
        calibrator.jump_to_tick(seq, tick);
        let (start, signature) = match calibrator.event_before(seq, CalibratorFilter::TimeSignature) {
            Some(Event {
                tick,
                message: Message::TimeSignature(signature),
                ..
            }) => (*tick, Some(*signature)),
            _ => (0, None),
        };
        let next_change = calibrator
            .next_event(seq, CalibratorFilter::TimeSignature)
            .map_or(MAX_TICK, |e| e.tick);
        SignatureSpan {
            start,
            signature,
            next_change,
        }
    }

    fn prepare_metronome(&mut self, seq: &mut Sequence, tick: Tick) {
        let span = Self::signature_span(&mut self.calibrator, seq, tick);
        self.metronome.prepare(tick, span, seq.timebase());
    }

    /// One scheduling pass. Everything due up to `prefetch_tick` is handed to
    /// the output; returns the tick of the earliest event left for later.
    fn send_events_before_tick(
        &mut self,
        seq: &mut Sequence,
        out: &Output<'_>,
        now_tick: Tick,
        prefetch_tick: Tick,
    ) -> SeqResult<Tick> {
        // Nothing after a pending marker goes out before it fires
        let barrier = self.next_marker_tick();
        let limit = (prefetch_tick + 1).min(barrier.saturating_add(1));
        let mut next_tick = barrier;

        let Self {
            routes,
            lanes,
            calibrator,
            ..
        } = self;
        for lane in lanes.iter_mut() {
            let mut last_time: MicroTime = MicroTime::MIN;
            // Tracks edited since the last pass; pending note-offs stay
            lane.merger.refresh(seq);
            loop {
                if lane.merger.tick() < 0 {
                    lane.merger.forward(seq);
                }
                let merger_tick = lane.merger.tick();
                let off_tick = lane.next_note_off_tick();
                let from_note_off = off_tick <= merger_tick;
                let tick = if from_note_off { off_tick } else { merger_tick };
                if tick >= limit || tick >= MAX_TICK {
                    next_tick = next_tick.min(tick);
                    break;
                }

                let (event, route) = if from_note_off {
                    match lane.note_offs.event_at(0) {
                        Some(event) => (event.clone(), None),
                        None => break,
                    }
                } else {
                    let Some(event) = lane.merger.current(seq).cloned() else {
                        lane.merger.forward(seq);
                        continue;
                    };
                    let route = lane
                        .merger
                        .current_track()
                        .and_then(|t| routes.get(t).copied())
                        .unwrap_or_default();
                    if route.silent || route.destination != Some(lane.destination) {
                        lane.merger.forward(seq);
                        continue;
                    }
                    (event, Some(route))
                };

                let bytes: Vec<u8> = match &event.message {
                    Message::Sysex(payload) | Message::SysexCont(payload) => payload.as_bytes().to_vec(),
                    _ => match event.to_midi_message() {
                        Some(message) => {
                            let mut bytes = message.as_bytes().to_vec();
                            if let Some(route) = route {
                                bytes[0] |= route.channel & 0x0f;
                            }
                            bytes
                        }
                        None => {
                            // Meta and internal events are not sent
                            if from_note_off {
                                lane.pop_note_off()?;
                            } else {
                                lane.merger.forward(seq);
                            }
                            continue;
                        }
                    },
                };

                let mut time = calibrator.tick_to_time(seq, tick);
                if time <= last_time {
                    time = last_time + TIME_STAMP_SPACING;
                }
                if let Err(e) = out.devices.send(lane.destination, out.host_time(time), &bytes) {
                    // Retried on the next cycle
                    tracing::debug!(destination = lane.destination, error = %e, "destination busy");
                    next_tick = next_tick.min(tick);
                    break;
                }
                last_time = time;

                if from_note_off {
                    lane.pop_note_off()?;
                    continue;
                }
                if let Message::Note {
                    key,
                    off_velocity,
                    duration,
                    ..
                } = event.message
                {
                    let channel = bytes[0] & 0x0f;
                    let end = (event.tick + duration.max(0)).min(MAX_TICK);
                    lane.register_note_off(Event::new(
                        end,
                        channel,
                        Message::NoteOff {
                            key,
                            velocity: off_velocity,
                        },
                    ))?;
                }
                lane.merger.forward(seq);
            }
        }

        match out.metronome_destination() {
            Some(destination) => {
                if !self.metronome.is_prepared() {
                    self.prepare_metronome(seq, now_tick.max(0));
                }
                let timebase = seq.timebase();
                let metronome = &out.config.metronome;
                let Self {
                    metronome: scheduler,
                    calibrator,
                    ..
                } = self;
                let click_limit = limit.min(barrier);
                loop {
                    let click = scheduler.next_click(click_limit, timebase, |tick| {
                        Self::signature_span(calibrator, seq, tick)
                    });
                    let Some((tick, click_type)) = click else {
                        break;
                    };
                    let sound = match click_type {
                        ClickType::Accent => metronome.accent,
                        ClickType::Regular => metronome.regular,
                    };
                    let time = calibrator.tick_to_time(seq, tick);
                    let on = out
                        .devices
                        .send(destination, out.host_time(time), &sound.note_on(metronome.channel));
                    let off = out.devices.send(
                        destination,
                        out.host_time(time + metronome.click_length_us),
                        &sound.note_off(metronome.channel),
                    );
                    if let Err(e) = on.and(off) {
                        tracing::debug!(error = %e, "metronome click dropped");
                    }
                }
                if let Some(tick) = scheduler.next_click_tick() {
                    next_tick = next_tick.min(tick);
                }
            }
            None => self.metronome.reset(),
        }

        if barrier <= now_tick {
            if let Some(marker) = self.control.event_at(0) {
                tracing::debug!(tick = marker.tick, message = ?marker.message, "playback reached marker");
            }
            self.control.set_position(self.control_cursor, 0);
            self.control.delete_event(self.control_cursor)?;
            self.finished_at = Some(barrier);
            return Ok(barrier);
        }
        Ok(next_tick)
    }

    /// (destination, channel) pairs that may have sounding notes
    fn routed_channels(&self, seq: &Sequence) -> BTreeSet<(DestinationId, u8)> {
        let mut channels = BTreeSet::new();
        for (index, route) in self.routes.iter().enumerate() {
            let Some(destination) = route.destination else {
                continue;
            };
            let track = seq.track(index);
            let mut any = false;
            for ch in 0..16u8 {
                if track.is_some_and(|t| t.channel_event_count(ch) > 0) {
                    channels.insert((destination, (ch | route.channel) & 0x0f));
                    any = true;
                }
            }
            if !any {
                channels.insert((destination, route.channel & 0x0f));
            }
        }
        channels
    }
}

#[derive(Debug, Default)]
struct RecordState {
    buffer: RecordingBuffer,
    running_status: u8,
}

#[derive(Debug)]
struct Shared {
    sequence: SharedSequence,
    devices: DeviceContext,
    config: PlayerConfig,
    engine: Mutex<Engine>,
    status: AtomicPlayerStatus,
    stop_flag: StopFlag,
    recording: AtomicBool,
    /// Host time (µs) of player time 0
    start_time: AtomicI64,
    record: Mutex<RecordState>,
}

impl Shared {
    fn start_time(&self) -> MicroTime {
        self.start_time.load(Ordering::Acquire)
    }

    fn now(&self) -> MicroTime {
        MicroTime::try_from(self.devices.now_micros()).unwrap_or(MicroTime::MAX)
    }

    fn output(&self) -> Output<'_> {
        Output {
            devices: &self.devices,
            config: &self.config,
            start_time: self.start_time(),
            recording: self.recording.load(Ordering::Acquire),
        }
    }

    /// One timer cycle; returns how long to sleep, or `None` once playback
    /// has run out
    fn timer_cycle(&self) -> Option<Duration> {
        let now_time = self.now() - self.start_time();
        let prefetch = self.config.prefetch_interval_us;
        let min_wait = Duration::from_micros(self.config.min_interval_us.max(0) as u64);
        let max_wait = Duration::from_micros(self.config.max_interval_us.max(0) as u64).max(min_wait);
        let mut engine = self.engine.lock();
        engine.time = now_time;
        let Some(mut seq) = self.sequence.try_lock() else {
            // The control thread is editing; try again shortly
            tracing::trace!("sequence locked, skipping cycle");
            return Some(min_wait);
        };
        let now_tick = engine.calibrator.time_to_tick(&mut seq, now_time);
        let prefetch_tick = engine.calibrator.time_to_tick(&mut seq, now_time + prefetch);
        let output = self.output();
        let tick = match engine.send_events_before_tick(&mut seq, &output, now_tick, prefetch_tick) {
            Ok(tick) => tick,
            Err(e) => {
                tracing::warn!(error = %e, "scheduling cycle failed");
                prefetch_tick + 1
            }
        };
        if tick >= MAX_TICK || engine.finished_at.is_some() {
            let end = match engine.finished_at {
                Some(tick) if tick < MAX_TICK - 1 => tick,
                _ => seq.duration(),
            };
            engine.time = engine.calibrator.tick_to_time(&mut seq, end);
            self.recording.store(false, Ordering::Release);
            self.status.set(PlayerStatus::Exhausted);
            tracing::info!(tick = end, "playback finished");
            return None;
        }
        let next_time = engine.calibrator.tick_to_time(&mut seq, tick + 1) - (now_time + prefetch);
        let wait = Duration::from_micros(next_time.max(0) as u64);
        Some(wait.clamp(min_wait, max_wait))
    }
}

fn run_timer(shared: Arc<Shared>) {
    tracing::debug!("player thread started");
    while shared.status.get() == PlayerStatus::Playing && !shared.stop_flag.is_raised() {
        let Some(mut wait) = shared.timer_cycle() else {
            break;
        };
        while !wait.is_zero() && !shared.stop_flag.is_raised() {
            let slice = wait.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            wait -= slice;
        }
    }
    tracing::debug!("player thread exited");
}

/// Plays a shared sequence through a [`DeviceContext`].
///
/// Control methods may block on the sequence lock, so do not call them
/// while holding it.
#[derive(Debug)]
pub struct Player {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Player {
    pub fn new(sequence: SharedSequence, devices: DeviceContext, config: PlayerConfig) -> SeqResult<Self> {
        let config = config.validated();
        let engine = {
            let mut seq = sequence.lock();
            let mut engine = Engine::new(&mut seq)?;
            engine.refresh_destinations(&mut seq, &devices);
            engine
        };
        let record = RecordState {
            buffer: RecordingBuffer::new(config.recording_chunk_size),
            running_status: 0,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                sequence,
                devices,
                config,
                engine: Mutex::new(engine),
                status: AtomicPlayerStatus::new(PlayerStatus::Idle),
                stop_flag: StopFlag::new(),
                recording: AtomicBool::new(false),
                start_time: AtomicI64::new(0),
                record: Mutex::new(record),
            }),
            thread: None,
        })
    }

    pub fn sequence(&self) -> &SharedSequence {
        &self.shared.sequence
    }

    pub fn devices(&self) -> &DeviceContext {
        &self.shared.devices
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.shared.config
    }

    /// Switches to another sequence. Playback stops first and the
    /// recording buffer is discarded.
    pub fn set_sequence(&mut self, sequence: SharedSequence) -> SeqResult<()> {
        self.stop()?;
        if self.shared.sequence.ptr_eq(&sequence) {
            return Ok(());
        }
        let devices = self.shared.devices.clone();
        let config = self.shared.config.clone();
        *self = Self::new(sequence, devices, config)?;
        Ok(())
    }

    /// Re-reads device names, channels and mute/solo flags of every track
    pub fn refresh_track_destinations(&self) -> SeqResult<()> {
        let mut engine = self.shared.engine.lock();
        let mut seq = self.shared.sequence.lock();
        engine.refresh_destinations(&mut seq, &self.shared.devices);
        Ok(())
    }

    pub fn status(&self) -> PlayerStatus {
        self.shared.status.get()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    /// Moves the play position; stops playback first
    pub fn jump_to_tick(&mut self, tick: Tick) -> SeqResult<()> {
        if self.status().is_running() {
            self.stop()?;
        }
        let mut engine = self.shared.engine.lock();
        let mut seq = self.shared.sequence.lock();
        engine.jump_to_tick(&mut seq, tick.clamp(0, MAX_TICK));
        self.shared.status.set(PlayerStatus::Ready);
        Ok(())
    }

    /// Positions at `tick` and gets ready to start. With `backtrack`, the
    /// controller state in force at `tick` is sent to the destinations.
    pub fn preroll(&mut self, tick: Tick, backtrack: bool) -> SeqResult<()> {
        self.jump_to_tick(tick)?;
        self.refresh_track_destinations()?;
        if tick > 0 && backtrack {
            self.backtrack_events(&default_backtrack_types(), &default_last_only_types())?;
        }
        {
            let mut engine = self.shared.engine.lock();
            let mut seq = self.shared.sequence.lock();
            engine.prepare_metronome(&mut seq, tick.max(0));
        }
        self.shared.status.set(PlayerStatus::Suspended);
        Ok(())
    }

    /// Starts the timer thread. From any state but suspended, prerolls at
    /// the current position without backtracking.
    pub fn start(&mut self) -> SeqResult<()> {
        match self.status() {
            PlayerStatus::Playing => return Ok(()),
            PlayerStatus::Suspended => {}
            _ => {
                let tick = self.tick();
                self.preroll(tick, false)?;
            }
        }
        self.join_thread();

        let count_off = {
            let mut engine = self.shared.engine.lock();
            let mut seq = self.shared.sequence.lock();
            engine.schedule_special_events(seq.duration(), self.is_recording())?;
            self.send_count_off(&mut engine, &mut seq)
        };
        let time = self.shared.engine.lock().time;
        let start_time = self.shared.now() + count_off - time;
        self.shared.start_time.store(start_time, Ordering::Release);
        self.shared.stop_flag.clear();
        self.shared.status.set(PlayerStatus::Playing);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("sequencer-player".into())
            .spawn(move || run_timer(shared));
        match handle {
            Ok(handle) => {
                self.thread = Some(handle);
                tracing::info!(time, "playback started");
                Ok(())
            }
            Err(e) => {
                self.shared.status.set(PlayerStatus::Ready);
                Err(SequencerError::CannotStartPlaying(e.to_string()))
            }
        }
    }

    /// Clicks the configured number of bars before the start position.
    /// Returns the count-off length in µs.
    fn send_count_off(&self, engine: &mut Engine, seq: &mut Sequence) -> MicroTime {
        let bars = self.shared.config.count_off_bars;
        let out = self.shared.output();
        let Some(destination) = out.metronome_destination().filter(|_| bars > 0) else {
            return 0;
        };
        let tick = engine.calibrator.time_to_tick(seq, engine.time);
        let timebase = seq.timebase();
        let span = Engine::signature_span(&mut engine.calibrator, seq, tick);
        let tempo = engine.calibrator.tempo_at(seq, tick);
        let (bar, _) = span.lengths(timebase);
        let length = tempo.ticks_to_micros((bar * i64::from(bars)) as f64, timebase) as MicroTime;
        let now = self.shared.now();
        let metronome = &self.shared.config.metronome;
        for (offset, click_type) in count_off_clicks(span.signature, bars, timebase) {
            let sound = match click_type {
                ClickType::Accent => metronome.accent,
                ClickType::Regular => metronome.regular,
            };
            let at = now + tempo.ticks_to_micros(offset as f64, timebase) as MicroTime;
            let host = u64::try_from(at).unwrap_or(0);
            let result = self
                .shared
                .devices
                .send(destination, host, &sound.note_on(metronome.channel))
                .and_then(|_| {
                    self.shared.devices.send(
                        destination,
                        host + metronome.click_length_us.max(0) as u64,
                        &sound.note_off(metronome.channel),
                    )
                });
            if let Err(e) = result {
                tracing::warn!(error = %e, "count-off click dropped");
            }
        }
        length
    }

    /// Clears the recording buffer and starts playing while capturing input
    pub fn start_recording(&mut self) -> SeqResult<()> {
        if self.is_recording() {
            return Err(SequencerError::AlreadyRecording);
        }
        {
            let mut record = self.shared.record.lock();
            record.buffer.clear();
            record.running_status = 0;
        }
        self.shared.recording.store(true, Ordering::Release);
        let result = self.start();
        if !self.status().is_running() {
            self.shared.recording.store(false, Ordering::Release);
        }
        result
    }

    pub fn stop_recording(&self) {
        self.shared.recording.store(false, Ordering::Release);
    }

    pub fn stop(&mut self) -> SeqResult<()> {
        match self.status() {
            PlayerStatus::Suspended => {
                self.shared.engine.lock().stop_tick = MAX_TICK;
                self.shared.status.set(PlayerStatus::Ready);
                return Ok(());
            }
            PlayerStatus::Playing | PlayerStatus::Exhausted => {}
            _ => return Ok(()),
        }
        self.stop_recording();
        self.join_thread();
        if self.status() == PlayerStatus::Playing {
            let mut engine = self.shared.engine.lock();
            engine.time = self.shared.now() - self.shared.start_time();
        }
        self.stop_sound_in_all_tracks();
        self.shared.status.set(PlayerStatus::Ready);
        self.shared.engine.lock().stop_tick = MAX_TICK;
        tracing::info!("playback stopped");
        Ok(())
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shared.stop_flag.raise();
            if handle.join().is_err() {
                tracing::error!("player thread panicked");
            }
        }
    }

    /// Stops and stays prerolled at the current position
    pub fn suspend(&mut self) -> SeqResult<()> {
        self.stop()?;
        self.shared.status.set(PlayerStatus::Suspended);
        Ok(())
    }

    /// Playback stops once it reaches `tick`. Reset by `stop`.
    pub fn schedule_stop_tick(&self, tick: Tick) {
        self.shared.engine.lock().stop_tick = tick;
    }

    /// Player time in µs; live while playing
    pub fn time(&self) -> MicroTime {
        if self.status() == PlayerStatus::Playing {
            self.shared.now() - self.shared.start_time()
        } else {
            self.shared.engine.lock().time
        }
    }

    /// Player position in ticks; live while playing
    pub fn tick(&self) -> Tick {
        let time = self.time();
        let mut engine = self.shared.engine.lock();
        let mut seq = self.shared.sequence.lock();
        engine.calibrator.time_to_tick(&mut seq, time)
    }

    /// Sends bytes outside the schedule. `time` is player time; `None`
    /// sends immediately.
    pub fn send_raw_midi(&self, destination: DestinationId, bytes: &[u8], time: Option<MicroTime>) -> SeqResult<()> {
        let host = match time {
            Some(time) if time >= 0 => self.shared.output().host_time(time),
            _ => 0,
        };
        self.shared.devices.send(destination, host, bytes)
    }

    /// Runs one scheduling pass without the timer, for hosts that drive
    /// the player themselves
    pub fn send_events_before_tick(&self, now_tick: Tick, prefetch_tick: Tick) -> SeqResult<Tick> {
        let mut engine = self.shared.engine.lock();
        let mut seq = self.shared.sequence.lock();
        let output = self.shared.output();
        let tick = engine.send_events_before_tick(&mut seq, &output, now_tick, prefetch_tick)?;
        if engine.finished_at.is_some() {
            self.shared.recording.store(false, Ordering::Release);
            self.shared.status.set(PlayerStatus::Exhausted);
        }
        Ok(tick)
    }

    pub fn pending_note_off_count(&self) -> usize {
        self.shared.engine.lock().pending_note_off_count()
    }

    /// Sends, at once, the events selected by `types` (every occurrence) and
    /// `last_only` (latest per destination, channel, kind and code) found
    /// before the current position, oldest first
    pub fn backtrack_events(&self, types: &[EventSelector], last_only: &[EventSelector]) -> SeqResult<()> {
        let mut engine = self.shared.engine.lock();
        let mut seq = self.shared.sequence.lock();
        let now = engine.time;
        let tick = engine.calibrator.time_to_tick(&mut seq, now);
        let routes = engine.routes.clone();
        let mut merger = SequenceMerger::new(&mut seq);
        merger.jump_to_tick(&mut seq, tick);

        let mut seen: HashSet<(DestinationId, u8, EventKind, Option<u8>)> = HashSet::new();
        let mut pending: Vec<(DestinationId, Vec<u8>)> = Vec::new();
        while let Some(track_index) = merger.backward(&mut seq) {
            let Some(route) = routes.get(track_index).copied() else {
                continue;
            };
            let Some(destination) = route.destination else {
                continue;
            };
            let Some(event) = merger.current(&seq) else {
                continue;
            };
            if !types.iter().any(|s| s.matches(event)) {
                if !last_only.iter().any(|s| s.matches(event)) {
                    continue;
                }
                let key = (destination, event.channel, event.kind(), event.code());
                if !seen.insert(key) {
                    continue;
                }
            }
            let bytes = match &event.message {
                Message::Sysex(payload) | Message::SysexCont(payload) => payload.as_bytes().to_vec(),
                _ => match event.to_midi_message() {
                    Some(message) => {
                        let mut bytes = message.as_bytes().to_vec();
                        bytes[0] |= route.channel & 0x0f;
                        bytes
                    }
                    None => continue,
                },
            };
            pending.push((destination, bytes));
        }
        merger.release(&mut seq);
        drop(seq);
        drop(engine);

        tracing::debug!(count = pending.len(), tick, "backtracking events");
        for (destination, bytes) in pending.into_iter().rev() {
            if let Err(e) = self.shared.devices.send(destination, 0, &bytes) {
                tracing::warn!(destination, error = %e, "backtrack event dropped");
            }
        }
        Ok(())
    }

    /// Flushes the outputs, forgets pending note-offs and sends All Notes
    /// Off and All Sound Off on every routed channel
    pub fn stop_sound_in_all_tracks(&self) {
        let channels = {
            let mut engine = self.shared.engine.lock();
            for lane in &mut engine.lanes {
                self.shared.devices.flush(Some(lane.destination));
                lane.note_offs.clear();
            }
            let seq = self.shared.sequence.lock();
            engine.routed_channels(&seq)
        };
        for (destination, channel) in channels {
            let status = 0xb0 | channel;
            for bytes in [[status, 0x7b, 0], [status, 0x78, 0]] {
                if let Err(e) = self.shared.devices.send(destination, 0, &bytes) {
                    tracing::debug!(destination, error = %e, "cannot silence destination");
                }
            }
        }
    }

    /// Incoming MIDI: stored while recording, echoed to the thru output
    pub fn handle_input(&self, host_time_us: u64, bytes: &[u8]) -> SeqResult<()> {
        if self.is_recording() {
            let host = MicroTime::try_from(host_time_us).unwrap_or(MicroTime::MAX);
            let time = host - self.shared.start_time();
            self.shared.record.lock().buffer.put(time, bytes)?;
        }
        let config = &self.shared.config;
        if let Some(thru) = self.shared.devices.destination_by_name(&config.thru_destination) {
            let mut echo = bytes.to_vec();
            rechannelize(&mut echo, config.thru_channel);
            self.shared.devices.send(thru, 0, &echo)?;
        }
        Ok(())
    }

    /// Decodes everything recorded so far into events with ticks
    pub fn get_recorded_events(&self) -> SeqResult<Vec<Event>> {
        let mut packets: Vec<(MicroTime, Vec<Event>)> = Vec::new();
        {
            let mut record = self.shared.record.lock();
            let RecordState {
                buffer,
                running_status,
            } = &mut *record;
            while let Some((time, bytes)) = buffer.get()? {
                packets.push((time, decode_packet(bytes, running_status)));
            }
        }
        let mut engine = self.shared.engine.lock();
        let mut seq = self.shared.sequence.lock();
        let mut events = Vec::new();
        for (time, decoded) in packets {
            let tick = engine.calibrator.time_to_tick(&mut seq, time).max(0);
            events.extend(decoded.into_iter().map(|mut e| {
                e.tick = tick;
                e
            }));
        }
        Ok(events)
    }

    /// Recorded events as a track with paired notes
    pub fn take_recorded_track(&self) -> SeqResult<Track> {
        let events = self.get_recorded_events()?;
        let (track, orphans) = assemble_track(events)?;
        if orphans > 0 {
            tracing::warn!(orphans, "recorded note-offs without note-on were dropped");
        }
        Ok(track)
    }

    /// Merges the recorded events into track `index`, or into the track
    /// flagged for recording, or into a new track appended to the sequence.
    /// Returns the index of the track that received them.
    pub fn commit_recorded_events(&self, index: Option<usize>) -> SeqResult<usize> {
        let recorded = self.take_recorded_track()?;
        let index = {
            let mut seq = self.shared.sequence.lock();
            match index.or_else(|| seq.index_of_recording_track()) {
                Some(index) => {
                    let track = seq
                        .track_mut(index)
                        .ok_or(SequencerError::BadIndex(index as i64))?;
                    track.merge(&recorded, None)?;
                    index
                }
                None => seq.insert_track(-1, recorded)?,
            }
        };
        tracing::info!(track = index, "recorded events merged");
        self.refresh_track_destinations()?;
        Ok(index)
    }

    pub fn clear_recorded_events(&self) {
        let mut record = self.shared.record.lock();
        record.buffer.clear();
        record.running_status = 0;
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "player did not stop cleanly");
        }
        self.join_thread();
        let mut engine = self.shared.engine.lock();
        engine.release(&mut self.shared.sequence.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::timing::ManualClock;
    use crate::midi::device::CollectingSink;

    fn one_track_sequence(events: Vec<Event>) -> SharedSequence {
        let mut track = Track::from_events(events).unwrap();
        track.set_device_name("Out");
        let mut seq = Sequence::new(480);
        seq.insert_track(-1, track).unwrap();
        SharedSequence::new(seq)
    }

    fn player_with(sequence: SharedSequence) -> (Player, CollectingSink, ManualClock) {
        let sink = CollectingSink::new();
        let clock = ManualClock::new(0);
        let devices = DeviceContext::new(vec!["Out".to_string()], sink.clone(), clock.clone());
        let player = Player::new(sequence, devices, PlayerConfig::default()).unwrap();
        (player, sink, clock)
    }

    fn bytes_of(sink: &CollectingSink) -> Vec<Vec<u8>> {
        sink.take_messages().into_iter().map(|m| m.bytes).collect()
    }

    #[test]
    fn test_note_on_now_note_off_later() {
        let (player, sink, _) = player_with(one_track_sequence(vec![Event::note(0, 0, 60, 100, 240)]));

        let next = player.send_events_before_tick(0, 100).unwrap();
        assert_eq!(next, 240);
        let sent = sink.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes, vec![0x90, 60, 100]);
        assert_eq!(sent[0].host_time_us, 0);
        assert_eq!(player.pending_note_off_count(), 1);

        player.send_events_before_tick(240, 300).unwrap();
        let sent = sink.take_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bytes, vec![0x80, 60, 0]);
        // 240 ticks at 120 BPM
        assert_eq!(sent[0].host_time_us, 250_000);
        assert_eq!(player.pending_note_off_count(), 0);
    }

    #[test]
    fn test_muted_track_is_silent() {
        let sequence = one_track_sequence(vec![Event::note(0, 0, 60, 100, 240)]);
        sequence.lock().set_mute_flag(0, Some(true));
        let (player, sink, _) = player_with(sequence);
        player.send_events_before_tick(0, 1000).unwrap();
        assert!(sink.messages().is_empty());
        assert_eq!(player.pending_note_off_count(), 0);
    }

    #[test]
    fn test_track_channel_is_ored_in() {
        let sequence = one_track_sequence(vec![Event::control(0, 1, 7, 90)]);
        sequence.lock().track_mut(0).unwrap().set_track_channel(2);
        let (player, sink, _) = player_with(sequence);
        player.refresh_track_destinations().unwrap();
        player.send_events_before_tick(0, 10).unwrap();
        assert_eq!(bytes_of(&sink), vec![vec![0xb3, 7, 90]]);
    }

    #[test]
    fn test_busy_destination_is_retried() {
        let (player, sink, _) = player_with(one_track_sequence(vec![Event::program(0, 0, 5)]));
        sink.set_busy(0, 1);
        let next = player.send_events_before_tick(0, 10).unwrap();
        assert_eq!(next, 0);
        assert!(sink.messages().is_empty());

        player.send_events_before_tick(0, 10).unwrap();
        assert_eq!(bytes_of(&sink), vec![vec![0xc0, 5]]);
    }

    #[test]
    fn test_same_tick_events_are_spaced() {
        let (player, sink, _) = player_with(one_track_sequence(vec![
            Event::control(0, 0, 7, 100),
            Event::control(0, 0, 10, 64),
        ]));
        player.send_events_before_tick(0, 10).unwrap();
        let times: Vec<u64> = sink.messages().iter().map(|m| m.host_time_us).collect();
        assert_eq!(times, vec![0, TIME_STAMP_SPACING as u64]);
    }

    #[test]
    fn test_backtrack_sends_state_oldest_first() {
        let (mut player, sink, _) = player_with(one_track_sequence(vec![
            Event::control(0, 0, 7, 100),
            Event::sysex(10, &[0xf0, 0x7e, 0x7f, 0x09, 0x01, 0xf7]),
            Event::program(50, 0, 5),
            Event::control(100, 0, 7, 90),
            Event::note(500, 0, 60, 100, 10),
        ]));
        player.jump_to_tick(480).unwrap();
        player
            .backtrack_events(&default_backtrack_types(), &default_last_only_types())
            .unwrap();
        assert_eq!(
            bytes_of(&sink),
            vec![
                vec![0xf0, 0x7e, 0x7f, 0x09, 0x01, 0xf7],
                vec![0xc0, 5],
                vec![0xb0, 7, 90],
            ]
        );
        assert!(sink.messages().iter().all(|m| m.host_time_us == 0));
    }

    #[test]
    fn test_stop_sound_silences_used_channels() {
        let (player, sink, _) = player_with(one_track_sequence(vec![
            Event::note(0, 0, 60, 100, 240),
            Event::note(0, 3, 64, 100, 240),
        ]));
        player.send_events_before_tick(0, 10).unwrap();
        sink.take_messages();
        assert_eq!(player.pending_note_off_count(), 2);

        player.stop_sound_in_all_tracks();
        assert_eq!(player.pending_note_off_count(), 0);
        assert_eq!(
            bytes_of(&sink),
            vec![
                vec![0xb0, 0x7b, 0],
                vec![0xb0, 0x78, 0],
                vec![0xb3, 0x7b, 0],
                vec![0xb3, 0x78, 0],
            ]
        );
    }

    #[test]
    fn test_end_marker_flushes_and_exhausts() {
        let (player, sink, _) = player_with(one_track_sequence(vec![Event::note(0, 0, 60, 100, 240)]));
        let duration = player.sequence().lock().duration();
        player
            .shared
            .engine
            .lock()
            .schedule_special_events(duration, false)
            .unwrap();

        player.send_events_before_tick(0, 10).unwrap();
        assert_eq!(player.status(), PlayerStatus::Idle);
        player.send_events_before_tick(duration, duration + 10).unwrap();
        assert_eq!(player.status(), PlayerStatus::Exhausted);
        let sent = bytes_of(&sink);
        assert_eq!(sent.last(), Some(&vec![0x80, 60, 0]));
    }

    #[test]
    fn test_scheduled_stop_tick() {
        let (player, sink, _) = player_with(one_track_sequence(vec![
            Event::program(0, 0, 1),
            Event::program(960, 0, 2),
        ]));
        player.schedule_stop_tick(480);
        let duration = player.sequence().lock().duration();
        player
            .shared
            .engine
            .lock()
            .schedule_special_events(duration, false)
            .unwrap();
        let next = player.send_events_before_tick(0, 2000).unwrap();
        assert_eq!(next, 480);
        assert_eq!(bytes_of(&sink), vec![vec![0xc0, 1]]);
        player.send_events_before_tick(480, 2000).unwrap();
        assert_eq!(player.status(), PlayerStatus::Exhausted);
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_metronome_clicks_while_playing() {
        let sink = CollectingSink::new();
        let devices = DeviceContext::new(
            vec!["Out".to_string(), "Click".to_string()],
            sink.clone(),
            ManualClock::new(0),
        );
        let mut config = PlayerConfig::default();
        config.metronome.destination = "Click".into();
        config.metronome.enable_when_playing = true;
        let player = Player::new(one_track_sequence(Vec::new()), devices, config).unwrap();

        player.send_events_before_tick(0, 480).unwrap();
        let clicks: Vec<(u64, Vec<u8>)> = sink
            .take_messages()
            .into_iter()
            .filter(|m| m.destination == 1)
            .map(|m| (m.host_time_us, m.bytes))
            .collect();
        assert_eq!(
            clicks,
            vec![
                (0, vec![0x99, 76, 127]),
                (80_000, vec![0x99, 76, 0]),
                (500_000, vec![0x99, 77, 100]),
                (580_000, vec![0x99, 77, 0]),
            ]
        );
    }

    #[test]
    fn test_recording_through_input() {
        let (player, sink, _) = player_with(one_track_sequence(Vec::new()));
        player.shared.recording.store(true, Ordering::Release);
        player.handle_input(0, &[0x90, 60, 100]).unwrap();
        player.handle_input(250_000, &[0x80, 60, 0]).unwrap();
        player.stop_recording();
        player.handle_input(300_000, &[0x90, 62, 100]).unwrap();

        let track = player.take_recorded_track().unwrap();
        let events: Vec<&Event> = track.iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tick, 0);
        assert!(matches!(
            events[0].message,
            Message::Note {
                key: 60,
                duration: 240,
                ..
            }
        ));
        // No thru destination configured
        assert!(sink.messages().is_empty());
    }

    #[test]
    fn test_commit_recording_appends_track() {
        let sequence = one_track_sequence(vec![Event::program(0, 0, 1)]);
        let (player, _, _) = player_with(sequence.clone());
        player.shared.recording.store(true, Ordering::Release);
        player.handle_input(500_000, &[0xc0, 9]).unwrap();
        player.stop_recording();

        assert_eq!(player.commit_recorded_events(None).unwrap(), 1);
        let seq = sequence.lock();
        assert_eq!(seq.track_count(), 2);
        let recorded = seq.track(1).unwrap();
        assert_eq!(recorded.number_of_events(), 1);
        assert_eq!(recorded.event_at(0).map(|e| e.tick), Some(480));
    }

    #[test]
    fn test_thru_rechannelizes() {
        let sink = CollectingSink::new();
        let devices = DeviceContext::new(vec!["Out".to_string()], sink.clone(), ManualClock::new(0));
        let config = PlayerConfig {
            thru_destination: "Out".into(),
            thru_channel: 4,
            ..PlayerConfig::default()
        };
        let player = Player::new(one_track_sequence(Vec::new()), devices, config).unwrap();
        player.handle_input(0, &[0x90, 60, 100]).unwrap();
        assert_eq!(bytes_of(&sink), vec![vec![0x94, 60, 100]]);
    }

    #[test]
    fn test_start_and_stop_thread() {
        let (mut player, sink, _) = player_with(one_track_sequence(vec![Event::note(0, 0, 60, 100, 4800)]));
        player.start().unwrap();
        assert_eq!(player.status(), PlayerStatus::Playing);
        player.stop().unwrap();
        assert_eq!(player.status(), PlayerStatus::Ready);
        assert!(sink.messages().iter().any(|m| m.bytes == vec![0xb0, 0x7b, 0]));
        assert!(matches!(player.start_recording(), Ok(())));
        assert!(matches!(
            player.start_recording(),
            Err(SequencerError::AlreadyRecording)
        ));
        player.stop().unwrap();
        assert!(!player.is_recording());
    }

    #[test]
    fn test_drop_releases_cursors() {
        let sequence = one_track_sequence(vec![Event::note(0, 0, 60, 100, 240)]);
        let (player, _, _) = player_with(sequence.clone());
        assert!(sequence.lock().track(0).unwrap().cursor_count() > 0);
        drop(player);
        assert_eq!(sequence.lock().track(0).unwrap().cursor_count(), 0);
        assert_eq!(sequence.lock().attached_calibrator_count(), 0);
    }
}
