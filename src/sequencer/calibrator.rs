// Calibrator - Tick, wall time and bar:beat:tick conversions
// Each unit keeps a bracket of two cursors around the last queried tick, on the
// events of one filter (tempo, time signature or an arbitrary kind/code), and
// the derived value (time in µs, bar number) at both ends of the bracket.

use crate::error::{SeqResult, SequencerError};
use crate::midi::event::{Event, EventKind, MAX_TICK, Message, NEGATIVE_TICK, Tick};
use crate::sequencer::cursor::CursorId;
use crate::sequencer::sequence::Sequence;
use crate::sequencer::timeline::{MusicalTime, Tempo};
use crate::sequencer::track::Track;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Time in microseconds
pub type MicroTime = i64;

/// What a calibrator unit follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibratorFilter {
    /// Tempo events of the conductor track
    Tempo,
    /// Time signature events of the conductor track
    TimeSignature,
    /// Any kind (and optionally code) on a given track; no derived value
    Event {
        track: usize,
        kind: EventKind,
        code: Option<u8>,
    },
}

impl CalibratorFilter {
    pub fn track_index(&self) -> usize {
        match self {
            CalibratorFilter::Tempo | CalibratorFilter::TimeSignature => 0,
            CalibratorFilter::Event { track, .. } => *track,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            CalibratorFilter::Tempo => event.kind() == EventKind::Tempo,
            CalibratorFilter::TimeSignature => event.kind() == EventKind::TimeSignature,
            CalibratorFilter::Event { kind, code, .. } => Track::kind_matches(event, *kind, *code),
        }
    }
}

#[derive(Debug, Clone)]
struct CalibratorUnit {
    filter: CalibratorFilter,
    track_uid: Option<u64>,
    /// Edit generation of the track when the bracket was last reset
    track_edits: u64,
    before: CursorId,
    after: CursorId,
    tick_before: Tick,
    tick_after: Tick,
    data_before: i64,
    data_after: i64,
}

impl CalibratorUnit {
    fn track<'s>(&self, seq: &'s mut Sequence) -> Option<&'s mut Track> {
        let uid = self.track_uid?;
        seq.track_mut(self.filter.track_index())
            .filter(|t| t.uid() == uid)
    }

    fn track_ref<'s>(&self, seq: &'s Sequence) -> Option<&'s Track> {
        let uid = self.track_uid?;
        seq.track(self.filter.track_index())
            .filter(|t| t.uid() == uid)
    }

    fn reset(&mut self, track: Option<&mut Track>) {
        if let Some(track) = track {
            self.track_edits = track.edit_generation();
            track.set_auto_adjust(self.before, true);
            track.set_auto_adjust(self.after, true);
            track.set_position(self.before, -1);
            track.set_position(self.after, -1);
        }
        self.tick_before = NEGATIVE_TICK;
        self.tick_after = NEGATIVE_TICK;
        let reset_value = match self.filter {
            CalibratorFilter::Tempo => -1,
            _ => 0,
        };
        self.data_before = reset_value;
        self.data_after = reset_value;
    }

    fn tempo_before(&self, track: &Track) -> Tempo {
        match track.current(self.before).map(|e| &e.message) {
            Some(Message::Tempo(tempo)) => *tempo,
            _ => Tempo::default(),
        }
    }

    /// Wall time of `tick`, extrapolated from the start of the bracket
    fn calculate_time(&self, track: &Track, tick: Tick, timebase: i64) -> MicroTime {
        let (tick_before, time_before, tempo) = if self.tick_before >= 0 {
            (self.tick_before, self.data_before, self.tempo_before(track))
        } else {
            (0, 0, Tempo::default())
        };
        let delta = tempo.ticks_to_micros((tick - tick_before) as f64, timebase);
        time_before + (0.5 + delta).floor() as MicroTime
    }

    /// (ticks per beat, beats per bar, signature event found)
    fn signature_before(&self, track: &Track, timebase: i64) -> (i64, i64, bool) {
        match track.current(self.before).map(|e| &e.message) {
            Some(Message::TimeSignature(sig)) => {
                (sig.ticks_per_beat(timebase), sig.beats_per_bar(), true)
            }
            _ => (timebase, 4, false),
        }
    }

    /// Bar, beat (1-based) and tick in beat of `tick`, from the start of the
    /// bracket. Without a signature event, bar 1 starts at tick 0 in 4/4.
    fn measure_without_jump(&self, track: &Track, tick: Tick, timebase: i64) -> (i64, i64, i64) {
        let (ticks_per_beat, beats_per_bar, found) = self.signature_before(track, timebase);
        if ticks_per_beat == 0 || beats_per_bar == 0 {
            return (0, 0, 0);
        }
        let (tick_before, bar_before) = if found {
            (self.tick_before, self.data_before)
        } else {
            (0, 1)
        };
        let beat = (tick - tick_before) / ticks_per_beat;
        (
            bar_before + beat / beats_per_bar,
            beat % beats_per_bar + 1,
            (tick - tick_before) - beat * ticks_per_beat,
        )
    }

    /// Bar number carried by a signature at `tick`. A signature that does
    /// not fall on a bar line starts the next bar.
    fn bar_at_signature(&self, track: &Track, tick: Tick, timebase: i64) -> i64 {
        let (measure, beat, rest) = self.measure_without_jump(track, tick, timebase);
        if measure != 0 && (beat > 1 || rest > 0) {
            measure + 1
        } else {
            measure
        }
    }

    fn forward(&mut self, track: &mut Track, timebase: i64) -> bool {
        if self.tick_after == MAX_TICK {
            return false;
        }
        let after_position = track.cursor_position(self.after);
        track.set_position(self.before, after_position);
        self.tick_before = self.tick_after;
        let filter = self.filter;
        self.tick_after = track
            .forward_with_selector(self.after, |e| filter.matches(e))
            .map_or(MAX_TICK, |e| e.tick);
        self.data_before = self.data_after;
        if self.tick_after == MAX_TICK {
            self.data_after = i64::MAX;
            return true;
        }
        match self.filter {
            CalibratorFilter::Tempo => {
                self.data_after = self.calculate_time(track, self.tick_after, timebase);
            }
            CalibratorFilter::TimeSignature => {
                self.data_after = self.bar_at_signature(track, self.tick_after, timebase);
            }
            CalibratorFilter::Event { .. } => {}
        }
        true
    }

    /// Mirror of `forward`: the value at the new start of the bracket is
    /// solved from the value at its end
    fn backward(&mut self, track: &mut Track, timebase: i64) -> bool {
        if self.tick_before == NEGATIVE_TICK {
            return false;
        }
        let before_position = track.cursor_position(self.before);
        track.set_position(self.after, before_position);
        self.tick_after = self.tick_before;
        let filter = self.filter;
        self.tick_before = track
            .backward_with_selector(self.before, |e| filter.matches(e))
            .map_or(NEGATIVE_TICK, |e| e.tick);
        self.data_after = self.data_before;
        match self.filter {
            CalibratorFilter::Tempo => {
                self.data_before = 0;
                let time = self.calculate_time(track, self.tick_after, timebase);
                self.data_before += self.data_after - time;
            }
            CalibratorFilter::TimeSignature => {
                self.data_before = 1;
                let bar = self.bar_at_signature(track, self.tick_after, timebase);
                self.data_before += self.data_after - bar;
            }
            CalibratorFilter::Event { .. } => {}
        }
        true
    }

    fn jump_to_tick(&mut self, track: &mut Track, tick: Tick, timebase: i64) {
        let tick = tick.min(MAX_TICK);
        if tick >= self.tick_after {
            if tick == MAX_TICK {
                while self.forward(track, timebase) && self.tick_after < MAX_TICK {}
            } else {
                while self.forward(track, timebase) && tick >= self.tick_after {}
            }
        } else if tick < self.tick_before {
            if tick < 0 {
                while self.backward(track, timebase) && self.tick_before >= 0 {}
            } else {
                while self.backward(track, timebase) && tick < self.tick_before {}
            }
        }
    }

    fn jump_to_position(&mut self, track: &mut Track, position: i64, timebase: i64) {
        let num = track.number_of_events() as i64;
        if position >= track.cursor_position(self.after) {
            if position >= num {
                while self.forward(track, timebase) && self.tick_after < MAX_TICK {}
            } else {
                while self.forward(track, timebase)
                    && position >= track.cursor_position(self.after)
                {}
            }
        } else if position < track.cursor_position(self.before) {
            if position < 0 {
                while self.backward(track, timebase) && self.tick_before >= 0 {}
            } else {
                while self.backward(track, timebase)
                    && position < track.cursor_position(self.before)
                {}
            }
        }
    }
}

/// Converts between ticks, microseconds and bar:beat:tick for a sequence.
///
/// The calibrator is attached to its sequence; inserting, deleting or
/// replacing tracks makes it reseek from scratch on the next query. Call
/// [`Calibrator::release`] to unregister its cursors when done.
#[derive(Debug)]
pub struct Calibrator {
    units: Vec<CalibratorUnit>,
    invalidated: Arc<AtomicBool>,
}

impl Calibrator {
    pub fn new(seq: &mut Sequence, filter: CalibratorFilter) -> SeqResult<Self> {
        let mut calibrator = Self {
            units: Vec::new(),
            invalidated: seq.attach_calibrator(),
        };
        calibrator.append(seq, filter)?;
        Ok(calibrator)
    }

    /// Calibrator answering both time and measure queries
    pub fn for_playback(seq: &mut Sequence) -> SeqResult<Self> {
        let mut calibrator = Self::new(seq, CalibratorFilter::Tempo)?;
        calibrator.append(seq, CalibratorFilter::TimeSignature)?;
        Ok(calibrator)
    }

    /// Adds a filter; no-op when it is already supported
    pub fn append(&mut self, seq: &mut Sequence, filter: CalibratorFilter) -> SeqResult<()> {
        if self.is_supporting(&filter) {
            return Ok(());
        }
        let index = filter.track_index();
        let track = match seq.track_mut(index) {
            Some(track) => track,
            None if matches!(filter, CalibratorFilter::Event { .. }) => {
                return Err(SequencerError::BadIndex(index as i64));
            }
            None => {
                // Conductor track missing: behaves as an empty one
                self.units.push(Self::detached_unit(filter));
                return Ok(());
            }
        };
        let mut unit = CalibratorUnit {
            filter,
            track_uid: Some(track.uid()),
            track_edits: track.edit_generation(),
            before: track.new_cursor(),
            after: track.new_cursor(),
            tick_before: NEGATIVE_TICK,
            tick_after: NEGATIVE_TICK,
            data_before: 0,
            data_after: 0,
        };
        unit.reset(Some(track));
        self.units.push(unit);
        Ok(())
    }

    fn detached_unit(filter: CalibratorFilter) -> CalibratorUnit {
        let mut unit = CalibratorUnit {
            filter,
            track_uid: None,
            track_edits: 0,
            before: CursorId::DANGLING,
            after: CursorId::DANGLING,
            tick_before: NEGATIVE_TICK,
            tick_after: NEGATIVE_TICK,
            data_before: 0,
            data_after: 0,
        };
        unit.reset(None);
        unit
    }

    pub fn is_supporting(&self, filter: &CalibratorFilter) -> bool {
        self.units.iter().any(|u| u.filter == *filter)
    }

    pub fn filters(&self) -> impl Iterator<Item = CalibratorFilter> + '_ {
        self.units.iter().map(|u| u.filter)
    }

    pub fn remove_at(&mut self, seq: &mut Sequence, index: usize) -> SeqResult<CalibratorFilter> {
        if index >= self.units.len() {
            return Err(SequencerError::BadIndex(index as i64));
        }
        let unit = self.units.remove(index);
        if let Some(track) = unit.track(seq) {
            track.release_cursor(unit.before);
            track.release_cursor(unit.after);
        }
        Ok(unit.filter)
    }

    /// Moves every bracket back before the first event
    pub fn reset(&mut self, seq: &mut Sequence) {
        for unit in &mut self.units {
            let track = unit.track(seq);
            unit.reset(track);
        }
    }

    /// Rebinds units whose track went away, then resets when the sequence
    /// changed since the last query
    fn sync(&mut self, seq: &mut Sequence) {
        let changed = self.invalidated.swap(false, Ordering::AcqRel);
        let moved = self
            .units
            .iter()
            .any(|u| u.track_ref(seq).is_none() && seq.track(u.filter.track_index()).is_some());
        let edited = self
            .units
            .iter()
            .any(|u| u.track_ref(seq).is_some_and(|t| t.edit_generation() != u.track_edits));
        if !changed && !moved && !edited {
            return;
        }
        for unit in &mut self.units {
            if unit.track_ref(seq).is_some() {
                continue;
            }
            // The old track may still be in the sequence at another index
            if let Some(old) = unit
                .track_uid
                .and_then(|uid| seq.index_of_track_uid(uid))
                .and_then(|i| seq.track_mut(i))
            {
                old.release_cursor(unit.before);
                old.release_cursor(unit.after);
            }
            match seq.track_mut(unit.filter.track_index()) {
                Some(track) => {
                    unit.track_uid = Some(track.uid());
                    unit.before = track.new_cursor();
                    unit.after = track.new_cursor();
                }
                None => unit.track_uid = None,
            }
        }
        tracing::debug!(units = self.units.len(), "calibrator reset after sequence change");
        self.reset(seq);
    }

    /// Brings every bracket around `tick`
    pub fn jump_to_tick(&mut self, seq: &mut Sequence, tick: Tick) {
        self.sync(seq);
        let timebase = seq.timebase();
        for unit in &mut self.units {
            if let Some(track) = unit.track(seq) {
                unit.jump_to_tick(track, tick, timebase);
            }
        }
    }

    /// Brings every bracket around the event at `position` of track
    /// `track_index`. Units on other tracks follow the event's tick.
    pub fn jump_to_position_in_track(&mut self, seq: &mut Sequence, position: i64, track_index: usize) {
        self.sync(seq);
        let timebase = seq.timebase();
        let tick = if position < 0 {
            NEGATIVE_TICK
        } else {
            seq.track(track_index)
                .and_then(|t| t.event_at(position))
                .map_or(MAX_TICK, |e| e.tick)
        };
        for unit in &mut self.units {
            let same_track = unit.filter.track_index() == track_index;
            if let Some(track) = unit.track(seq) {
                if same_track {
                    unit.jump_to_position(track, position, timebase);
                } else {
                    unit.jump_to_tick(track, tick, timebase);
                }
            }
        }
    }

    fn unit_index(&self, filter: CalibratorFilter) -> Option<usize> {
        self.units.iter().position(|u| u.filter == filter)
    }

    /// Tick of bar `measure`, beat `beat` (both 1-based), plus `tick`.
    /// `None` for bars before the first.
    pub fn measure_to_tick(
        &mut self,
        seq: &mut Sequence,
        measure: i64,
        beat: i64,
        tick: Tick,
    ) -> Option<Tick> {
        if measure < 1 {
            return None;
        }
        self.sync(seq);
        let timebase = seq.timebase();
        let Some(i) = self.unit_index(CalibratorFilter::TimeSignature) else {
            let result = tick + ((beat - 1) + (measure - 1) * 4) * timebase;
            return Some(result.min(MAX_TICK));
        };
        let unit = &mut self.units[i];
        let Some(track) = unit.track(seq) else {
            let result = tick + ((beat - 1) + (measure - 1) * 4) * timebase;
            return Some(result.min(MAX_TICK));
        };
        if measure >= unit.data_after {
            while unit.forward(track, timebase) && measure >= unit.data_after {}
        } else if measure < unit.data_before {
            while unit.backward(track, timebase) && measure < unit.data_before {}
        }
        let (ticks_per_beat, beats_per_bar, found) = unit.signature_before(track, timebase);
        let (bar_before, tick_before) = if found {
            (unit.data_before, unit.tick_before)
        } else {
            (1, 0)
        };
        let result =
            tick_before + tick + ((beat - 1) + (measure - bar_before) * beats_per_bar) * ticks_per_beat;
        Some(result.min(MAX_TICK))
    }

    /// Bar:beat:tick of `tick`
    pub fn tick_to_measure(&mut self, seq: &mut Sequence, tick: Tick) -> MusicalTime {
        self.jump_to_tick(seq, tick);
        let timebase = seq.timebase();
        let found = self
            .unit_index(CalibratorFilter::TimeSignature)
            .and_then(|i| {
                let unit = &self.units[i];
                unit.track_ref(seq)
                    .map(|track| unit.measure_without_jump(track, tick, timebase))
            });
        let (bar, beat, rest) = found.unwrap_or_else(|| {
            let beat = tick / timebase;
            (1 + beat / 4, beat % 4 + 1, tick - beat * timebase)
        });
        MusicalTime::new(bar as i32, beat as i32, rest as i32)
    }

    /// Tempo in effect at the start of the tempo bracket
    pub fn tempo(&self, seq: &Sequence) -> Tempo {
        self.unit_index(CalibratorFilter::Tempo)
            .and_then(|i| {
                let unit = &self.units[i];
                unit.track_ref(seq).map(|track| unit.tempo_before(track))
            })
            .unwrap_or_default()
    }

    /// Tempo in effect at `tick`
    pub fn tempo_at(&mut self, seq: &mut Sequence, tick: Tick) -> Tempo {
        self.jump_to_tick(seq, tick);
        self.tempo(seq)
    }

    /// Wall time in µs since tick 0. Without a tempo unit, 120 BPM throughout.
    pub fn tick_to_time(&mut self, seq: &mut Sequence, tick: Tick) -> MicroTime {
        self.sync(seq);
        let timebase = seq.timebase();
        let Some(i) = self.unit_index(CalibratorFilter::Tempo) else {
            let delta = Tempo::default().ticks_to_micros(tick as f64, timebase);
            return (0.5 + delta).floor() as MicroTime;
        };
        let unit = &mut self.units[i];
        match unit.track(seq) {
            Some(track) => {
                unit.jump_to_tick(track, tick, timebase);
                unit.calculate_time(track, tick, timebase)
            }
            None => {
                let delta = Tempo::default().ticks_to_micros(tick as f64, timebase);
                (0.5 + delta).floor() as MicroTime
            }
        }
    }

    /// Tick at wall time `time` µs
    pub fn time_to_tick(&mut self, seq: &mut Sequence, time: MicroTime) -> Tick {
        self.sync(seq);
        let timebase = seq.timebase();
        let Some(i) = self.unit_index(CalibratorFilter::Tempo) else {
            let ticks = Tempo::default().micros_to_ticks(time as f64, timebase);
            return (0.5 + ticks).floor() as Tick;
        };
        let unit = &mut self.units[i];
        let Some(track) = unit.track(seq) else {
            let ticks = Tempo::default().micros_to_ticks(time as f64, timebase);
            return (0.5 + ticks).floor() as Tick;
        };
        if time >= unit.data_after {
            while unit.forward(track, timebase) && time >= unit.data_after {}
        } else if time < unit.data_before {
            while unit.backward(track, timebase) && time < unit.data_before {}
        }
        let (tick_before, time_before) = if unit.tick_before >= 0 {
            (unit.tick_before, unit.data_before)
        } else {
            (0, 0)
        };
        let tempo = unit.tempo_before(track);
        let ticks = tempo.micros_to_ticks((time - time_before) as f64, timebase);
        tick_before + (0.5 + ticks).floor() as Tick
    }

    /// Event at the start of the bracket of `filter`
    pub fn event_before<'s>(&self, seq: &'s Sequence, filter: CalibratorFilter) -> Option<&'s Event> {
        let unit = &self.units[self.unit_index(filter)?];
        unit.track_ref(seq)?.current(unit.before)
    }

    /// Event at the end of the bracket of `filter`
    pub fn next_event<'s>(&self, seq: &'s Sequence, filter: CalibratorFilter) -> Option<&'s Event> {
        let unit = &self.units[self.unit_index(filter)?];
        unit.track_ref(seq)?.current(unit.after)
    }

    /// Position of the event at the start of the bracket, -1 when none
    pub fn event_position(&self, seq: &Sequence, filter: CalibratorFilter) -> i64 {
        self.unit_index(filter)
            .and_then(|i| {
                let unit = &self.units[i];
                unit.track_ref(seq).map(|t| t.cursor_position(unit.before))
            })
            .unwrap_or(-1)
    }

    /// Independent calibrator with the same brackets
    pub fn duplicate(&self, seq: &mut Sequence) -> SeqResult<Self> {
        let mut units = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let mut copy = unit.clone();
            if let Some(track) = unit.track(seq) {
                copy.before = track.duplicate_cursor(unit.before)?;
                copy.after = track.duplicate_cursor(unit.after)?;
            }
            units.push(copy);
        }
        let invalidated = seq.attach_calibrator();
        invalidated.store(self.invalidated.load(Ordering::Acquire), Ordering::Release);
        Ok(Self { units, invalidated })
    }

    /// Unregisters cursors and detaches from the sequence. The calibrator
    /// answers nothing useful afterwards.
    pub fn release(&mut self, seq: &mut Sequence) {
        for unit in self.units.drain(..) {
            if let Some(track) = unit.track(seq) {
                track.release_cursor(unit.before);
                track.release_cursor(unit.after);
            }
        }
        seq.detach_calibrator(&self.invalidated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::timeline::TimeSignature;

    fn conductor(events: Vec<Event>) -> Sequence {
        let mut seq = Sequence::new(480);
        seq.insert_track(-1, Track::from_events(events).unwrap())
            .unwrap();
        seq
    }

    #[test]
    fn test_single_tempo() {
        let mut seq = conductor(vec![Event::tempo(0, 120.0)]);
        let mut calib = Calibrator::new(&mut seq, CalibratorFilter::Tempo).unwrap();
        assert_eq!(calib.tick_to_time(&mut seq, 480), 500_000);
        assert_eq!(calib.time_to_tick(&mut seq, 500_000), 480);
        assert_eq!(calib.tick_to_time(&mut seq, 0), 0);
    }

    #[test]
    fn test_tempo_change_forward_and_back() {
        let mut seq = conductor(vec![Event::tempo(0, 120.0), Event::tempo(960, 60.0)]);
        let mut calib = Calibrator::new(&mut seq, CalibratorFilter::Tempo).unwrap();
        assert_eq!(calib.tick_to_time(&mut seq, 1440), 2_000_000);
        assert_eq!(calib.tempo(&seq).bpm(), 60.0);
        // Back across the change
        assert_eq!(calib.tick_to_time(&mut seq, 480), 500_000);
        assert_eq!(calib.tempo(&seq).bpm(), 120.0);
        assert_eq!(calib.time_to_tick(&mut seq, 1_500_000), 1200);
    }

    #[test]
    fn test_no_tempo_events_defaults_to_120() {
        let mut seq = conductor(vec![]);
        let mut calib = Calibrator::new(&mut seq, CalibratorFilter::Tempo).unwrap();
        assert_eq!(calib.tick_to_time(&mut seq, 960), 1_000_000);
        assert_eq!(calib.time_to_tick(&mut seq, 250_000), 240);
    }

    #[test]
    fn test_measures_in_three_four() {
        let mut seq = conductor(vec![Event::time_signature(0, TimeSignature::three_four())]);
        let mut calib = Calibrator::new(&mut seq, CalibratorFilter::TimeSignature).unwrap();
        assert_eq!(calib.tick_to_measure(&mut seq, 0), MusicalTime::new(1, 1, 0));
        assert_eq!(calib.tick_to_measure(&mut seq, 1500), MusicalTime::new(2, 1, 60));
        assert_eq!(calib.measure_to_tick(&mut seq, 3, 2, 10), Some(3370));
        assert_eq!(calib.measure_to_tick(&mut seq, 0, 1, 0), None);
    }

    #[test]
    fn test_signature_mid_bar_starts_next_bar() {
        let mut seq = conductor(vec![Event::time_signature(240, TimeSignature::three_four())]);
        let mut calib = Calibrator::new(&mut seq, CalibratorFilter::TimeSignature).unwrap();
        assert_eq!(calib.tick_to_measure(&mut seq, 100), MusicalTime::new(1, 1, 100));
        assert_eq!(calib.tick_to_measure(&mut seq, 240), MusicalTime::new(2, 1, 0));
        assert_eq!(calib.measure_to_tick(&mut seq, 3, 1, 0), Some(240 + 1440));
        // And back before the signature
        assert_eq!(calib.measure_to_tick(&mut seq, 1, 1, 0), Some(0));
    }

    #[test]
    fn test_track_change_resets() {
        let mut seq = conductor(vec![Event::tempo(0, 60.0)]);
        let mut calib = Calibrator::new(&mut seq, CalibratorFilter::Tempo).unwrap();
        assert_eq!(calib.tick_to_time(&mut seq, 480), 1_000_000);

        let faster = Track::from_events(vec![Event::tempo(0, 240.0)]).unwrap();
        let old = seq.replace_track(0, faster).unwrap();
        assert_eq!(old.cursor_count(), 2);
        assert_eq!(calib.tick_to_time(&mut seq, 480), 250_000);
        assert_eq!(seq.track(0).unwrap().cursor_count(), 2);

        calib.release(&mut seq);
        assert_eq!(seq.track(0).unwrap().cursor_count(), 0);
        assert_eq!(seq.attached_calibrator_count(), 0);
    }

    #[test]
    fn test_event_filter() {
        let mut seq = conductor(vec![Event::tempo(0, 120.0)]);
        let keys = Track::from_events(vec![
            Event::new(0, 17, Message::Key { sharps: 2, minor: false }),
            Event::new(960, 17, Message::Key { sharps: -3, minor: true }),
        ])
        .unwrap();
        seq.insert_track(-1, keys).unwrap();
        let filter = CalibratorFilter::Event {
            track: 1,
            kind: EventKind::Key,
            code: None,
        };
        let mut calib = Calibrator::new(&mut seq, CalibratorFilter::Tempo).unwrap();
        calib.append(&mut seq, filter).unwrap();
        assert!(calib.is_supporting(&filter));

        calib.jump_to_tick(&mut seq, 1000);
        let key = calib.event_before(&seq, filter).map(|e| e.message.clone());
        assert_eq!(key, Some(Message::Key { sharps: -3, minor: true }));
        assert_eq!(calib.event_position(&seq, filter), 1);

        calib.jump_to_position_in_track(&mut seq, 0, 1);
        assert_eq!(calib.event_position(&seq, filter), 0);
        assert_eq!(calib.next_event(&seq, filter).map(|e| e.tick), Some(960));

        assert_eq!(calib.remove_at(&mut seq, 1).unwrap(), filter);
        assert!(!calib.is_supporting(&filter));
    }
}
