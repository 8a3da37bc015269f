// Merger - Several tracks read as one time-ordered stream
// Each step scans every cursor for the extremal tick. The number of tracks is
// small, so a linear scan is used instead of a heap.

use crate::error::SeqResult;
use crate::midi::event::{Event, MAX_TICK, NEGATIVE_TICK, Tick};
use crate::sequencer::cursor::CursorId;
use crate::sequencer::sequence::Sequence;
use crate::sequencer::track::Track;

#[derive(Debug, Clone)]
struct MergerEntry {
    track_index: usize,
    track_uid: u64,
    cursor: Option<CursorId>,
    /// Tick of the event under the cursor, `MAX_TICK` when exhausted
    tick: Tick,
    /// Tick of the event before the cursor, `NEGATIVE_TICK` at the start
    last_tick: Tick,
    /// Events of tick `last_tick` right before the cursor
    run: usize,
    /// Edit generation of the track the cached ticks were read at
    edits: u64,
}

impl MergerEntry {
    /// Re-reads the cached ticks from the cursor
    fn settle(&mut self, track: &Track, cursor: CursorId) {
        let position = track.cursor_position(cursor);
        self.tick = track.current(cursor).map_or(MAX_TICK, |e| e.tick);
        self.last_tick = track.tick_at(position - 1).unwrap_or(NEGATIVE_TICK);
        self.run = 0;
        let mut p = position - 1;
        while self.last_tick > NEGATIVE_TICK && track.tick_at(p) == Some(self.last_tick) {
            self.run += 1;
            p -= 1;
        }
        self.edits = track.edit_generation();
    }

    fn advance(&mut self, track: &mut Track, cursor: CursorId) {
        let passed = self.tick;
        let next = track.forward(cursor).map_or(MAX_TICK, |e| e.tick);
        self.run = if passed == self.last_tick { self.run + 1 } else { 1 };
        self.last_tick = passed;
        self.tick = next;
    }

    /// After an edit, puts the cursor back on the first event not yet
    /// passed. Auto-adjust alone can carry the cursor over an event
    /// inserted at its own position.
    fn resync(&mut self, track: &mut Track, cursor: CursorId) {
        if self.last_tick == NEGATIVE_TICK {
            track.jump_to_tick(cursor, 0);
        } else if self.tick == self.last_tick {
            // Stopped inside a group of equal ticks
            track.jump_to_tick(cursor, self.last_tick);
            for _ in 0..self.run {
                if !track.current(cursor).is_some_and(|e| e.tick == self.last_tick) {
                    break;
                }
                track.forward(cursor);
            }
        } else {
            track.jump_to_tick(cursor, self.last_tick + 1);
        }
        self.settle(track, cursor);
    }
}

/// Merges the tracks of a sequence (or a subset of them) for playback
#[derive(Debug, Clone)]
pub struct SequenceMerger {
    entries: Vec<MergerEntry>,
    current: Option<usize>,
    tick: Tick,
}

impl SequenceMerger {
    /// Merger over every track of the sequence
    pub fn new(seq: &mut Sequence) -> Self {
        let all: Vec<usize> = (0..seq.track_count()).collect();
        Self::with_tracks(seq, &all)
    }

    /// Merger over the listed tracks; ties go to the earlier entry
    pub fn with_tracks(seq: &mut Sequence, track_indices: &[usize]) -> Self {
        let mut merger = Self {
            entries: Vec::with_capacity(track_indices.len()),
            current: None,
            tick: NEGATIVE_TICK,
        };
        for &track_index in track_indices {
            let Some(track) = seq.track_mut(track_index) else {
                continue;
            };
            let cursor = track.new_cursor();
            merger.entries.push(MergerEntry {
                track_index,
                track_uid: track.uid(),
                cursor: Some(cursor),
                tick: MAX_TICK,
                last_tick: NEGATIVE_TICK,
                run: 0,
                edits: track.edit_generation(),
            });
        }
        merger.reset(seq);
        merger
    }

    /// Track indices covered by this merger
    pub fn track_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|e| e.track_index)
    }

    fn entry_track<'s>(entry: &MergerEntry, seq: &'s mut Sequence) -> Option<&'s mut Track> {
        seq.track_mut(entry.track_index)
            .filter(|t| t.uid() == entry.track_uid)
    }

    /// Entries whose track was deleted or replaced drop out of the stream
    fn prune_stale(&mut self, seq: &Sequence) {
        for entry in &mut self.entries {
            let alive = seq
                .track(entry.track_index)
                .is_some_and(|t| t.uid() == entry.track_uid);
            if !alive {
                entry.tick = MAX_TICK;
                entry.last_tick = NEGATIVE_TICK;
                entry.run = 0;
            }
        }
    }

    /// Rewinds every cursor to the first event
    pub fn reset(&mut self, seq: &mut Sequence) {
        for entry in &mut self.entries {
            match (entry.cursor, Self::entry_track(entry, seq)) {
                (Some(cursor), Some(track)) => {
                    track.set_auto_adjust(cursor, true);
                    track.set_position(cursor, 0);
                    entry.settle(track, cursor);
                }
                _ => {
                    entry.tick = MAX_TICK;
                    entry.last_tick = NEGATIVE_TICK;
                    entry.run = 0;
                }
            }
        }
        self.tick = NEGATIVE_TICK;
        self.current = None;
    }

    /// Positions every cursor at the first event with tick >= `tick`.
    /// The merger then points at the earliest of them.
    pub fn jump_to_tick(&mut self, seq: &mut Sequence, tick: Tick) {
        self.prune_stale(seq);
        let mut best: Option<usize> = None;
        let mut best_tick = MAX_TICK;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let (Some(cursor), Some(track)) = (entry.cursor, Self::entry_track(entry, seq)) else {
                entry.tick = MAX_TICK;
                entry.last_tick = NEGATIVE_TICK;
                entry.run = 0;
                continue;
            };
            track.jump_to_tick(cursor, tick);
            entry.settle(track, cursor);
            if entry.tick < best_tick {
                best_tick = entry.tick;
                best = Some(i);
            }
        }
        self.current = best;
        self.tick = best_tick;
    }

    /// Event at the merged position
    pub fn current<'s>(&self, seq: &'s Sequence) -> Option<&'s Event> {
        let entry = &self.entries[self.current?];
        let track = seq
            .track(entry.track_index)
            .filter(|t| t.uid() == entry.track_uid)?;
        track.current(entry.cursor?)
    }

    /// Catches up with tracks edited since the last step: their cursors go
    /// back to the first event not yet passed, and the merged position is
    /// picked again. Returns whether anything was edited.
    pub fn refresh(&mut self, seq: &mut Sequence) -> bool {
        self.prune_stale(seq);
        let edited = self.resync_edited(seq);
        if edited && self.tick > NEGATIVE_TICK {
            self.pick_earliest();
        }
        edited
    }

    fn resync_edited(&mut self, seq: &mut Sequence) -> bool {
        let mut edited = false;
        for entry in &mut self.entries {
            let (Some(cursor), Some(track)) = (entry.cursor, Self::entry_track(entry, seq)) else {
                continue;
            };
            if track.edit_generation() != entry.edits {
                entry.resync(track, cursor);
                edited = true;
            }
        }
        if edited {
            tracing::trace!(tracks = self.entries.len(), "merger resynced after track edit");
        }
        edited
    }

    /// Advances the track holding the current event, then picks the
    /// earliest event over all tracks. Returns the track index.
    pub fn forward(&mut self, seq: &mut Sequence) -> Option<usize> {
        self.prune_stale(seq);
        if let Some(i) = self.current {
            let entry = &mut self.entries[i];
            if let (Some(cursor), Some(track)) = (entry.cursor, Self::entry_track(entry, seq)) {
                if track.edit_generation() == entry.edits {
                    entry.advance(track, cursor);
                } else {
                    // The event at the merged position counts as passed
                    entry.run = if entry.tick == entry.last_tick { entry.run + 1 } else { 1 };
                    entry.last_tick = entry.tick;
                    entry.resync(track, cursor);
                }
            }
        }
        self.resync_edited(seq);
        self.pick_earliest()
    }

    fn pick_earliest(&mut self) -> Option<usize> {
        let best = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.tick < MAX_TICK)
            .min_by_key(|(i, e)| (e.tick, *i))
            .map(|(i, e)| (i, e.tick));
        match best {
            Some((i, tick)) => {
                self.current = Some(i);
                self.tick = tick;
                Some(self.entries[i].track_index)
            }
            None => {
                self.current = None;
                self.tick = MAX_TICK;
                None
            }
        }
    }

    /// Steps back to the latest event before the merged position.
    /// Returns the track index.
    pub fn backward(&mut self, seq: &mut Sequence) -> Option<usize> {
        if self.tick == NEGATIVE_TICK {
            return None;
        }
        self.prune_stale(seq);
        self.resync_edited(seq);
        // Latest previous event; on ties the later entry goes first
        let best = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.last_tick > NEGATIVE_TICK)
            .max_by_key(|(i, e)| (e.last_tick, *i))
            .map(|(i, _)| i);
        let Some(i) = best else {
            self.tick = NEGATIVE_TICK;
            self.current = None;
            return None;
        };
        let entry = &mut self.entries[i];
        if let (Some(cursor), Some(track)) = (entry.cursor, Self::entry_track(entry, seq)) {
            if track.backward(cursor).is_some() {
                entry.settle(track, cursor);
            }
        }
        self.current = Some(i);
        self.tick = self.entries[i].tick;
        Some(self.entries[i].track_index)
    }

    /// Track index of the current event
    pub fn current_track(&self) -> Option<usize> {
        self.current.map(|i| self.entries[i].track_index)
    }

    /// Position of the current event inside its track, -1 when none
    pub fn current_position_in_track(&self, seq: &Sequence) -> i64 {
        let Some(entry) = self.current.map(|i| &self.entries[i]) else {
            return -1;
        };
        match (entry.cursor, seq.track(entry.track_index)) {
            (Some(cursor), Some(track)) if track.uid() == entry.track_uid => {
                track.cursor_position(cursor)
            }
            _ => -1,
        }
    }

    /// Tick of the current event; `MAX_TICK` past the end, -1 before start
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Independent copy positioned at the same place
    pub fn duplicate(&self, seq: &mut Sequence) -> SeqResult<Self> {
        let mut copy = self.clone();
        for entry in &mut copy.entries {
            let cursor = match (entry.cursor, Self::entry_track(entry, seq)) {
                (Some(cursor), Some(track)) => Some(track.duplicate_cursor(cursor)?),
                _ => None,
            };
            entry.cursor = cursor;
        }
        Ok(copy)
    }

    /// Unregisters the cursors from their tracks
    pub fn release(&mut self, seq: &mut Sequence) {
        for entry in &mut self.entries {
            if let Some(cursor) = entry.cursor.take() {
                if let Some(track) = Self::entry_track(entry, seq) {
                    track.release_cursor(cursor);
                }
            }
        }
        self.current = None;
    }
}

/// Free-standing merger over tracks it owns. Equal ticks are resolved by
/// a caller-supplied priority order over the tracks.
#[derive(Debug, Default)]
pub struct TrackMerger {
    tracks: Vec<(Track, CursorId)>,
    priority: Vec<usize>,
    current: Option<usize>,
}

impl TrackMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a track with its cursor on the first event; returns the track count
    pub fn add_track(&mut self, mut track: Track) -> usize {
        let cursor = track.new_cursor();
        track.set_position(cursor, 0);
        self.priority.push(self.tracks.len());
        self.tracks.push((track, cursor));
        self.tracks.len()
    }

    pub fn remove_track(&mut self, index: usize) -> Option<Track> {
        if index >= self.tracks.len() {
            return None;
        }
        let (mut track, cursor) = self.tracks.remove(index);
        track.release_cursor(cursor);
        self.priority.retain(|&p| p != index);
        for p in &mut self.priority {
            if *p > index {
                *p -= 1;
            }
        }
        self.current = match self.current {
            Some(c) if c == index => None,
            Some(c) if c > index => Some(c - 1),
            other => other,
        };
        Some(track)
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index).map(|(t, _)| t)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Orders tracks for equal ticks; indices not listed keep their
    /// insertion order after the listed ones
    pub fn set_tie_break(&mut self, order: &[usize]) {
        let mut priority: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&i| i < self.tracks.len())
            .collect();
        priority.dedup();
        for i in 0..self.tracks.len() {
            if !priority.contains(&i) {
                priority.push(i);
            }
        }
        self.priority = priority;
    }

    fn rank(&self, index: usize) -> usize {
        self.priority
            .iter()
            .position(|&p| p == index)
            .unwrap_or(usize::MAX)
    }

    fn pick_earliest(&mut self) -> Option<(usize, &Event)> {
        let best = self
            .tracks
            .iter()
            .enumerate()
            .filter_map(|(i, (t, c))| t.current(*c).map(|e| (i, e.tick)))
            .min_by_key(|&(i, tick)| (tick, self.rank(i)))
            .map(|(i, _)| i);
        self.current = best;
        let i = best?;
        let (track, cursor) = &self.tracks[i];
        track.current(*cursor).map(|e| (i, e))
    }

    pub fn jump_to_tick(&mut self, tick: Tick) -> Option<(usize, &Event)> {
        for (track, cursor) in &mut self.tracks {
            track.jump_to_tick(*cursor, tick);
        }
        self.pick_earliest()
    }

    /// Earliest event over all tracks, with its track index
    pub fn current(&mut self) -> Option<(usize, &Event)> {
        self.pick_earliest()
    }

    pub fn forward(&mut self) -> Option<(usize, &Event)> {
        if self.current.is_none() {
            self.pick_earliest();
        }
        let i = self.current?;
        let (track, cursor) = &mut self.tracks[i];
        track.forward(*cursor);
        self.pick_earliest()
    }

    /// Steps back to the latest event before the current one
    pub fn backward(&mut self) -> Option<(usize, &Event)> {
        let best = self
            .tracks
            .iter()
            .enumerate()
            .filter_map(|(i, (t, c))| t.event_at(t.cursor_position(*c) - 1).map(|e| (i, e.tick)))
            .max_by_key(|&(i, tick)| (tick, std::cmp::Reverse(self.rank(i))))
            .map(|(i, _)| i)?;
        let (track, cursor) = &mut self.tracks[best];
        track.backward(*cursor);
        self.current = Some(best);
        let (track, cursor) = &self.tracks[best];
        track.current(*cursor).map(|e| (best, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(ticks: &[Tick], key: u8) -> Track {
        Track::from_events(ticks.iter().map(|&t| Event::note(t, 0, key, 100, 1))).unwrap()
    }

    fn sequence() -> Sequence {
        let mut seq = Sequence::new(480);
        seq.insert_track(-1, track(&[0, 20, 40], 1)).unwrap();
        seq.insert_track(-1, track(&[10, 20, 50], 2)).unwrap();
        seq.insert_track(-1, Track::new()).unwrap();
        seq
    }

    fn key_of(event: &Event) -> Tick {
        event.code().map_or(-1, Tick::from)
    }

    #[test]
    fn test_forward_merges_in_tick_order() {
        let mut seq = sequence();
        let mut merger = SequenceMerger::new(&mut seq);
        let mut order = Vec::new();
        while let Some(track) = merger.forward(&mut seq) {
            let tick = merger.tick();
            order.push((tick, track));
        }
        assert_eq!(
            order,
            vec![(0, 0), (10, 1), (20, 0), (20, 1), (40, 0), (50, 1)]
        );
        assert_eq!(merger.tick(), MAX_TICK);
        assert!(merger.forward(&mut seq).is_none());
    }

    #[test]
    fn test_jump_and_backward() {
        let mut seq = sequence();
        let mut merger = SequenceMerger::new(&mut seq);
        merger.jump_to_tick(&mut seq, 15);
        assert_eq!(merger.tick(), 20);
        assert_eq!(merger.current_track(), Some(0));
        assert_eq!(merger.current_position_in_track(&seq), 1);
        assert_eq!(merger.current(&seq).map(key_of), Some(1));

        assert_eq!(merger.backward(&mut seq), Some(1));
        assert_eq!(merger.tick(), 10);
        assert_eq!(merger.backward(&mut seq), Some(0));
        assert_eq!(merger.tick(), 0);
        assert_eq!(merger.backward(&mut seq), None);
    }

    #[test]
    fn test_subset_and_release() {
        let mut seq = sequence();
        let mut merger = SequenceMerger::with_tracks(&mut seq, &[1]);
        assert_eq!(merger.forward(&mut seq), Some(1));
        assert_eq!(merger.tick(), 10);
        assert_eq!(seq.track(1).unwrap().cursor_count(), 1);

        let mut copy = merger.duplicate(&mut seq).unwrap();
        assert_eq!(seq.track(1).unwrap().cursor_count(), 2);
        copy.release(&mut seq);
        merger.release(&mut seq);
        assert_eq!(seq.track(1).unwrap().cursor_count(), 0);
    }

    #[test]
    fn test_replaced_track_is_skipped() {
        let mut seq = sequence();
        let mut merger = SequenceMerger::new(&mut seq);
        seq.replace_track(0, track(&[5], 9)).unwrap();
        let mut ticks = Vec::new();
        while merger.forward(&mut seq).is_some() {
            ticks.push(merger.tick());
        }
        assert_eq!(ticks, vec![10, 20, 50]);
    }

    fn insert_note(seq: &mut Sequence, tick: Tick, key: u8) {
        let track = seq.track_mut(0).unwrap();
        let cursor = track.new_cursor();
        track.insert_event(cursor, Event::note(tick, 0, key, 100, 1)).unwrap();
        track.release_cursor(cursor);
    }

    #[test]
    fn test_event_inserted_before_pending_one_is_played() {
        let mut seq = Sequence::new(480);
        seq.insert_track(-1, track(&[0, 40], 1)).unwrap();
        let mut merger = SequenceMerger::new(&mut seq);
        merger.forward(&mut seq);
        merger.forward(&mut seq);
        assert_eq!(merger.tick(), 40);

        // Lands on the position the merger cursor sits at
        insert_note(&mut seq, 20, 7);
        assert!(merger.refresh(&mut seq));
        assert_eq!(merger.tick(), 20);
        assert_eq!(merger.current(&seq).map(key_of), Some(7));
        assert!(!merger.refresh(&mut seq));

        assert_eq!(merger.forward(&mut seq), Some(0));
        assert_eq!(merger.tick(), 40);
        assert_eq!(merger.forward(&mut seq), None);
    }

    #[test]
    fn test_edit_inside_equal_tick_group_keeps_place() {
        let mut seq = Sequence::new(480);
        seq.insert_track(-1, track(&[0, 20, 20, 40], 1)).unwrap();
        let mut merger = SequenceMerger::new(&mut seq);
        for _ in 0..3 {
            merger.forward(&mut seq);
        }
        assert_eq!(merger.current_position_in_track(&seq), 2);

        insert_note(&mut seq, 30, 7);
        assert!(merger.refresh(&mut seq));
        assert_eq!(merger.tick(), 20);
        assert_eq!(merger.current_position_in_track(&seq), 2);

        merger.forward(&mut seq);
        assert_eq!(merger.current(&seq).map(key_of), Some(7));
        merger.forward(&mut seq);
        assert_eq!(merger.tick(), 40);
    }

    #[test]
    fn test_track_merger_tie_break() {
        let mut merger = TrackMerger::new();
        merger.add_track(track(&[0, 10], 1));
        merger.add_track(track(&[0, 10], 2));
        merger.set_tie_break(&[1]);

        let (i, e) = merger.current().unwrap();
        assert_eq!((i, e.tick), (1, 0));
        let (i, _) = merger.forward().unwrap();
        assert_eq!(i, 0);
        let (i, e) = merger.forward().unwrap();
        assert_eq!((i, e.tick), (1, 10));

        let removed = merger.remove_track(1).unwrap();
        assert_eq!(removed.cursor_count(), 0);
        assert_eq!(merger.track_count(), 1);
    }
}
