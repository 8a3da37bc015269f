// Cursor - Stable positions into a track
// A cursor is a handle; its state lives in the track's registry so that every
// edit can shift or invalidate the other cursors registered on the same track.

use crate::error::{SeqResult, SequencerError};
use crate::midi::event::{Event, MAX_TICK, Tick};
use crate::sequencer::track::{BlockId, Track};

/// Handle to a cursor registered on one track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId {
    slot: u32,
    generation: u32,
}

impl CursorId {
    /// Handle that never resolves on any track
    pub(crate) const DANGLING: CursorId = CursorId {
        slot: u32::MAX,
        generation: u32::MAX,
    };
}

#[derive(Debug, Clone)]
pub(crate) struct CursorState {
    pub(crate) block: Option<BlockId>,
    pub(crate) index: usize,
    pub(crate) position: i64,
    pub(crate) auto_adjust: bool,
    pub(crate) removed: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            block: None,
            index: 0,
            position: -1,
            auto_adjust: true,
            removed: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CursorSlot {
    generation: u32,
    pub(crate) state: Option<CursorState>,
}

fn stale(id: CursorId) -> SequencerError {
    SequencerError::BadParameter(format!("stale cursor handle {}:{}", id.slot, id.generation))
}

impl Track {
    // ---- registry ------------------------------------------------------

    /// Registers a new auto-adjusting cursor at position -1
    pub fn new_cursor(&mut self) -> CursorId {
        let state = Some(CursorState::default());
        if let Some(slot) = self.free_cursor_slots.pop() {
            let entry = &mut self.cursors[slot as usize];
            entry.generation = entry.generation.wrapping_add(1);
            entry.state = state;
            return CursorId {
                slot,
                generation: entry.generation,
            };
        }
        self.cursors.push(CursorSlot {
            generation: 0,
            state,
        });
        CursorId {
            slot: (self.cursors.len() - 1) as u32,
            generation: 0,
        }
    }

    /// New cursor at the same place as `id`
    pub fn duplicate_cursor(&mut self, id: CursorId) -> SeqResult<CursorId> {
        let state = self.state(id).cloned().ok_or_else(|| stale(id))?;
        let copy = self.new_cursor();
        if let Some(s) = self.state_mut(copy) {
            *s = state;
        }
        Ok(copy)
    }

    /// Unregisters the cursor; the handle becomes stale
    pub fn release_cursor(&mut self, id: CursorId) {
        if let Some(entry) = self.cursors.get_mut(id.slot as usize) {
            if entry.generation == id.generation && entry.state.is_some() {
                entry.state = None;
                self.free_cursor_slots.push(id.slot);
            }
        }
    }

    pub fn is_cursor_valid(&self, id: CursorId) -> bool {
        self.state(id).is_some()
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.iter().filter(|c| c.state.is_some()).count()
    }

    pub(crate) fn state(&self, id: CursorId) -> Option<&CursorState> {
        self.cursors
            .get(id.slot as usize)
            .filter(|c| c.generation == id.generation)
            .and_then(|c| c.state.as_ref())
    }

    pub(crate) fn state_mut(&mut self, id: CursorId) -> Option<&mut CursorState> {
        self.cursors
            .get_mut(id.slot as usize)
            .filter(|c| c.generation == id.generation)
            .and_then(|c| c.state.as_mut())
    }

    /// Absolute position; -1 for a stale handle
    pub fn cursor_position(&self, id: CursorId) -> i64 {
        self.state(id).map_or(-1, |s| s.position)
    }

    pub fn set_auto_adjust(&mut self, id: CursorId, auto_adjust: bool) {
        if let Some(s) = self.state_mut(id) {
            s.auto_adjust = auto_adjust;
        }
    }

    pub fn is_auto_adjust(&self, id: CursorId) -> bool {
        self.state(id).is_some_and(|s| s.auto_adjust)
    }

    /// True when the event under the cursor was deleted by another cursor
    pub fn is_removed(&self, id: CursorId) -> bool {
        self.state(id).is_some_and(|s| s.removed)
    }

    // ---- movement -------------------------------------------------------

    /// Moves to an absolute position, clamped to [-1, count].
    /// Returns true when the cursor lands on an event.
    pub fn set_position(&mut self, id: CursorId, position: i64) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        let num = self.num_events as i64;
        let target = position.clamp(-1, num);
        let (block, index) = match (state.block, state.position) {
            (Some(b), from) if from >= 0 => self.walk(b, state.index, from, target),
            _ => self.locate(target),
        };
        if let Some(s) = self.state_mut(id) {
            s.block = block;
            s.index = index;
            s.position = target;
            s.removed = false;
        }
        target >= 0 && target < num
    }

    pub fn set_relative_position(&mut self, id: CursorId, offset: i64) -> bool {
        let position = self.cursor_position(id);
        self.set_position(id, position + offset)
    }

    /// Event under the cursor
    pub fn current(&self, id: CursorId) -> Option<&Event> {
        let s = self.state(id)?;
        if s.position < 0 || s.position >= self.num_events as i64 {
            return None;
        }
        self.event_at_location(s.block, s.index)
    }

    /// Steps forward; stays put (and returns None) at the end
    pub fn forward(&mut self, id: CursorId) -> Option<&Event> {
        let s = self.state(id)?;
        let num = self.num_events as i64;
        if s.position >= num {
            return None;
        }
        let (block, index) = if s.position < 0 {
            (self.first, 0)
        } else {
            let b = s.block?;
            let next_index = s.index + 1;
            if next_index >= self.block_len(b) {
                match self.block(b).next {
                    Some(n) => (Some(n), 0),
                    None => (Some(b), next_index),
                }
            } else {
                (Some(b), next_index)
            }
        };
        let position = s.position + 1;
        let s = self.state_mut(id)?;
        s.block = block;
        s.index = index;
        s.position = position;
        s.removed = false;
        self.current(id)
    }

    /// Steps backward; reaches -1 (and returns None) before the first event
    pub fn backward(&mut self, id: CursorId) -> Option<&Event> {
        let s = self.state(id)?;
        let num = self.num_events as i64;
        let (block, index, position) = if s.position <= 0 {
            (None, 0, -1)
        } else if s.position >= num {
            let last = self.last?;
            (Some(last), self.block_len(last) - 1, num - 1)
        } else {
            let b = s.block?;
            if s.index > 0 {
                (Some(b), s.index - 1, s.position - 1)
            } else {
                let p = self.block(b).prev?;
                (Some(p), self.block_len(p) - 1, s.position - 1)
            }
        };
        let s = self.state_mut(id)?;
        s.block = block;
        s.index = index;
        s.position = position;
        s.removed = false;
        self.current(id)
    }

    pub fn forward_with_selector<F>(&mut self, id: CursorId, mut selector: F) -> Option<&Event>
    where
        F: FnMut(&Event) -> bool,
    {
        loop {
            let hit = selector(self.forward(id)?);
            if hit {
                return self.current(id);
            }
        }
    }

    pub fn backward_with_selector<F>(&mut self, id: CursorId, mut selector: F) -> Option<&Event>
    where
        F: FnMut(&Event) -> bool,
    {
        loop {
            let hit = selector(self.backward(id)?);
            if hit {
                return self.current(id);
            }
        }
    }

    /// Moves to the first event whose tick is >= `tick`, or to the end.
    /// Whole blocks are skipped by their first tick before scanning one block.
    /// Returns true when the cursor lands on an event.
    pub fn jump_to_tick(&mut self, id: CursorId, tick: Tick) -> bool {
        let Some(state) = self.state(id) else {
            return false;
        };
        let Some(first) = self.first else {
            self.set_position(id, 0);
            return false;
        };
        let (mut block, mut start) = match state.block {
            Some(b) if state.position >= 0 => (b, state.position - state.index as i64),
            _ => (first, 0),
        };
        while self.block(block).events.first().is_some_and(|e| e.tick >= tick) {
            match self.block(block).prev {
                Some(prev) => {
                    start -= self.block_len(prev) as i64;
                    block = prev;
                }
                None => break,
            }
        }
        while let Some(next) = self.block(block).next {
            if self.block(next).events.first().is_some_and(|e| e.tick < tick) {
                start += self.block_len(block) as i64;
                block = next;
            } else {
                break;
            }
        }
        let len = self.block_len(block);
        let (block, index, position) =
            match self.block(block).events.iter().position(|e| e.tick >= tick) {
                Some(i) => (block, i, start + i as i64),
                None => match self.block(block).next {
                    Some(next) => (next, 0, start + len as i64),
                    None => (block, len, start + len as i64),
                },
            };
        let num = self.num_events as i64;
        if let Some(s) = self.state_mut(id) {
            s.block = Some(block);
            s.index = index;
            s.position = position;
            s.removed = false;
        }
        position < num
    }

    /// Moves to the last event
    pub fn jump_to_last(&mut self, id: CursorId) -> bool {
        let last = self.num_events as i64 - 1;
        self.set_position(id, last)
    }

    /// Moves to the first stored event equal to `target`
    pub fn look_for_event(&mut self, id: CursorId, target: &Event) -> bool {
        self.jump_to_tick(id, target.tick);
        loop {
            match self.current(id) {
                Some(event) if event.tick > target.tick => return false,
                Some(event) if event == target => return true,
                Some(_) => {
                    self.forward(id);
                }
                None => return false,
            }
        }
    }

    // ---- edits ----------------------------------------------------------

    /// Inserts `count` blank events at the cursor. The cursor ends on the
    /// first blank. Auto-adjusting cursors at or after the insertion point
    /// shift by `count`; the others keep their numeric position.
    pub fn insert_blanks(&mut self, id: CursorId, count: usize) -> SeqResult<()> {
        let state = self.state(id).ok_or_else(|| stale(id))?;
        if count == 0 {
            return Ok(());
        }
        let at = state.position.clamp(0, self.num_events as i64);
        let anchor = self.splice_blanks(at, count)?;
        for (k, slot) in self.cursors.iter_mut().enumerate() {
            let Some(s) = slot.state.as_mut() else {
                continue;
            };
            if k == id.slot as usize {
                s.position = at;
                s.removed = false;
            } else if s.auto_adjust && s.position >= at {
                s.position += count as i64;
            }
        }
        self.relocate_cursors(anchor);
        Ok(())
    }

    /// Deletes up to `count` events starting at the cursor and returns how
    /// many went. Auto-adjusting cursors inside the range are flagged
    /// removed and snapped to the first survivor; those after shift back.
    pub fn delete_events(&mut self, id: CursorId, count: usize) -> SeqResult<usize> {
        self.remove_events(id, count).map(|removed| removed.len())
    }

    pub(crate) fn remove_events(&mut self, id: CursorId, count: usize) -> SeqResult<Vec<Event>> {
        let state = self.state(id).ok_or_else(|| stale(id))?;
        let num = self.num_events as i64;
        let at = state.position.max(0);
        if at >= num || count == 0 {
            return Ok(Vec::new());
        }
        let count = count.min((num - at) as usize);
        let (removed, anchor) = self.drain_events(at, count);
        for event in &removed {
            self.count_event(event, -1);
        }
        let end = at + count as i64;
        let now_empty = self.num_events == 0;
        for (k, slot) in self.cursors.iter_mut().enumerate() {
            let Some(s) = slot.state.as_mut() else {
                continue;
            };
            if k == id.slot as usize {
                s.position = if now_empty { -1 } else { at };
                s.removed = false;
            } else if s.auto_adjust {
                if s.position >= end {
                    s.position -= count as i64;
                } else if s.position >= at {
                    s.position = at;
                    s.removed = true;
                }
            }
        }
        self.relocate_cursors(anchor);
        Ok(removed)
    }

    /// Inserts one event keeping tick order. When the cursor is not already
    /// at a valid place for the tick, it first jumps there.
    /// The cursor ends on the new event.
    pub fn insert_event(&mut self, id: CursorId, event: Event) -> SeqResult<()> {
        let state = self.state(id).ok_or_else(|| stale(id))?;
        if event.tick < 0 || event.tick > MAX_TICK {
            return Err(SequencerError::BadParameter(format!(
                "tick {} out of range",
                event.tick
            )));
        }
        let position = state.position;
        let num = self.num_events as i64;
        let fits = position >= 0
            && position <= num
            && (position == 0 || self.tick_at(position - 1).is_some_and(|t| t <= event.tick))
            && (position == num || self.tick_at(position).is_some_and(|t| event.tick <= t));
        if !fits {
            self.jump_to_tick(id, event.tick);
        }
        self.insert_blanks(id, 1)?;
        self.count_event(&event, 1);
        self.extend_duration(&event);
        self.write_at_cursor(id, event);
        Ok(())
    }

    /// Removes the event under the cursor
    pub fn delete_event(&mut self, id: CursorId) -> SeqResult<Option<Event>> {
        if self.current(id).is_none() {
            return Ok(None);
        }
        Ok(self.remove_events(id, 1)?.pop())
    }

    /// Replaces the event under the cursor and returns the old one. A tick
    /// change is carried out by [`Track::change_tick`], never in place.
    pub fn replace_event(&mut self, id: CursorId, event: Event) -> SeqResult<Event> {
        let position = self.cursor_position(id);
        let old = self
            .current(id)
            .cloned()
            .ok_or(SequencerError::BadIndex(position))?;
        let new_tick = event.tick;
        let mut event = event;
        event.tick = old.tick;
        self.count_event(&old, -1);
        self.count_event(&event, 1);
        self.extend_duration(&event);
        self.write_at_cursor(id, event);
        if new_tick != old.tick {
            self.change_tick(id, new_tick)?;
        }
        Ok(old)
    }

    /// Changes the tick of the event under the cursor. In place when the
    /// neighbours still bracket the new tick, otherwise the event is
    /// reinserted at its new position. The cursor follows the event.
    pub fn change_tick(&mut self, id: CursorId, tick: Tick) -> SeqResult<()> {
        let position = self.cursor_position(id);
        let mut event = self
            .current(id)
            .cloned()
            .ok_or(SequencerError::BadIndex(position))?;
        if !(0..=MAX_TICK).contains(&tick) {
            return Err(SequencerError::BadParameter(format!("tick {tick} out of range")));
        }
        let num = self.num_events as i64;
        let after_prev = position == 0 || self.tick_at(position - 1).is_some_and(|t| t <= tick);
        let before_next =
            position + 1 >= num || self.tick_at(position + 1).is_some_and(|t| tick <= t);
        event.tick = tick;
        if after_prev && before_next {
            self.extend_duration(&event);
            self.write_at_cursor(id, event);
            return Ok(());
        }

        let scratch = self.new_cursor();
        self.jump_to_tick(scratch, tick);
        let target = self.cursor_position(scratch);
        let result = self.insert_blanks(scratch, 1).and_then(|()| {
            self.count_event(&event, 1);
            self.extend_duration(&event);
            self.write_at_cursor(scratch, event);
            let old_position = if target <= position { position + 1 } else { position };
            self.set_position(scratch, old_position);
            self.remove_events(scratch, 1)
        });
        self.release_cursor(scratch);
        result?;
        let new_position = if target <= position { target } else { target - 1 };
        self.set_position(id, new_position);
        Ok(())
    }

    /// Sets the duration of the note under the cursor
    pub fn set_event_duration(&mut self, id: CursorId, duration: Tick) -> SeqResult<()> {
        let position = self.cursor_position(id);
        let mut event = self
            .current(id)
            .cloned()
            .ok_or(SequencerError::BadIndex(position))?;
        if !event.has_duration() {
            return Err(SequencerError::BadParameter(format!(
                "event at {position} has no duration"
            )));
        }
        event.set_duration(duration.max(0));
        self.extend_duration(&event);
        self.write_at_cursor(id, event);
        Ok(())
    }

    /// Verifies that the cursor's block and index agree with its position
    pub fn cursor_check(&self, id: CursorId) -> SeqResult<()> {
        let s = self.state(id).ok_or_else(|| stale(id))?;
        let num = self.num_events as i64;
        if s.position < 0 {
            if s.position != -1 || s.block.is_some() {
                return Err(SequencerError::InconsistentCursor(format!(
                    "position {} with block {:?}",
                    s.position, s.block
                )));
            }
            return Ok(());
        }
        if s.position > num {
            return Err(SequencerError::InconsistentCursor(format!(
                "position {} beyond {num} events",
                s.position
            )));
        }
        let expected = self.locate(s.position);
        if (s.block, s.index) != expected {
            return Err(SequencerError::InconsistentCursor(format!(
                "position {} stored at {:?}/{} but found at {:?}/{}",
                s.position, s.block, s.index, expected.0, expected.1
            )));
        }
        Ok(())
    }

    // ---- internal -----------------------------------------------------

    fn write_at_cursor(&mut self, id: CursorId, event: Event) -> Option<Event> {
        let (block, index) = self.state(id).map(|s| (s.block, s.index))?;
        let b = self.block_mut(block?);
        b.invalidate();
        let old = std::mem::replace(b.events.get_mut(index)?, event);
        self.touch();
        Some(old)
    }

    /// Recomputes block/index of every cursor from its (clamped) position
    pub(crate) fn relocate_cursors(&mut self, anchor: Option<(BlockId, i64)>) {
        let num = self.num_events as i64;
        for k in 0..self.cursors.len() {
            let Some(position) = self.cursors[k].state.as_ref().map(|s| s.position) else {
                continue;
            };
            let position = position.clamp(-1, num);
            let (block, index) = match anchor {
                Some((b, start)) => self.walk(b, 0, start, position),
                None => self.locate(position),
            };
            if let Some(s) = self.cursors[k].state.as_mut() {
                s.position = position;
                s.block = block;
                s.index = index;
            }
        }
    }

    /// Relocates cursors at or past `from` after events were appended
    pub(crate) fn relocate_cursors_from(&mut self, from: i64) {
        let needs = self
            .cursors
            .iter()
            .filter_map(|c| c.state.as_ref())
            .any(|s| s.position >= from);
        if needs {
            self.relocate_cursors(None);
        }
    }

    /// After a rebuild: auto-adjusting cursors get the position `map`
    /// returns (and the removed flag when it says so), others keep theirs.
    pub(crate) fn remap_cursors<F>(&mut self, map: F)
    where
        F: Fn(i64) -> (i64, bool),
    {
        for slot in &mut self.cursors {
            if let Some(s) = slot.state.as_mut() {
                if s.auto_adjust {
                    let (position, removed) = map(s.position);
                    s.position = position;
                    s.removed |= removed;
                }
            }
        }
        self.relocate_cursors(None);
    }
}
