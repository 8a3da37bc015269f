// Track - Block-linked event store
// Events live in fixed-capacity blocks chained in a doubly linked list held in an
// arena. Cursors registered on the track are kept consistent across every edit.

use crate::error::{SeqResult, SequencerError};
use crate::midi::event::{Event, EventKind, Message, NEGATIVE_TICK, Tick, meta};
use crate::sequencer::cursor::{CursorId, CursorSlot, CursorState};
use std::cell::Cell;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Events per block
pub const BLOCK_CAPACITY: usize = 64;

/// Number of per-channel counters: 16 channels, sysex, non-MIDI
pub const CHANNEL_SLOTS: usize = 18;

static NEXT_TRACK_UID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(pub(crate) usize);

#[derive(Debug, Default)]
pub(crate) struct Block {
    pub(crate) events: Vec<Event>,
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
    /// Max of tick and tick + duration over the events; `None` when stale
    largest_tick: Cell<Option<Tick>>,
}

impl Block {
    fn len(&self) -> usize {
        self.events.len()
    }

    fn first_tick(&self) -> Tick {
        self.events.first().map_or(NEGATIVE_TICK, |e| e.tick)
    }

    pub(crate) fn invalidate(&self) {
        self.largest_tick.set(None);
    }

    fn largest_tick(&self) -> Tick {
        if let Some(tick) = self.largest_tick.get() {
            return tick;
        }
        let tick = self
            .events
            .iter()
            .filter(|e| !e.is_null())
            .map(Event::end_tick)
            .max()
            .unwrap_or(NEGATIVE_TICK);
        self.largest_tick.set(Some(tick));
        tick
    }
}

/// Edit attribute bit set of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct TrackAttribute(u8);

impl TrackAttribute {
    pub const NONE: Self = Self(0);
    pub const RECORD: Self = Self(1);
    pub const SOLO: Self = Self(2);
    pub const MUTE: Self = Self(4);
    pub const MUTE_BY_SOLO: Self = Self(8);
    pub const HIDDEN: Self = Self(16);
    pub const EDITABLE: Self = Self(32);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x3f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    /// Muted explicitly or silenced by another track's solo
    pub fn is_silent(self) -> bool {
        self.0 & (Self::MUTE.0 | Self::MUTE_BY_SOLO.0) != 0
    }
}

impl BitOr for TrackAttribute {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Time-ordered event store.
///
/// Events are kept in non-decreasing tick order. Positions run from 0 to
/// `number_of_events() - 1`; cursors may also sit at -1 (before the first
/// event) or at `number_of_events()` (past the last one).
#[derive(Debug)]
pub struct Track {
    uid: u64,
    pub(crate) blocks: Vec<Block>,
    free_blocks: Vec<BlockId>,
    pub(crate) first: Option<BlockId>,
    pub(crate) last: Option<BlockId>,
    pub(crate) num_events: usize,
    nch: [usize; CHANNEL_SLOTS],
    duration: Tick,
    name: String,
    device_name: String,
    device: Option<usize>,
    track_channel: u8,
    attribute: TrackAttribute,
    pub(crate) cursors: Vec<CursorSlot>,
    pub(crate) free_cursor_slots: Vec<u32>,
    edits: u64,
}

impl Default for Track {
    fn default() -> Self {
        Self::new()
    }
}

impl Track {
    pub fn new() -> Self {
        Self {
            uid: NEXT_TRACK_UID.fetch_add(1, Ordering::Relaxed),
            blocks: Vec::new(),
            free_blocks: Vec::new(),
            first: None,
            last: None,
            num_events: 0,
            nch: [0; CHANNEL_SLOTS],
            duration: 0,
            name: String::new(),
            device_name: String::new(),
            device: None,
            track_channel: 0,
            attribute: TrackAttribute::NONE,
            cursors: Vec::new(),
            free_cursor_slots: Vec::new(),
            edits: 0,
        }
    }

    /// Builds a track from events in tick order
    pub fn from_events(events: impl IntoIterator<Item = Event>) -> SeqResult<Self> {
        let mut track = Self::new();
        track.append_events(events)?;
        Ok(track)
    }

    /// Process-unique identity, used by mergers and calibrators to detect
    /// that the track they point into was replaced
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Bumped by every edit of the stored events. Readers caching positions
    /// or ticks compare it to know their cache went stale.
    pub fn edit_generation(&self) -> u64 {
        self.edits
    }

    pub(crate) fn touch(&mut self) {
        self.edits = self.edits.wrapping_add(1);
    }

    // ---- block arena -------------------------------------------------

    pub(crate) fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    pub(crate) fn block_len(&self, id: BlockId) -> usize {
        self.blocks[id.0].len()
    }

    fn alloc_block(&mut self) -> SeqResult<BlockId> {
        if let Some(id) = self.free_blocks.pop() {
            return Ok(id);
        }
        self.blocks
            .try_reserve(1)
            .map_err(|_| SequencerError::OutOfMemory)?;
        self.blocks.push(Block::default());
        Ok(BlockId(self.blocks.len() - 1))
    }

    /// Room for `n` more blocks, so a multi-block edit cannot stop halfway
    fn reserve_blocks(&mut self, n: usize) -> SeqResult<()> {
        let missing = n.saturating_sub(self.free_blocks.len());
        self.blocks
            .try_reserve(missing)
            .map_err(|_| SequencerError::OutOfMemory)
    }

    fn new_block_with(&mut self, events: Vec<Event>) -> SeqResult<BlockId> {
        let id = self.alloc_block()?;
        let block = self.block_mut(id);
        block.events = events;
        block.prev = None;
        block.next = None;
        block.invalidate();
        Ok(id)
    }

    /// Links `id` right after `after` (or at the head when `after` is None)
    fn link_after(&mut self, after: Option<BlockId>, id: BlockId) {
        let next = match after {
            Some(a) => self.block(a).next,
            None => self.first,
        };
        {
            let block = self.block_mut(id);
            block.prev = after;
            block.next = next;
        }
        match after {
            Some(a) => self.block_mut(a).next = Some(id),
            None => self.first = Some(id),
        }
        match next {
            Some(n) => self.block_mut(n).prev = Some(id),
            None => self.last = Some(id),
        }
    }

    fn unlink_and_free(&mut self, id: BlockId) {
        let (prev, next) = {
            let block = self.block(id);
            (block.prev, block.next)
        };
        match prev {
            Some(p) => self.block_mut(p).next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.block_mut(n).prev = prev,
            None => self.last = prev,
        }
        let block = self.block_mut(id);
        block.events = Vec::new();
        block.prev = None;
        block.next = None;
        block.invalidate();
        self.free_blocks.push(id);
    }

    /// Replaces storage with a fresh chain holding `events` (already ordered).
    /// The old chain is left untouched when allocation fails.
    fn rebuild(&mut self, events: Vec<Event>) -> SeqResult<()> {
        let count = events.len();
        let mut blocks: Vec<Block> = Vec::new();
        blocks
            .try_reserve(count.div_ceil(BLOCK_CAPACITY))
            .map_err(|_| SequencerError::OutOfMemory)?;
        let mut iter = events.into_iter().peekable();
        while iter.peek().is_some() {
            let id = blocks.len();
            let prev = id.checked_sub(1).map(BlockId);
            if let Some(p) = prev {
                blocks[p.0].next = Some(BlockId(id));
            }
            blocks.push(Block {
                events: iter.by_ref().take(BLOCK_CAPACITY).collect(),
                prev,
                next: None,
                largest_tick: Cell::new(None),
            });
        }

        self.first = (!blocks.is_empty()).then_some(BlockId(0));
        self.last = blocks.len().checked_sub(1).map(BlockId);
        self.blocks = blocks;
        self.free_blocks.clear();
        self.num_events = count;
        self.recount();
        self.touch();
        Ok(())
    }

    fn recount(&mut self) {
        let mut nch = [0; CHANNEL_SLOTS];
        for event in self.iter() {
            if let Some(slot) = event.channel_slot() {
                nch[slot] += 1;
            }
        }
        self.nch = nch;
    }

    pub(crate) fn count_event(&mut self, event: &Event, delta: isize) {
        if let Some(slot) = event.channel_slot() {
            self.nch[slot] = self.nch[slot].saturating_add_signed(delta);
        }
    }

    // ---- position resolution ------------------------------------------

    /// Storage location of an absolute position. -1 maps to `None`, the
    /// end position maps to `(last, last.len)`.
    pub(crate) fn locate(&self, position: i64) -> (Option<BlockId>, usize) {
        match self.first {
            Some(first) => self.walk(first, 0, 0, position),
            None => (None, 0),
        }
    }

    /// Walks from a known location `(block, index)` at absolute `from` to
    /// `target`. The starting location must be consistent.
    pub(crate) fn walk(
        &self,
        mut block: BlockId,
        mut index: usize,
        from: i64,
        target: i64,
    ) -> (Option<BlockId>, usize) {
        let num = self.num_events as i64;
        if target < 0 {
            return (None, 0);
        }
        if target >= num {
            return match self.last {
                Some(last) => (Some(last), self.block_len(last)),
                None => (None, 0),
            };
        }
        if target >= from {
            let mut remaining = (target - from) as usize;
            loop {
                let len = self.block_len(block);
                if index + remaining < len {
                    return (Some(block), index + remaining);
                }
                remaining -= len - index;
                match self.block(block).next {
                    Some(next) => {
                        block = next;
                        index = 0;
                    }
                    None => return (Some(block), len),
                }
            }
        } else {
            let mut remaining = (from - target) as usize;
            loop {
                if remaining <= index {
                    return (Some(block), index - remaining);
                }
                remaining -= index;
                match self.block(block).prev {
                    Some(prev) => {
                        block = prev;
                        index = self.block_len(prev);
                    }
                    None => return (Some(block), 0),
                }
            }
        }
    }

    pub(crate) fn event_at_location(&self, block: Option<BlockId>, index: usize) -> Option<&Event> {
        block.and_then(|b| self.block(b).events.get(index))
    }

    /// Event at an absolute position
    pub fn event_at(&self, position: i64) -> Option<&Event> {
        if position < 0 || position >= self.num_events as i64 {
            return None;
        }
        let (block, index) = self.locate(position);
        self.event_at_location(block, index)
    }

    pub(crate) fn tick_at(&self, position: i64) -> Option<Tick> {
        self.event_at(position).map(|e| e.tick)
    }

    // ---- raw storage edits --------------------------------------------

    /// Inserts `count` blanks at absolute `position`. Returns an anchor
    /// `(block, start position of block)` that stays valid afterwards.
    pub(crate) fn splice_blanks(
        &mut self,
        position: i64,
        count: usize,
    ) -> SeqResult<Option<(BlockId, i64)>> {
        let blank_tick = if position > 0 {
            self.tick_at(position - 1).unwrap_or(0)
        } else {
            self.tick_at(0).unwrap_or(0).min(0)
        };
        let blank = || Event::null(blank_tick);

        let Some(first) = self.first else {
            // Empty track: a fresh chain of blocks
            self.reserve_blocks(count.div_ceil(BLOCK_CAPACITY))?;
            self.touch();
            let mut tail = None;
            let mut remaining = count;
            while remaining > 0 {
                let n = remaining.min(BLOCK_CAPACITY);
                let id = self.new_block_with(vec![blank(); n])?;
                self.link_after(tail, id);
                tail = Some(id);
                remaining -= n;
            }
            self.num_events = count;
            return Ok(self.first.map(|f| (f, 0)));
        };

        let (block, index) = match self.walk(first, 0, 0, position) {
            (Some(b), i) => (b, i),
            (None, _) => (first, 0),
        };
        let block_start = position.max(0) - index as i64;
        let len = self.block_len(block);

        if len + count <= BLOCK_CAPACITY {
            self.touch();
            let b = self.block_mut(block);
            b.events.splice(index..index, std::iter::repeat_with(blank).take(count));
            b.invalidate();
        } else {
            let fill = count.min(BLOCK_CAPACITY - index);
            // Fresh blocks for the overflow, plus one for the displaced tail
            self.reserve_blocks((count - fill).div_ceil(BLOCK_CAPACITY) + 1)?;
            self.touch();
            let tail = self.block_mut(block).events.split_off(index);
            {
                let b = self.block_mut(block);
                b.events.extend(std::iter::repeat_with(blank).take(fill));
                b.invalidate();
            }
            let mut remaining = count - fill;
            let mut cursor = block;
            while remaining > 0 {
                let n = remaining.min(BLOCK_CAPACITY);
                let id = self.new_block_with(vec![blank(); n])?;
                self.link_after(Some(cursor), id);
                cursor = id;
                remaining -= n;
            }
            if !tail.is_empty() {
                if self.block_len(cursor) + tail.len() <= BLOCK_CAPACITY {
                    let b = self.block_mut(cursor);
                    b.events.extend(tail);
                    b.invalidate();
                } else {
                    let id = self.new_block_with(tail)?;
                    self.link_after(Some(cursor), id);
                }
            }
        }
        self.num_events += count;
        Ok(Some((block, block_start)))
    }

    /// Removes `count` events starting at absolute `position`, returning them.
    /// Empty blocks are purged. Returns the removed events and a valid anchor.
    pub(crate) fn drain_events(
        &mut self,
        position: i64,
        count: usize,
    ) -> (Vec<Event>, Option<(BlockId, i64)>) {
        let mut removed = Vec::with_capacity(count);
        let (Some(mut block), mut index) = self.locate(position) else {
            return (removed, None);
        };
        self.touch();
        let block_start = position - index as i64;
        let prev_of_start = self.block(block).prev;
        let start_block = block;
        let mut start_block_alive = true;
        let mut remaining = count;
        loop {
            let len = self.block_len(block);
            let k = remaining.min(len - index);
            {
                let b = self.block_mut(block);
                removed.extend(b.events.drain(index..index + k));
                b.invalidate();
            }
            remaining -= k;
            let next = self.block(block).next;
            if self.block_len(block) == 0 {
                if block == start_block {
                    start_block_alive = false;
                }
                self.unlink_and_free(block);
            }
            match next {
                Some(n) if remaining > 0 => {
                    block = n;
                    index = 0;
                }
                _ => break,
            }
        }
        self.num_events -= removed.len();
        let anchor = if start_block_alive {
            Some((start_block, block_start))
        } else if let Some(prev) = prev_of_start {
            Some((prev, block_start - self.block_len(prev) as i64))
        } else {
            self.first.map(|f| (f, 0))
        };
        (removed, anchor)
    }

    // ---- queries --------------------------------------------------------

    pub fn number_of_events(&self) -> usize {
        self.num_events
    }

    pub fn is_empty(&self) -> bool {
        self.num_events == 0
    }

    pub fn channel_event_count(&self, channel: u8) -> usize {
        self.nch[(channel & 0x0f) as usize]
    }

    pub fn sysex_event_count(&self) -> usize {
        self.nch[16]
    }

    pub fn non_midi_event_count(&self) -> usize {
        self.nch[17]
    }

    /// Channel events plus sysex
    pub fn midi_event_count(&self) -> usize {
        self.nch[..17].iter().sum()
    }

    pub fn duration(&self) -> Tick {
        self.duration
    }

    /// Sets the track length; never shorter than the largest covered tick + 1
    pub fn set_duration(&mut self, duration: Tick) {
        self.duration = duration.max(self.largest_tick() + 1).max(0);
    }

    pub(crate) fn extend_duration(&mut self, event: &Event) {
        let end = event.tick.max(event.end_tick()) + 1;
        if end > self.duration {
            self.duration = end;
        }
    }

    /// Largest tick covered by any event, durations included
    pub fn largest_tick(&self) -> Tick {
        let mut largest = NEGATIVE_TICK;
        let mut block = self.first;
        while let Some(id) = block {
            let b = self.block(id);
            largest = largest.max(b.largest_tick());
            block = b.next;
        }
        largest
    }

    /// Iterates the events in order
    pub fn iter(&self) -> TrackIter<'_> {
        TrackIter {
            track: self,
            block: self.first,
            index: 0,
        }
    }

    /// Positions of events that start before `tick` and end after it
    pub fn events_with_duration_crossing_tick(&self, tick: Tick) -> Vec<i64> {
        let mut found = Vec::new();
        let mut position = 0i64;
        let mut block = self.first;
        while let Some(id) = block {
            let b = self.block(id);
            if b.first_tick() >= tick {
                break;
            }
            if b.largest_tick() > tick {
                for (i, event) in b.events.iter().enumerate() {
                    if event.tick < tick && event.end_tick() > tick {
                        found.push(position + i as i64);
                    }
                }
            }
            position += b.len() as i64;
            block = b.next;
        }
        found
    }

    /// Positions of events accepted by `selector`
    pub fn search_events<F>(&self, mut selector: F) -> Vec<i64>
    where
        F: FnMut(&Event) -> bool,
    {
        self.iter()
            .enumerate()
            .filter(|(_, e)| selector(e))
            .map(|(i, _)| i as i64)
            .collect()
    }

    // ---- whole-track edits ---------------------------------------------

    /// Appends events; out-of-order ones are inserted at their tick
    pub fn append_events(&mut self, events: impl IntoIterator<Item = Event>) -> SeqResult<usize> {
        let old_num = self.num_events as i64;
        let mut scratch: Option<CursorId> = None;
        let mut count = 0;
        for event in events {
            let in_order = match self.last {
                Some(last) => self
                    .block(last)
                    .events
                    .last()
                    .is_none_or(|e| e.tick <= event.tick),
                None => true,
            };
            if in_order {
                self.count_event(&event, 1);
                self.extend_duration(&event);
                self.push_event(event)?;
            } else {
                let id = *scratch.get_or_insert_with(|| self.new_cursor());
                self.jump_to_tick(id, event.tick);
                self.insert_event(id, event)?;
            }
            count += 1;
        }
        if let Some(id) = scratch {
            self.release_cursor(id);
        }
        self.relocate_cursors_from(old_num);
        Ok(count)
    }

    /// Removes every event; cursors go back to -1
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.free_blocks.clear();
        self.first = None;
        self.last = None;
        self.num_events = 0;
        self.nch = [0; CHANNEL_SLOTS];
        self.duration = 0;
        self.touch();
        for slot in &mut self.cursors {
            if let Some(state) = slot.state.as_mut() {
                *state = CursorState::default();
            }
        }
    }

    /// Copy with the same events and properties but no cursors.
    /// Payload buffers are shared with the source.
    pub fn duplicate(&self) -> SeqResult<Track> {
        let mut copy = Track::new();
        for event in self.iter() {
            copy.push_event(event.clone())?;
        }
        copy.nch = self.nch;
        copy.duration = self.duration;
        copy.name = self.name.clone();
        copy.device_name = self.device_name.clone();
        copy.device = self.device;
        copy.track_channel = self.track_channel;
        copy.attribute = self.attribute;
        Ok(copy)
    }

    /// Appends at the end without order checks or bookkeeping
    fn push_event(&mut self, event: Event) -> SeqResult<()> {
        let target = match self.last {
            Some(last) if self.block_len(last) < BLOCK_CAPACITY => last,
            tail => {
                let id = self.new_block_with(Vec::with_capacity(BLOCK_CAPACITY))?;
                self.link_after(tail, id);
                id
            }
        };
        let block = self.block_mut(target);
        block.events.push(event);
        block.invalidate();
        self.num_events += 1;
        self.touch();
        Ok(())
    }

    /// Stable merge of `other` into this track. Returns the positions, in the
    /// merged track, of the events that came from `other`.
    ///
    /// On equal ticks an event of `other` lands after the events already here,
    /// unless `tie_break` (sorted merged positions) lists the position being
    /// filled, in which case the event of `other` takes it.
    pub fn merge(&mut self, other: &Track, tie_break: Option<&[i64]>) -> SeqResult<Vec<i64>> {
        let mut merged = Vec::new();
        merged
            .try_reserve(self.num_events + other.num_events)
            .map_err(|_| SequencerError::OutOfMemory)?;
        let mut from_other = Vec::with_capacity(other.num_events);
        let mut new_position = Vec::with_capacity(self.num_events);
        let mut mine = self.iter().cloned().peekable();
        let mut theirs = other.iter().cloned().peekable();
        loop {
            let take_mine = match (mine.peek(), theirs.peek()) {
                (Some(a), Some(b)) if a.tick == b.tick => {
                    let position = merged.len() as i64;
                    !tie_break.is_some_and(|set| set.binary_search(&position).is_ok())
                }
                (Some(a), Some(b)) => a.tick < b.tick,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_mine {
                if let Some(event) = mine.next() {
                    new_position.push(merged.len() as i64);
                    merged.push(event);
                }
            } else if let Some(event) = theirs.next() {
                from_other.push(merged.len() as i64);
                merged.push(event);
            }
        }
        let duration = self.duration.max(other.duration);
        self.rebuild(merged)?;
        self.duration = duration;
        let added = from_other.len() as i64;
        self.remap_cursors(|pos| {
            if pos < 0 {
                (pos, false)
            } else {
                let moved = new_position.get(pos as usize).copied();
                (moved.unwrap_or(pos + added), false)
            }
        });
        Ok(from_other)
    }

    /// Moves the events at `positions` into a new track
    pub fn unmerge(&mut self, positions: &[i64]) -> SeqResult<Track> {
        self.unmerge_sub(positions, true)
    }

    /// Copies the events at `positions` into a new track
    pub fn extract(&mut self, positions: &[i64]) -> SeqResult<Track> {
        self.unmerge_sub(positions, false)
    }

    fn unmerge_sub(&mut self, positions: &[i64], remove: bool) -> SeqResult<Track> {
        let mut selected = vec![false; self.num_events];
        for &pos in positions {
            let slot = usize::try_from(pos)
                .ok()
                .and_then(|p| selected.get_mut(p))
                .ok_or(SequencerError::BadIndex(pos))?;
            *slot = true;
        }
        let mut out = Track::new();
        out.device_name = self.device_name.clone();
        out.device = self.device;
        out.track_channel = self.track_channel;
        if !remove {
            for (event, _) in self.iter().zip(&selected).filter(|(_, s)| **s) {
                out.push_event(event.clone())?;
            }
            out.recount();
            out.set_duration(self.duration);
            return Ok(out);
        }
        let mut kept = Vec::with_capacity(self.num_events);
        // New position of each old one; removed events map to the next survivor
        let mut new_position = Vec::with_capacity(self.num_events);
        for (event, sel) in self.iter().zip(&selected) {
            if *sel {
                new_position.push((kept.len() as i64, true));
                out.push_event(event.clone())?;
            } else {
                new_position.push((kept.len() as i64, false));
                kept.push(event.clone());
            }
        }
        let survivors = kept.len() as i64;
        let duration = self.duration;
        self.rebuild(kept)?;
        self.duration = duration;
        self.remap_cursors(|pos| {
            if pos < 0 {
                (pos, false)
            } else {
                new_position
                    .get(pos as usize)
                    .copied()
                    .unwrap_or((survivors, false))
            }
        });
        out.recount();
        out.set_duration(duration);
        Ok(out)
    }

    /// Splits a multi-channel track. This track keeps the non-channel events
    /// and the lowest channel; every other channel moves to its own track.
    /// Returns `(channel, track)` pairs for the split-off tracks.
    pub fn split_by_midi_channel(&mut self) -> SeqResult<Vec<(u8, Track)>> {
        let present: Vec<u8> = (0..16u8).filter(|&ch| self.nch[ch as usize] > 0).collect();
        let mut out = Vec::new();
        if present.len() <= 1 {
            return Ok(out);
        }
        for &ch in present.iter().skip(1).rev() {
            let positions = self.search_events(|e| e.is_channel_event() && e.channel == ch);
            let mut track = self.unmerge(&positions)?;
            track.track_channel = ch;
            out.push((ch, track));
        }
        if let Some(&lowest) = present.first() {
            self.track_channel = lowest;
        }
        out.reverse();
        Ok(out)
    }

    /// Pairs a note-off with the most recent unpaired note-on of the same
    /// key and channel, turning it into a Note with a duration
    pub fn match_note_off(
        &mut self,
        tick: Tick,
        channel: u8,
        key: u8,
        velocity: u8,
    ) -> SeqResult<()> {
        let mut block = self.last;
        let mut found = None;
        while let Some(id) = block {
            let b = self.block_mut(id);
            for event in b.events.iter_mut().rev() {
                if event.channel != channel {
                    continue;
                }
                if let Message::NoteOn {
                    key: k,
                    velocity: on_velocity,
                    duration,
                } = event.message
                {
                    if k == key && (duration == 0 || duration == tick - event.tick) {
                        let duration = tick - event.tick;
                        event.message = Message::Note {
                            key,
                            on_velocity,
                            off_velocity: velocity,
                            duration,
                        };
                        found = Some(event.tick + duration);
                        break;
                    }
                }
            }
            if found.is_some() {
                b.invalidate();
                break;
            }
            block = b.prev;
        }
        if found.is_some() {
            self.touch();
        }
        match found {
            Some(end) => {
                if end + 1 > self.duration {
                    self.duration = end + 1;
                }
                Ok(())
            }
            None => Err(SequencerError::OrphanedNoteOff {
                tick,
                code: key,
                channel,
            }),
        }
    }

    /// Pairs every internal note-on of this track with the first matching
    /// note-off of `note_offs` at or after it. Matched note-offs become Null.
    /// Returns the number of note-ons left unpaired.
    pub fn match_note_off_in_track(&mut self, note_offs: &mut Track) -> usize {
        let mut unpaired = 0;
        let mut offs: Vec<(Tick, u8, u8, u8, bool)> = note_offs
            .iter()
            .map(|e| match e.message {
                Message::NoteOff { key, velocity } => (e.tick, e.channel, key, velocity, true),
                _ => (e.tick, e.channel, 0, 0, false),
            })
            .collect();
        let mut largest = NEGATIVE_TICK;
        let mut block = self.first;
        while let Some(id) = block {
            let b = self.block_mut(id);
            for event in b.events.iter_mut() {
                let Message::NoteOn { key, velocity, .. } = event.message else {
                    continue;
                };
                let start = offs.partition_point(|o| o.0 < event.tick);
                let matched = offs[start..]
                    .iter_mut()
                    .find(|o| o.4 && o.1 == event.channel && o.2 == key);
                match matched {
                    Some(off) => {
                        off.4 = false;
                        event.message = Message::Note {
                            key,
                            on_velocity: velocity,
                            off_velocity: off.3,
                            duration: off.0 - event.tick,
                        };
                        largest = largest.max(off.0);
                    }
                    None => unpaired += 1,
                }
            }
            b.invalidate();
            block = b.next;
        }
        self.touch();
        // Consumed note-offs become blanks
        let mut index = 0;
        let mut block = note_offs.first;
        while let Some(id) = block {
            let b = note_offs.block_mut(id);
            for event in b.events.iter_mut() {
                if matches!(event.message, Message::NoteOff { .. })
                    && offs.get(index).is_some_and(|o| !o.4)
                {
                    event.message = Message::Null;
                }
                index += 1;
            }
            b.invalidate();
            block = b.next;
        }
        note_offs.recount();
        note_offs.touch();
        if largest >= self.duration {
            self.duration = largest + 1;
        }
        unpaired
    }

    /// Replaces every tick at once and restores ordering with a stable sort.
    /// Cursors keep their numeric positions.
    pub fn change_tick_all(&mut self, new_ticks: &[Tick]) -> SeqResult<()> {
        if new_ticks.len() != self.num_events {
            return Err(SequencerError::BadParameter(format!(
                "expected {} ticks, got {}",
                self.num_events,
                new_ticks.len()
            )));
        }
        let mut events: Vec<Event> = self
            .iter()
            .zip(new_ticks)
            .map(|(e, &tick)| Event { tick, ..e.clone() })
            .collect();
        events.sort_by_key(|e| e.tick);
        let largest = events.iter().map(Event::end_tick).max().unwrap_or(NEGATIVE_TICK);
        self.rebuild(events)?;
        self.duration = self.duration.max(largest + 1);
        self.remap_cursors(|pos| (pos, false));
        Ok(())
    }

    /// Shifts every event by `offset` ticks
    pub fn offset_tick(&mut self, offset: Tick) -> SeqResult<()> {
        if let Some(first) = self.event_at(0) {
            if first.tick + offset < 0 {
                return Err(SequencerError::BadParameter(format!(
                    "offset {offset} moves events before tick 0"
                )));
            }
        }
        let mut block = self.first;
        while let Some(id) = block {
            let b = self.block_mut(id);
            for event in &mut b.events {
                event.tick += offset;
            }
            b.invalidate();
            block = b.next;
        }
        self.touch();
        self.duration = (self.duration + offset).max(self.largest_tick() + 1);
        Ok(())
    }

    /// Rewrites the channel of every channel event through `map`
    pub fn remap_channel(&mut self, map: &[u8; 16]) {
        let mut block = self.first;
        while let Some(id) = block {
            let b = self.block_mut(id);
            for event in &mut b.events {
                if event.is_channel_event() {
                    event.channel = map[(event.channel & 0x0f) as usize] & 0x0f;
                }
            }
            block = b.next;
        }
        self.recount();
        self.touch();
    }

    // ---- properties ---------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.device_name = name.into();
    }

    pub fn device(&self) -> Option<usize> {
        self.device
    }

    pub fn set_device(&mut self, device: Option<usize>) {
        self.device = device;
    }

    /// Output channel used in single-channel mode
    pub fn track_channel(&self) -> u8 {
        self.track_channel
    }

    pub fn set_track_channel(&mut self, channel: u8) {
        self.track_channel = channel & 0x0f;
    }

    pub fn attribute(&self) -> TrackAttribute {
        self.attribute
    }

    pub fn set_attribute(&mut self, attribute: TrackAttribute) {
        self.attribute = attribute;
    }

    /// Sequence name meta before the first MIDI event, else the first text meta
    pub fn guess_name(&self) -> Option<String> {
        self.leading_text(meta::SEQUENCE_NAME)
            .or_else(|| self.leading_text(meta::TEXT))
    }

    /// Device name meta, instrument name, port number meta, or a hint in
    /// the track name such as "[A1]" or "Port B"
    pub fn guess_device_name(&self) -> Option<String> {
        if let Some(name) = self
            .leading_text(meta::DEVICE_NAME)
            .or_else(|| self.leading_text(meta::INSTRUMENT_NAME))
        {
            return Some(name);
        }
        let port = self
            .leading_events()
            .find_map(|e| match e.message {
                Message::PortNumber(port) => Some(i32::from(port)),
                _ => None,
            })
            .or_else(|| self.guess_name().map(|name| port_from_name(&name)));
        port.map(|p| format!("(Device {})", p + 1))
    }

    fn leading_events(&self) -> impl Iterator<Item = &Event> {
        self.iter()
            .take_while(|e| !e.is_channel_event() && !e.is_sysex())
    }

    fn leading_text(&self, code: u8) -> Option<String> {
        self.leading_events().find_map(|e| match &e.message {
            Message::MetaText { code: c, text } if *c == code => {
                Some(String::from_utf8_lossy(text.as_bytes()).into_owned())
            }
            _ => None,
        })
    }

    /// Recounts channel counters, block caches and duration. With `check`,
    /// inconsistencies found on the way are reported instead of silently
    /// repaired.
    pub fn recache(&mut self, check: bool) -> Vec<String> {
        let mut findings = Vec::new();
        let mut nch = [0; CHANNEL_SLOTS];
        let mut count = 0usize;
        let mut last_tick = NEGATIVE_TICK;
        let mut prev: Option<BlockId> = None;
        let mut block = self.first;
        while let Some(id) = block {
            let b = self.block(id);
            if check && b.prev != prev {
                findings.push(format!("block {} has a broken back link", id.0));
            }
            if check && b.events.is_empty() {
                findings.push(format!("block {} is empty", id.0));
            }
            for event in &b.events {
                if check && event.tick < last_tick {
                    findings.push(format!(
                        "tick disorder at position {count}: {} after {last_tick}",
                        event.tick
                    ));
                }
                last_tick = last_tick.max(event.tick);
                if let Some(slot) = event.channel_slot() {
                    nch[slot] += 1;
                }
                count += 1;
            }
            b.invalidate();
            prev = Some(id);
            block = b.next;
        }
        if check && prev != self.last {
            findings.push("last block does not terminate the chain".to_string());
        }
        if check && count != self.num_events {
            findings.push(format!(
                "event count is {} but {count} events are stored",
                self.num_events
            ));
        }
        if check && nch != self.nch {
            findings.push("channel counters are out of date".to_string());
        }
        let largest = self.largest_tick();
        if check && self.duration <= largest && count > 0 {
            findings.push(format!(
                "duration {} does not cover tick {largest}",
                self.duration
            ));
        }
        self.num_events = count;
        self.nch = nch;
        self.duration = self.duration.max(largest + 1);
        for finding in &findings {
            tracing::warn!(track = %self.name, "{finding}");
        }
        findings
    }

    /// Kind filter used by selectors
    pub fn kind_matches(event: &Event, kind: EventKind, code: Option<u8>) -> bool {
        event.kind() == kind && (code.is_none() || event.code() == code)
    }
}

/// "[A1]", "(B2)", "A1:" select a port by letter; "PART B" or "PORT 2" by suffix
fn port_from_name(name: &str) -> i32 {
    let bytes = name.as_bytes();
    let bracketed = matches!(bytes.first(), Some(b'[' | b'(' | b'<' | b'{'));
    let at = usize::from(bracketed);
    if let (Some(&c), Some(&d)) = (bytes.get(at), bytes.get(at + 1)) {
        if c.is_ascii_alphabetic() && d.is_ascii_digit() {
            let after_digits = name[at + 1..].trim_start_matches(|ch: char| ch.is_ascii_digit());
            if bracketed || after_digits.starts_with(':') {
                return i32::from(c.to_ascii_uppercase() - b'A');
            }
        }
    }
    let squeezed: String = name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let Some(rest) = squeezed
        .strip_prefix("PART")
        .or_else(|| squeezed.strip_prefix("PORT"))
    else {
        return 0;
    };
    match rest.as_bytes().first() {
        Some(&c) if c.is_ascii_alphabetic() => i32::from(c - b'A'),
        Some(c) if c.is_ascii_digit() => {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        }
        _ => 0,
    }
}

/// In-order iterator over the events of a track
pub struct TrackIter<'a> {
    track: &'a Track,
    block: Option<BlockId>,
    index: usize,
}

impl<'a> Iterator for TrackIter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<&'a Event> {
        loop {
            let block = self.track.block(self.block?);
            if let Some(event) = block.events.get(self.index) {
                self.index += 1;
                return Some(event);
            }
            self.block = block.next;
            self.index = 0;
        }
    }
}
