// Metronome - Click scheduling in ticks
// Accent on every bar line, regular click on every metronome beat. Beat and
// bar lengths follow the time signature in force and are recomputed at each
// time signature change.

use crate::midi::event::{MAX_TICK, Tick};
use crate::sequencer::timeline::TimeSignature;
use serde::{Deserialize, Serialize};

/// Metronome click type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickType {
    /// Click on first beat of bar (accent/downbeat)
    Accent,
    /// Click on other beats
    Regular,
}

/// Note played for one kind of click
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickSound {
    pub note: u8,
    pub velocity: u8,
}

impl ClickSound {
    pub fn new(note: u8, velocity: u8) -> Self {
        Self {
            note: note & 0x7f,
            velocity: velocity & 0x7f,
        }
    }

    pub fn note_on(&self, channel: u8) -> [u8; 3] {
        [0x90 | (channel & 0x0f), self.note & 0x7f, self.velocity & 0x7f]
    }

    /// Note-on with velocity 0
    pub fn note_off(&self, channel: u8) -> [u8; 3] {
        [0x90 | (channel & 0x0f), self.note & 0x7f, 0]
    }
}

/// Time signature in force at some tick, as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureSpan {
    /// Tick of the signature event, 0 when there is none
    pub start: Tick,
    pub signature: Option<TimeSignature>,
    /// Tick of the next signature event, `MAX_TICK` when none
    pub next_change: Tick,
}

impl SignatureSpan {
    /// 4/4 from tick 0 and no change
    pub fn default_span() -> Self {
        Self {
            start: 0,
            signature: None,
            next_change: MAX_TICK,
        }
    }

    /// (bar, beat) lengths in ticks
    pub fn lengths(&self, timebase: i64) -> (Tick, Tick) {
        match self.signature {
            Some(signature) => signature.metronome_lengths(timebase),
            None => ((timebase * 4).max(1), timebase.max(1)),
        }
    }
}

/// Metronome scheduler
/// Walks bar lines and beats forward from a prepared tick
#[derive(Debug, Clone)]
pub struct MetronomeScheduler {
    beat: Tick,
    bar: Tick,
    /// Next click; -1 until prepared
    next_beat: Tick,
    next_bar: Tick,
    next_signature: Tick,
}

impl MetronomeScheduler {
    /// Create new scheduler
    pub fn new() -> Self {
        Self {
            beat: 1,
            bar: 1,
            next_beat: -1,
            next_bar: 0,
            next_signature: MAX_TICK,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.next_beat >= 0
    }

    /// Forget the position (transport stopped, metronome turned off)
    pub fn reset(&mut self) {
        self.next_beat = -1;
    }

    /// Tick of the next click, if prepared
    pub fn next_click_tick(&self) -> Option<Tick> {
        self.is_prepared().then_some(self.next_beat)
    }

    /// Positions the scheduler on the first bar line or beat at or after
    /// `tick`, `span` being the signature in force at `tick`
    pub fn prepare(&mut self, tick: Tick, span: SignatureSpan, timebase: i64) {
        let (bar, beat) = span.lengths(timebase);
        self.bar = bar;
        self.beat = beat;
        let start = span.start.min(tick);
        self.next_bar = start + (tick - start + bar - 1) / bar * bar;
        let mut bar_start = self.next_bar;
        if bar_start > tick {
            bar_start -= bar;
        }
        self.next_beat = bar_start + (tick - bar_start + beat - 1) / beat * beat;
        if self.next_beat > self.next_bar {
            self.next_beat = self.next_bar;
        }
        self.next_signature = span.next_change;
    }

    /// Next click before `limit`, advancing past it. `span_at` is asked for
    /// the signature starting at a change tick when the walk reaches it.
    pub fn next_click<F>(&mut self, limit: Tick, timebase: i64, mut span_at: F) -> Option<(Tick, ClickType)>
    where
        F: FnMut(Tick) -> SignatureSpan,
    {
        if !self.is_prepared() || self.next_beat >= limit {
            return None;
        }
        let click = if self.next_beat >= self.next_bar {
            let tick = self.next_bar;
            if self.next_bar == self.next_signature {
                let span = span_at(self.next_signature);
                let (bar, beat) = span.lengths(timebase);
                self.bar = bar;
                self.beat = beat;
                self.next_signature = span.next_change.max(self.next_bar + 1);
            }
            self.next_beat = self.next_bar + self.beat;
            self.next_bar += self.bar;
            if self.next_bar > self.next_signature {
                self.next_bar = self.next_signature;
            }
            (tick, ClickType::Accent)
        } else {
            let tick = self.next_beat;
            self.next_beat += self.beat;
            (tick, ClickType::Regular)
        };
        if self.next_beat > self.next_bar {
            self.next_beat = self.next_bar;
        }
        Some(click)
    }
}

impl Default for MetronomeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Clicks of a count-off of `bars` bars, ticks relative to its start
pub fn count_off_clicks(signature: Option<TimeSignature>, bars: u32, timebase: i64) -> Vec<(Tick, ClickType)> {
    let span = SignatureSpan {
        signature,
        ..SignatureSpan::default_span()
    };
    let (bar, beat) = span.lengths(timebase);
    let total = bar * i64::from(bars);
    let mut clicks = Vec::new();
    let mut bar_start = 0;
    while bar_start < total {
        let mut tick = bar_start;
        clicks.push((tick, ClickType::Accent));
        tick += beat;
        while tick < bar_start + bar {
            clicks.push((tick, ClickType::Regular));
            tick += beat;
        }
        bar_start += bar;
    }
    clicks
}
