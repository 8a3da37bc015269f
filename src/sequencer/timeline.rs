// Timeline - Musical time representation
// Tempo and time signature payloads, bar:beat:tick positions

use crate::midi::event::Tick;
use std::fmt;

/// Time signature as stored in the 0x58 meta event
/// Example: 6/8 = TimeSignature { numerator: 6, denominator_power: 3, .. }
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TimeSignature {
    pub numerator: u8,         // Beats per bar
    pub denominator_power: u8, // Note value as a power of two (2 = quarter)
    pub clocks_per_click: u8,  // Metronome click in 1/24 quarter notes
    pub thirty_seconds_per_quarter: u8,
}

impl TimeSignature {
    /// Creates a time signature from a written denominator (4, 8, ...).
    /// Denominators that are not a power of two are rounded down to one.
    pub fn new(numerator: u8, denominator: u8) -> Self {
        let denominator_power = denominator.max(1).ilog2() as u8;
        // Click once per written beat
        let clocks_per_click = (96u32 >> denominator_power).clamp(1, 255) as u8;
        Self {
            numerator: numerator.max(1),
            denominator_power,
            clocks_per_click,
            thirty_seconds_per_quarter: 8,
        }
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            numerator: bytes[0],
            denominator_power: bytes[1],
            clocks_per_click: bytes[2],
            thirty_seconds_per_quarter: bytes[3],
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [
            self.numerator,
            self.denominator_power,
            self.clocks_per_click,
            self.thirty_seconds_per_quarter,
        ]
    }

    /// Common 4/4 time signature
    pub fn four_four() -> Self {
        Self::new(4, 4)
    }

    /// Common 3/4 time signature (waltz)
    pub fn three_four() -> Self {
        Self::new(3, 4)
    }

    /// Common 6/8 time signature
    pub fn six_eight() -> Self {
        Self::new(6, 8)
    }

    /// Written denominator (4 = quarter note)
    pub fn denominator(&self) -> u32 {
        1u32.checked_shl(u32::from(self.denominator_power)).unwrap_or(0)
    }

    pub fn beats_per_bar(&self) -> i64 {
        i64::from(self.numerator)
    }

    /// Ticks per written beat. Absurd exponents degrade to one quarter.
    pub fn ticks_per_beat(&self, timebase: i64) -> i64 {
        if self.denominator_power >= 31 {
            timebase
        } else {
            ((timebase * 4) >> self.denominator_power).max(1)
        }
    }

    pub fn ticks_per_bar(&self, timebase: i64) -> i64 {
        self.ticks_per_beat(timebase) * self.beats_per_bar()
    }

    /// Metronome (bar length, click length) in ticks
    pub fn metronome_lengths(&self, timebase: i64) -> (Tick, Tick) {
        let beat = timebase * i64::from(self.clocks_per_click) / 24;
        let bar = if self.denominator_power >= 31 {
            timebase * 4
        } else {
            timebase * i64::from(self.numerator) * 4 / (1i64 << self.denominator_power)
        };
        (bar.max(1), beat.max(1))
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::four_four()
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator())
    }
}

/// Tempo in BPM (quarter notes per minute)
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tempo {
    bpm: f32,
}

impl Tempo {
    pub const MIN_BPM: f32 = 3.6;
    pub const MAX_BPM: f32 = 100_000.0;
    pub const DEFAULT_BPM: f32 = 120.0;

    /// Creates a new tempo, clamped to [`Tempo::MIN_BPM`, `Tempo::MAX_BPM`]
    pub fn new(bpm: f32) -> Self {
        let bpm = if bpm.is_finite() { bpm } else { Self::DEFAULT_BPM };
        Self {
            bpm: bpm.clamp(Self::MIN_BPM, Self::MAX_BPM),
        }
    }

    /// Get BPM value
    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    /// From the 24-bit "microseconds per quarter" meta payload
    pub fn from_micros_per_quarter(micros: u32) -> Self {
        Self::new(60_000_000.0 / micros.max(1) as f32)
    }

    /// To the 24-bit "microseconds per quarter" meta payload
    pub fn micros_per_quarter(&self) -> u32 {
        let micros = (60_000_000.0 / f64::from(self.bpm)).round();
        micros.clamp(1.0, f64::from(0x00ff_ffffu32)) as u32
    }

    /// Wall time of `ticks` at this tempo, unrounded
    pub fn ticks_to_micros(&self, ticks: f64, timebase: i64) -> f64 {
        ticks * 60_000_000.0 / (f64::from(self.bpm) * timebase as f64)
    }

    /// Ticks elapsed in `micros` at this tempo, unrounded
    pub fn micros_to_ticks(&self, micros: f64, timebase: i64) -> f64 {
        micros * timebase as f64 * f64::from(self.bpm) / 60_000_000.0
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BPM)
    }
}

impl fmt::Display for Tempo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} BPM", self.bpm)
    }
}

/// Musical time representation
/// Bar and beat are 1-based, tick counts within the beat
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct MusicalTime {
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
}

impl MusicalTime {
    pub fn new(bar: i32, beat: i32, tick: i32) -> Self {
        Self { bar, beat, tick }
    }

    /// Bar 1, beat 1, tick 0
    pub fn zero() -> Self {
        Self::new(1, 1, 0)
    }
}

impl Default for MusicalTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for MusicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}:{:03}", self.bar, self.beat, self.tick)
    }
}
