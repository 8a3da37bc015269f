// Sequence - Timebase plus an ordered list of tracks
// Track 0 is the conductor track carrying tempo, time signature and key events.

use crate::error::{SeqResult, SequencerError};
use crate::midi::event::Tick;
use crate::sequencer::track::{Track, TrackAttribute};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Default resolution in ticks per quarter note
pub const DEFAULT_TIMEBASE: i64 = 480;

#[derive(Debug)]
pub struct Sequence {
    timebase: i64,
    tracks: Vec<Track>,
    single_channel: bool,
    /// Invalidation flags of the attached calibrators
    calibrators: Vec<Weak<AtomicBool>>,
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEBASE)
    }
}

impl Sequence {
    pub fn new(timebase: i64) -> Self {
        Self {
            timebase: timebase.max(1),
            tracks: Vec::new(),
            single_channel: false,
            calibrators: Vec::new(),
        }
    }

    pub fn timebase(&self) -> i64 {
        self.timebase
    }

    pub fn set_timebase(&mut self, timebase: i64) {
        self.timebase = timebase.max(1);
        self.reset_calibrators();
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn track_mut(&mut self, index: usize) -> Option<&mut Track> {
        self.tracks.get_mut(index)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Current index of the track with this uid
    pub fn index_of_track_uid(&self, uid: u64) -> Option<usize> {
        self.tracks.iter().position(|t| t.uid() == uid)
    }

    /// Longest track duration
    pub fn duration(&self) -> Tick {
        self.tracks.iter().map(Track::duration).max().unwrap_or(0)
    }

    /// Inserts a track at `index`; -1 (or anything past the end) appends.
    /// Returns the index actually used.
    pub fn insert_track(&mut self, index: i64, track: Track) -> SeqResult<usize> {
        let index = if index < 0 || index as usize > self.tracks.len() {
            self.tracks.len()
        } else {
            index as usize
        };
        self.tracks
            .try_reserve(1)
            .map_err(|_| SequencerError::OutOfMemory)?;
        let recording = track.attribute().contains(TrackAttribute::RECORD);
        self.tracks.insert(index, track);
        if recording {
            self.set_record_flag(index, Some(true));
        }
        self.update_mute_by_solo();
        self.reset_calibrators();
        tracing::debug!(index, tracks = self.tracks.len(), "track inserted");
        Ok(index)
    }

    pub fn delete_track(&mut self, index: usize) -> SeqResult<Track> {
        if index >= self.tracks.len() {
            return Err(SequencerError::BadIndex(index as i64));
        }
        let track = self.tracks.remove(index);
        self.update_mute_by_solo();
        self.reset_calibrators();
        tracing::debug!(index, tracks = self.tracks.len(), "track deleted");
        Ok(track)
    }

    /// Swaps in a new track and hands back the old one
    pub fn replace_track(&mut self, index: usize, track: Track) -> SeqResult<Track> {
        let old = self.delete_track(index)?;
        self.insert_track(index as i64, track)?;
        Ok(old)
    }

    /// Removes every track
    pub fn clear(&mut self) {
        self.tracks.clear();
        self.single_channel = false;
        self.reset_calibrators();
    }

    // ---- attributes -------------------------------------------------------

    /// `None` toggles. Returns false when nothing changed. Setting the
    /// record flag clears it on every other track.
    pub fn set_record_flag(&mut self, index: usize, flag: Option<bool>) -> bool {
        if !self.update_flag(index, TrackAttribute::RECORD, flag) {
            return false;
        }
        let recording = self.tracks[index]
            .attribute()
            .contains(TrackAttribute::RECORD);
        if recording {
            for (n, track) in self.tracks.iter_mut().enumerate() {
                if n != index {
                    let mut attribute = track.attribute();
                    attribute.remove(TrackAttribute::RECORD);
                    track.set_attribute(attribute);
                }
            }
        }
        true
    }

    pub fn set_solo_flag(&mut self, index: usize, flag: Option<bool>) -> bool {
        if !self.update_flag(index, TrackAttribute::SOLO, flag) {
            return false;
        }
        self.update_mute_by_solo();
        true
    }

    pub fn set_mute_flag(&mut self, index: usize, flag: Option<bool>) -> bool {
        self.update_flag(index, TrackAttribute::MUTE, flag)
    }

    fn update_flag(&mut self, index: usize, bit: TrackAttribute, flag: Option<bool>) -> bool {
        let Some(track) = self.tracks.get_mut(index) else {
            return false;
        };
        let mut attribute = track.attribute();
        let on = flag.unwrap_or(!attribute.contains(bit));
        if flag.is_some() && attribute.contains(bit) == on {
            return false;
        }
        attribute.set(bit, on);
        track.set_attribute(attribute);
        true
    }

    /// Tracks without solo become muted-by-solo while any track is soloed
    pub fn update_mute_by_solo(&mut self) {
        let solo = self
            .tracks
            .iter()
            .any(|t| t.attribute().contains(TrackAttribute::SOLO));
        for track in &mut self.tracks {
            let mut attribute = track.attribute();
            let muted = solo && !attribute.contains(TrackAttribute::SOLO);
            attribute.set(TrackAttribute::MUTE_BY_SOLO, muted);
            track.set_attribute(attribute);
        }
    }

    pub fn index_of_recording_track(&self) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.attribute().contains(TrackAttribute::RECORD))
    }

    // ---- channel modes -----------------------------------------------------

    pub fn is_single_channel_mode(&self) -> bool {
        self.single_channel
    }

    /// Moves every channel event to channel 0 and remembers the original
    /// channel as the track channel. With `separate`, multi-channel tracks
    /// are first split into one track per channel.
    pub fn single_channel_mode(&mut self, separate: bool) -> SeqResult<()> {
        if separate {
            for n in (0..self.tracks.len()).rev() {
                let split = self.tracks[n].split_by_midi_channel()?;
                for (offset, (_, track)) in split.into_iter().enumerate() {
                    self.tracks.insert(n + 1 + offset, track);
                }
            }
        }
        for track in &mut self.tracks {
            if let Some(channel) = (0..16u8).rev().find(|&ch| track.channel_event_count(ch) > 0) {
                track.set_track_channel(channel);
            }
            track.remap_channel(&[0; 16]);
        }
        self.single_channel = true;
        self.reset_calibrators();
        Ok(())
    }

    /// Moves the events of every track back to its track channel
    pub fn multi_channel_mode(&mut self) {
        for track in &mut self.tracks {
            if track.midi_event_count() == track.sysex_event_count() {
                continue;
            }
            let mut map = [0u8; 16];
            map[0] = track.track_channel();
            track.remap_channel(&map);
            track.set_track_channel(0);
        }
        self.single_channel = false;
    }

    // ---- calibrators -------------------------------------------------------

    /// Registers a calibrator; the returned flag is raised whenever the
    /// track list changes
    pub fn attach_calibrator(&mut self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.calibrators.retain(|w| w.strong_count() > 0);
        self.calibrators.push(Arc::downgrade(&flag));
        flag
    }

    pub fn detach_calibrator(&mut self, flag: &Arc<AtomicBool>) {
        self.calibrators
            .retain(|w| w.upgrade().is_some_and(|f| !Arc::ptr_eq(&f, flag)));
    }

    pub fn attached_calibrator_count(&self) -> usize {
        self.calibrators.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Forces every attached calibrator to reseek on its next query
    pub fn reset_calibrators(&mut self) {
        self.calibrators.retain(|w| match w.upgrade() {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        });
    }
}

/// Sequence shared between the control thread and a player thread
#[derive(Debug, Clone, Default)]
pub struct SharedSequence {
    inner: Arc<Mutex<Sequence>>,
}

impl SharedSequence {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sequence)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Sequence> {
        self.inner.lock()
    }

    /// Never blocks; `None` while another thread holds the sequence
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Sequence>> {
        self.inner.try_lock()
    }

    pub fn ptr_eq(&self, other: &SharedSequence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::event::Event;

    fn track_on_channels(channels: &[u8]) -> Track {
        Track::from_events(
            channels
                .iter()
                .enumerate()
                .map(|(i, &ch)| Event::note(i as Tick * 10, ch, 60, 100, 5)),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_delete_tracks() {
        let mut seq = Sequence::new(480);
        assert_eq!(seq.insert_track(-1, Track::new()).unwrap(), 0);
        assert_eq!(seq.insert_track(99, track_on_channels(&[0])).unwrap(), 1);
        assert_eq!(seq.insert_track(1, Track::new()).unwrap(), 1);
        assert_eq!(seq.track_count(), 3);
        assert_eq!(seq.duration(), 6);

        let removed = seq.delete_track(2).unwrap();
        assert_eq!(removed.number_of_events(), 1);
        assert!(seq.delete_track(5).is_err());
    }

    #[test]
    fn test_record_flag_is_exclusive() {
        let mut seq = Sequence::new(480);
        for _ in 0..3 {
            seq.insert_track(-1, Track::new()).unwrap();
        }
        assert!(seq.set_record_flag(1, Some(true)));
        assert!(!seq.set_record_flag(1, Some(true)));
        assert!(seq.set_record_flag(2, Some(true)));
        assert_eq!(seq.index_of_recording_track(), Some(2));
        assert!(seq.set_record_flag(2, None));
        assert_eq!(seq.index_of_recording_track(), None);
    }

    #[test]
    fn test_solo_mutes_other_tracks() {
        let mut seq = Sequence::new(480);
        for _ in 0..3 {
            seq.insert_track(-1, Track::new()).unwrap();
        }
        seq.set_solo_flag(0, Some(true));
        assert!(!seq.track(0).unwrap().attribute().is_silent());
        assert!(seq.track(1).unwrap().attribute().is_silent());
        assert!(seq.track(2).unwrap().attribute().is_silent());

        seq.set_solo_flag(0, Some(false));
        assert!(!seq.track(1).unwrap().attribute().is_silent());
    }

    #[test]
    fn test_single_channel_mode_splits_tracks() {
        let mut seq = Sequence::new(480);
        seq.insert_track(-1, track_on_channels(&[0, 3, 3, 9])).unwrap();
        seq.single_channel_mode(true).unwrap();

        assert!(seq.is_single_channel_mode());
        assert_eq!(seq.track_count(), 3);
        let channels: Vec<u8> = seq.tracks().iter().map(Track::track_channel).collect();
        assert_eq!(channels, vec![0, 3, 9]);
        assert_eq!(seq.track(1).unwrap().channel_event_count(0), 2);

        seq.multi_channel_mode();
        assert_eq!(seq.track(1).unwrap().channel_event_count(3), 2);
        assert_eq!(seq.track(2).unwrap().channel_event_count(9), 1);
    }

    #[test]
    fn test_calibrator_flags() {
        let mut seq = Sequence::new(480);
        let flag = seq.attach_calibrator();
        {
            let dropped = seq.attach_calibrator();
            assert_eq!(seq.attached_calibrator_count(), 2);
            drop(dropped);
        }
        assert_eq!(seq.attached_calibrator_count(), 1);

        seq.insert_track(-1, Track::new()).unwrap();
        assert!(flag.load(Ordering::Acquire));

        seq.detach_calibrator(&flag);
        assert_eq!(seq.attached_calibrator_count(), 0);
    }

    #[test]
    fn test_shared_sequence_try_lock() {
        let shared = SharedSequence::new(Sequence::new(480));
        let guard = shared.lock();
        assert!(shared.try_lock().is_none());
        drop(guard);
        assert!(shared.try_lock().is_some());
    }
}
