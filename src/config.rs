// Player configuration - persisted as RON

use crate::error::{SeqResult, SequencerError};
use crate::sequencer::metronome::ClickSound;
use crate::sequencer::recording::DEFAULT_CHUNK_SIZE;
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "mymusic-sequencer";
const CONFIG_FILE: &str = "player.ron";

/// Metronome output and sounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeConfig {
    /// Output device name; empty disables the metronome
    pub destination: String,
    pub channel: u8,
    pub accent: ClickSound,
    pub regular: ClickSound,
    pub enable_when_playing: bool,
    pub enable_when_recording: bool,
    /// Delay between a click's note-on and its note-off
    pub click_length_us: i64,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            channel: 9,
            accent: ClickSound::new(76, 127),
            regular: ClickSound::new(77, 100),
            enable_when_playing: false,
            enable_when_recording: true,
            click_length_us: 80_000,
        }
    }
}

/// Scheduler timing and recording settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// How far ahead of the clock events are handed to the output
    pub prefetch_interval_us: i64,
    pub min_interval_us: i64,
    /// Longest single sleep of the scheduler thread
    pub max_interval_us: i64,
    pub recording_chunk_size: usize,
    pub metronome: MetronomeConfig,
    /// Bars of metronome clicks before playback starts
    pub count_off_bars: u32,
    /// Output device echoing the MIDI input; empty for none
    pub thru_destination: String,
    /// 0..=15 rechannelizes the echoed messages, 16 keeps their channel
    pub thru_channel: u8,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            prefetch_interval_us: 100_000,
            min_interval_us: 50_000,
            max_interval_us: 100_000,
            recording_chunk_size: DEFAULT_CHUNK_SIZE,
            metronome: MetronomeConfig::default(),
            count_off_bars: 0,
            thru_destination: String::new(),
            thru_channel: 16,
        }
    }
}

impl PlayerConfig {
    /// Clamps out-of-range values
    pub fn validated(mut self) -> Self {
        self.prefetch_interval_us = self.prefetch_interval_us.max(0);
        self.min_interval_us = self.min_interval_us.max(1_000);
        self.max_interval_us = self.max_interval_us.max(self.min_interval_us);
        self.recording_chunk_size = self.recording_chunk_size.max(64);
        self.metronome.channel &= 0x0f;
        self.metronome.click_length_us = self.metronome.click_length_us.max(0);
        self.thru_channel = self.thru_channel.min(16);
        self
    }

    pub fn to_ron(&self) -> SeqResult<String> {
        Ok(ron::ser::to_string_pretty(self, PrettyConfig::default())?)
    }

    pub fn from_ron(text: &str) -> SeqResult<Self> {
        let config: Self = ron::from_str(text)?;
        Ok(config.validated())
    }

    pub fn load_from_path(path: &Path) -> SeqResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    pub fn save_to_path(&self, path: &Path) -> SeqResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_ron()?)?;
        Ok(())
    }

    /// Loads the default file, falling back to defaults when it is absent
    pub fn load_or_default() -> SeqResult<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from_path(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// `<config dir>/mymusic-sequencer/player.ron`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Rejects a config whose devices are named but unknown
pub fn check_destinations(config: &PlayerConfig, names: &[String]) -> SeqResult<()> {
    for name in [&config.metronome.destination, &config.thru_destination] {
        if !name.is_empty() && !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            return Err(SequencerError::Config(format!("unknown destination '{name}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.prefetch_interval_us, 100_000);
        assert_eq!(config.min_interval_us, 50_000);
        assert_eq!(config.max_interval_us, 100_000);
        assert_eq!(config.recording_chunk_size, 32_768);
        assert_eq!(config.metronome.click_length_us, 80_000);
    }

    #[test]
    fn test_ron_round_trip() {
        let mut config = PlayerConfig::default();
        config.count_off_bars = 2;
        config.metronome.destination = "Synth".into();
        let text = config.to_ron().unwrap();
        assert_eq!(PlayerConfig::from_ron(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = PlayerConfig::from_ron("(count_off_bars: 1, thru_channel: 40)").unwrap();
        assert_eq!(config.count_off_bars, 1);
        assert_eq!(config.thru_channel, 16);
        assert_eq!(config.prefetch_interval_us, 100_000);
    }

    #[test]
    fn test_bad_ron_is_config_error() {
        assert!(matches!(
            PlayerConfig::from_ron("(prefetch_interval_us: \"soon\")"),
            Err(SequencerError::Config(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("player.ron");
        let config = PlayerConfig {
            min_interval_us: 20_000,
            ..PlayerConfig::default()
        };
        config.save_to_path(&path).unwrap();
        assert_eq!(PlayerConfig::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn test_check_destinations() {
        let mut config = PlayerConfig::default();
        let names = vec!["Synth".to_string()];
        assert!(check_destinations(&config, &names).is_ok());
        config.thru_destination = "synth".into();
        assert!(check_destinations(&config, &names).is_ok());
        config.metronome.destination = "Drums".into();
        assert!(check_destinations(&config, &names).is_err());
    }
}
