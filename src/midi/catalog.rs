// Track catalog - summary of a sequence's tracks for clipboard and file listings
// Binary layout, all integers 32-bit big-endian, every record prefixed by its
// own length (the length field excluded):
//   header: len, track count, start tick, end tick
//   track:  len, original index, name (64 bytes, NUL padded), events, MIDI events
// Readers skip whatever a record holds past the fields they know.

use crate::error::{SeqResult, SequencerError};
use crate::midi::event::Tick;
use crate::sequencer::sequence::Sequence;
use serde::{Deserialize, Serialize};
use std::io::Write;

pub const NAME_FIELD_LEN: usize = 64;
const HEADER_FIELDS_LEN: u32 = 12;
const TRACK_FIELDS_LEN: u32 = 4 + NAME_FIELD_LEN as u32 + 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogTrack {
    pub original_index: i32,
    pub name: String,
    pub event_count: i32,
    pub midi_event_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub start_tick: Tick,
    pub end_tick: Tick,
    pub tracks: Vec<CatalogTrack>,
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Name bytes as stored: at most 63 bytes, cut on a character boundary
fn name_field(name: &str) -> [u8; NAME_FIELD_LEN] {
    let mut end = name.len().min(NAME_FIELD_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut field = [0u8; NAME_FIELD_LEN];
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    field
}

impl Catalog {
    /// Catalog of every track of `seq` over `start_tick..end_tick`
    pub fn from_sequence(seq: &Sequence, start_tick: Tick, end_tick: Tick) -> Self {
        let tracks = seq
            .tracks()
            .iter()
            .enumerate()
            .map(|(index, track)| CatalogTrack {
                original_index: index as i32,
                name: track.name().to_string(),
                event_count: track.number_of_events() as i32,
                midi_event_count: track.midi_event_count() as i32,
            })
            .collect();
        Self {
            start_tick,
            end_tick,
            tracks,
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> SeqResult<()> {
        let count = i32::try_from(self.tracks.len())
            .map_err(|_| SequencerError::BadParameter("too many catalog tracks".into()))?;
        out.write_all(&HEADER_FIELDS_LEN.to_be_bytes())?;
        out.write_all(&count.to_be_bytes())?;
        out.write_all(&clamp_i32(self.start_tick).to_be_bytes())?;
        out.write_all(&clamp_i32(self.end_tick).to_be_bytes())?;
        for track in &self.tracks {
            out.write_all(&TRACK_FIELDS_LEN.to_be_bytes())?;
            out.write_all(&track.original_index.to_be_bytes())?;
            out.write_all(&name_field(&track.name))?;
            out.write_all(&track.event_count.to_be_bytes())?;
            out.write_all(&track.midi_event_count.to_be_bytes())?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> SeqResult<Vec<u8>> {
        let mut out = Vec::with_capacity(16 + self.tracks.len() * (4 + TRACK_FIELDS_LEN as usize));
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn read_from(data: &[u8]) -> SeqResult<Self> {
        let mut records = Records { data, pos: 0 };
        let header = records.next_record(HEADER_FIELDS_LEN as usize)?;
        let count = be_i32(&header[0..4]);
        if count < 0 {
            return Err(SequencerError::BadParameter(format!("catalog track count {count}")));
        }
        let mut catalog = Catalog {
            start_tick: Tick::from(be_i32(&header[4..8])),
            end_tick: Tick::from(be_i32(&header[8..12])),
            tracks: Vec::with_capacity(count as usize),
        };
        for _ in 0..count {
            let record = records.next_record(TRACK_FIELDS_LEN as usize)?;
            let name_bytes = &record[4..4 + NAME_FIELD_LEN];
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
            let rest = &record[4 + NAME_FIELD_LEN..];
            catalog.tracks.push(CatalogTrack {
                original_index: be_i32(&record[0..4]),
                name: String::from_utf8_lossy(&name_bytes[..name_len]).into_owned(),
                event_count: be_i32(&rest[0..4]),
                midi_event_count: be_i32(&rest[4..8]),
            });
        }
        Ok(catalog)
    }
}

fn be_i32(bytes: &[u8]) -> i32 {
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

struct Records<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Records<'a> {
    /// Next length-prefixed record; at least `min_len` bytes of it are
    /// returned, the remainder is skipped
    fn next_record(&mut self, min_len: usize) -> SeqResult<&'a [u8]> {
        let len_bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(SequencerError::UnexpectedEof)?;
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if len < min_len {
            return Err(SequencerError::UnsupportedFormat(format!(
                "catalog record of {len} bytes, expected {min_len}"
            )));
        }
        let start = self.pos + 4;
        let record = self
            .data
            .get(start..start + len)
            .ok_or(SequencerError::UnexpectedEof)?;
        self.pos = start + len;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::event::Event;
    use crate::sequencer::track::Track;

    fn sample() -> Catalog {
        Catalog {
            start_tick: 0,
            end_tick: 1920,
            tracks: vec![
                CatalogTrack {
                    original_index: 0,
                    name: "Conductor".into(),
                    event_count: 2,
                    midi_event_count: 0,
                },
                CatalogTrack {
                    original_index: 3,
                    name: "Piano".into(),
                    event_count: 40,
                    midi_event_count: 38,
                },
            ],
        }
    }

    #[test]
    fn test_layout() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(bytes.len(), 16 + 2 * 80);
        assert_eq!(&bytes[0..8], &[0, 0, 0, 12, 0, 0, 0, 2]);
        assert_eq!(&bytes[12..16], &1920i32.to_be_bytes());
        assert_eq!(&bytes[16..20], &76u32.to_be_bytes());
        assert_eq!(&bytes[24..33], b"Conductor");
        assert_eq!(bytes[33], 0);
    }

    #[test]
    fn test_read_back() {
        let catalog = sample();
        assert_eq!(Catalog::read_from(&catalog.to_bytes().unwrap()).unwrap(), catalog);
    }

    #[test]
    fn test_longer_records_are_skipped_over() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16u32.to_be_bytes());
        bytes.extend_from_slice(&1i32.to_be_bytes());
        bytes.extend_from_slice(&10i32.to_be_bytes());
        bytes.extend_from_slice(&20i32.to_be_bytes());
        bytes.extend_from_slice(&[9, 9, 9, 9]);
        bytes.extend_from_slice(&80u32.to_be_bytes());
        bytes.extend_from_slice(&7i32.to_be_bytes());
        bytes.extend_from_slice(&name_field("Bass"));
        bytes.extend_from_slice(&5i32.to_be_bytes());
        bytes.extend_from_slice(&4i32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);

        let catalog = Catalog::read_from(&bytes).unwrap();
        assert_eq!(catalog.start_tick, 10);
        assert_eq!(catalog.end_tick, 20);
        assert_eq!(catalog.tracks.len(), 1);
        assert_eq!(catalog.tracks[0].original_index, 7);
        assert_eq!(catalog.tracks[0].name, "Bass");
        assert_eq!(catalog.tracks[0].midi_event_count, 4);
    }

    #[test]
    fn test_truncated_catalog() {
        let bytes = sample().to_bytes().unwrap();
        assert!(matches!(
            Catalog::read_from(&bytes[..bytes.len() - 1]),
            Err(SequencerError::UnexpectedEof)
        ));
        assert!(matches!(Catalog::read_from(&[0, 0]), Err(SequencerError::UnexpectedEof)));
    }

    #[test]
    fn test_long_name_is_cut() {
        let name = "é".repeat(40);
        let field = name_field(&name);
        let stored = field.iter().position(|&b| b == 0).unwrap();
        assert_eq!(stored, 62);
        assert!(std::str::from_utf8(&field[..stored]).is_ok());
    }

    #[test]
    fn test_from_sequence() {
        let mut seq = Sequence::new(480);
        let mut track = Track::from_events(vec![
            Event::meta_text(0, crate::midi::event::meta::TEXT, "hello"),
            Event::note(0, 0, 60, 100, 480),
            Event::program(10, 0, 4),
        ])
        .unwrap();
        track.set_name("Lead");
        seq.insert_track(-1, Track::new()).unwrap();
        seq.insert_track(-1, track).unwrap();

        let catalog = Catalog::from_sequence(&seq, 0, seq.duration());
        assert_eq!(catalog.tracks.len(), 2);
        assert_eq!(catalog.tracks[1].original_index, 1);
        assert_eq!(catalog.tracks[1].name, "Lead");
        assert_eq!(catalog.tracks[1].event_count, 3);
        assert_eq!(catalog.tracks[1].midi_event_count, 2);
        assert_eq!(catalog.end_tick, 481);
    }
}
