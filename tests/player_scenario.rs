//! A file read from bytes, played through an in-memory destination

use mymusic_sequencer::midi::event::{Event, meta};
use mymusic_sequencer::midi::smf::{read_smf, write_smf};
use mymusic_sequencer::{
    CollectingSink, DeviceContext, ManualClock, Player, PlayerConfig, Sequence, SharedSequence, Tick, Track,
};

fn song_bytes() -> Vec<u8> {
    let conductor = Track::from_events(vec![Event::tempo(0, 120.0), Event::tempo(960, 60.0)]).unwrap();
    let mut piano = Track::from_events(vec![
        Event::program(0, 0, 5),
        Event::control(0, 0, 7, 100),
        Event::note(0, 0, 60, 100, 480),
        Event::control(480, 0, 7, 70),
        Event::note(960, 0, 62, 90, 480),
        Event::meta_text(1000, meta::MARKER, "bridge"),
    ])
    .unwrap();
    piano.set_name("Piano");
    piano.set_device_name("Out");

    let mut seq = Sequence::new(480);
    seq.insert_track(-1, conductor).unwrap();
    seq.insert_track(-1, piano).unwrap();
    let mut bytes = Vec::new();
    write_smf(&seq, &mut bytes).unwrap();
    bytes
}

fn player_for(bytes: &[u8]) -> (Player, CollectingSink) {
    let (seq, _) = read_smf(bytes).unwrap();
    let sink = CollectingSink::new();
    let clock = ManualClock::new(0);
    let devices = DeviceContext::new(vec!["Out".to_string()], sink.clone(), clock);
    let player = Player::new(SharedSequence::new(seq), devices, PlayerConfig::default()).unwrap();
    (player, sink)
}

/// Drives the scheduler in windows of `step` ticks
fn drive(player: &Player, from: Tick, to: Tick, step: Tick) {
    let mut tick = from;
    while tick <= to {
        player.send_events_before_tick(tick, tick + step - 1).unwrap();
        tick += step;
    }
}

#[test]
fn test_file_plays_with_tempo_map_timestamps() {
    let (player, sink) = player_for(&song_bytes());
    drive(&player, 0, 2_000, 120);

    let sent: Vec<(u64, Vec<u8>)> = sink
        .take_messages()
        .into_iter()
        .map(|m| (m.host_time_us, m.bytes))
        .collect();
    assert_eq!(
        sent,
        vec![
            (0, vec![0xc0, 5]),
            (10, vec![0xb0, 7, 100]),
            (20, vec![0x90, 60, 100]),
            // Due note-offs go before events of the same tick
            (500_000, vec![0x80, 60, 0]),
            (500_010, vec![0xb0, 7, 70]),
            (1_000_000, vec![0x90, 62, 90]),
            // 480 ticks at 60 BPM
            (2_000_000, vec![0x80, 62, 0]),
        ]
    );
    assert_eq!(player.pending_note_off_count(), 0);
}

#[test]
fn test_preroll_mid_song_restores_controller_state() {
    let (mut player, sink) = player_for(&song_bytes());
    player.preroll(960, true).unwrap();

    let restored: Vec<Vec<u8>> = sink.take_messages().into_iter().map(|m| m.bytes).collect();
    assert_eq!(restored, vec![vec![0xc0, 5], vec![0xb0, 7, 70]]);

    drive(&player, 960, 1_200, 120);
    let sent = sink.take_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].bytes, vec![0x90, 62, 90]);
    assert_eq!(sent[0].host_time_us, 1_000_000);
    assert_eq!(player.pending_note_off_count(), 1);
}

#[test]
fn test_event_inserted_during_playback_is_sent() {
    let conductor = Track::from_events(vec![Event::tempo(0, 120.0)]).unwrap();
    let mut piano = Track::from_events(vec![Event::program(0, 0, 1), Event::program(960, 0, 3)]).unwrap();
    piano.set_device_name("Out");
    let mut seq = Sequence::new(480);
    seq.insert_track(-1, conductor).unwrap();
    seq.insert_track(-1, piano).unwrap();
    let mut bytes = Vec::new();
    write_smf(&seq, &mut bytes).unwrap();
    let (player, sink) = player_for(&bytes);

    player.send_events_before_tick(0, 100).unwrap();
    {
        let mut seq = player.sequence().lock();
        let piano = seq.track_mut(1).unwrap();
        let cursor = piano.new_cursor();
        piano.insert_event(cursor, Event::program(480, 0, 2)).unwrap();
        piano.release_cursor(cursor);
    }
    player.send_events_before_tick(100, 2_000).unwrap();

    let sent: Vec<Vec<u8>> = sink.take_messages().into_iter().map(|m| m.bytes).collect();
    assert_eq!(sent, vec![vec![0xc0, 1], vec![0xc0, 2], vec![0xc0, 3]]);
}
