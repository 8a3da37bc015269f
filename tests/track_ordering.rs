//! Randomised edit sequences against the track store
//!
//! Events stay in tick order, counters stay exact and cursors parked by
//! other editors end up where a fresh seek would put them.

use mymusic_sequencer::midi::event::{Event, Tick};
use mymusic_sequencer::sequencer::track::Track;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

fn assert_ordered(track: &Track) {
    let ticks: Vec<Tick> = track.iter().map(|e| e.tick).collect();
    assert!(
        ticks.windows(2).all(|w| w[0] <= w[1]),
        "ticks out of order: {ticks:?}"
    );
    assert_eq!(ticks.len(), track.number_of_events());
}

#[test]
fn test_random_edits_keep_tick_order() {
    let mut rng = StdRng::seed_from_u64(0x5eed_0001);
    let mut track = Track::new();
    let editor = track.new_cursor();
    let watcher = track.new_cursor();

    for _ in 0..3000 {
        let count = track.number_of_events() as i64;
        match rng.gen_range(0..5) {
            0..=1 => {
                let tick = rng.gen_range(0..5_000);
                let channel = rng.gen_range(0..16);
                track
                    .insert_event(editor, Event::control(tick, channel, 7, 64))
                    .unwrap();
            }
            2 if count > 0 => {
                track.set_position(editor, rng.gen_range(0..count));
                track.delete_event(editor).unwrap();
            }
            3 if count > 0 => {
                track.set_position(editor, rng.gen_range(0..count));
                track.change_tick(editor, rng.gen_range(0..5_000)).unwrap();
            }
            _ => {
                track.jump_to_tick(watcher, rng.gen_range(0..5_500));
            }
        }
        assert_ordered(&track);
    }

    assert!(track.recache(true).is_empty());
    track.cursor_check(editor).unwrap();
    track.cursor_check(watcher).unwrap();
    let per_channel: usize = (0..16).map(|ch| track.channel_event_count(ch)).sum();
    assert_eq!(per_channel, track.number_of_events());
}

#[test]
fn test_bulk_append_out_of_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut ticks: Vec<Tick> = (0..700).map(|_| rng.gen_range(0..10_000)).collect();
    let events: Vec<Event> = ticks.iter().map(|&t| Event::program(t, 0, 1)).collect();
    let track = Track::from_events(events).unwrap();
    assert_ordered(&track);
    ticks.sort_unstable();
    let stored: Vec<Tick> = track.iter().map(|e| e.tick).collect();
    assert_eq!(stored, ticks);
    assert_eq!(track.duration(), ticks[ticks.len() - 1] + 1);
}

#[test]
fn test_cursor_adjustment_matches_reseek() {
    // Unique ticks so that a seek identifies exactly one event
    let mut rng = StdRng::seed_from_u64(0xc0ffee);
    let mut pool: Vec<Tick> = (0..4_000).map(|t| t * 3).collect();
    pool.shuffle(&mut rng);
    let initial: BTreeSet<Tick> = pool.drain(..300).collect();
    let mut track = Track::from_events(initial.iter().map(|&t| Event::program(t, 0, 0))).unwrap();

    let editor = track.new_cursor();
    let watchers: Vec<_> = (0..4).map(|_| track.new_cursor()).collect();
    for &w in &watchers {
        let n = track.number_of_events() as i64;
        track.set_position(w, rng.gen_range(0..n));
    }

    for round in 0..400 {
        let watched: Vec<Tick> = watchers
            .iter()
            .map(|&w| track.current(w).map(|e| e.tick).unwrap())
            .collect();
        if round % 3 == 0 {
            // Delete something no watcher sits on
            let n = track.number_of_events() as i64;
            let victim = rng.gen_range(0..n);
            let tick = track.event_at(victim).map(|e| e.tick).unwrap();
            if watched.contains(&tick) {
                continue;
            }
            track.set_position(editor, victim);
            track.delete_event(editor).unwrap();
        } else if let Some(tick) = pool.pop() {
            track
                .insert_event(editor, Event::program(tick, 0, 0))
                .unwrap();
        }

        for (&w, &tick) in watchers.iter().zip(&watched) {
            let adjusted = track.cursor_position(w);
            let seeker = track.new_cursor();
            track.jump_to_tick(seeker, tick);
            assert_eq!(adjusted, track.cursor_position(seeker));
            track.release_cursor(seeker);
            assert!(!track.is_removed(w));
            track.cursor_check(w).unwrap();
        }
    }
}

#[test]
fn test_jump_to_tick_is_idempotent_across_blocks() {
    let track_events = (0..500).map(|i| Event::program(i / 3, 0, 0));
    let mut track = Track::from_events(track_events).unwrap();
    let cursor = track.new_cursor();
    for tick in [0, 1, 40, 77, 166, 167, 300] {
        track.jump_to_tick(cursor, tick);
        let once = track.cursor_position(cursor);
        track.jump_to_tick(cursor, tick);
        assert_eq!(track.cursor_position(cursor), once);
        track.cursor_check(cursor).unwrap();
    }
    // Past the end parks at the event count
    assert!(!track.jump_to_tick(cursor, 1_000));
    assert_eq!(track.cursor_position(cursor), 500);
}

#[test]
fn test_insert_blanks_under_parked_cursor() {
    let mut track = Track::from_events((0..10).map(|i| Event::program(i * 10, 0, 0))).unwrap();
    let parked = track.new_cursor();
    let inserter = track.new_cursor();
    track.set_position(parked, 5);
    track.set_position(inserter, 5);
    track.insert_blanks(inserter, 3).unwrap();

    assert_eq!(track.cursor_position(parked), 8);
    assert_eq!(track.current(parked).map(|e| e.tick), Some(50));
    track.cursor_check(parked).unwrap();
    track.cursor_check(inserter).unwrap();
}
