use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mymusic_sequencer::midi::event::Event;
use mymusic_sequencer::sequencer::calibrator::Calibrator;
use mymusic_sequencer::sequencer::merger::SequenceMerger;
use mymusic_sequencer::sequencer::sequence::Sequence;
use mymusic_sequencer::sequencer::track::Track;

fn dense_track(events: i64) -> Track {
    Track::from_events((0..events).map(|i| Event::note(i * 12, (i % 16) as u8, 60, 100, 24))).unwrap()
}

/// Building tracks event by event (file import, recording)
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("track_append");
    for size in [1_000i64, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| black_box(dense_track(size)));
        });
    }
    group.finish();
}

/// Random seeks, the path taken by every cursor jump during playback
fn bench_jump_to_tick(c: &mut Criterion) {
    let mut track = dense_track(100_000);
    let cursor = track.new_cursor();
    let end = track.duration();
    let mut tick = 0;

    c.bench_function("track_jump_to_tick", |b| {
        b.iter(|| {
            // Deterministic scatter over the whole track
            tick = (tick + 7_919 * 13) % end;
            black_box(track.jump_to_tick(cursor, tick));
        });
    });
}

/// Insert then delete in the middle of a large track
fn bench_insert_middle(c: &mut Criterion) {
    let mut track = dense_track(100_000);
    let cursor = track.new_cursor();
    let middle = track.duration() / 2;

    c.bench_function("track_insert_delete_middle", |b| {
        b.iter(|| {
            track.insert_event(cursor, Event::program(middle, 0, 1)).unwrap();
            track.delete_event(cursor).unwrap();
        });
    });
}

/// Walking all tracks in tick order
fn bench_merger_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_merger");
    for tracks in [1usize, 8, 32] {
        let mut seq = Sequence::new(480);
        for _ in 0..tracks {
            seq.insert_track(-1, dense_track(5_000)).unwrap();
        }
        let mut merger = SequenceMerger::new(&mut seq);

        group.bench_with_input(BenchmarkId::from_parameter(format!("{}_tracks", tracks)), &tracks, |b, _| {
            b.iter(|| {
                merger.jump_to_tick(&mut seq, 0);
                let mut count = 0usize;
                while merger.forward(&mut seq).is_some() {
                    count += 1;
                }
                black_box(count)
            });
        });
        merger.release(&mut seq);
    }
    group.finish();
}

/// Tick to wall time over a dense tempo map
fn bench_tick_to_time(c: &mut Criterion) {
    let conductor = Track::from_events((0..2_000).map(|i| Event::tempo(i * 240, 60.0 + (i % 120) as f32))).unwrap();
    let mut seq = Sequence::new(480);
    seq.insert_track(-1, conductor).unwrap();
    let mut calibrator = Calibrator::for_playback(&mut seq).unwrap();

    let mut group = c.benchmark_group("calibrator");
    group.bench_function("sequential", |b| {
        let mut tick = 0;
        b.iter(|| {
            tick = (tick + 60) % 480_000;
            black_box(calibrator.tick_to_time(&mut seq, tick))
        });
    });
    group.bench_function("random", |b| {
        let mut tick = 0;
        b.iter(|| {
            tick = (tick + 104_729) % 480_000;
            black_box(calibrator.tick_to_time(&mut seq, tick))
        });
    });
    group.finish();
    calibrator.release(&mut seq);
}

criterion_group!(
    benches,
    bench_append,
    bench_jump_to_tick,
    bench_insert_middle,
    bench_merger_forward,
    bench_tick_to_time,
);

criterion_main!(benches);
