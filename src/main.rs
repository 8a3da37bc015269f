use mymusic_sequencer::config::PlayerConfig;
use mymusic_sequencer::midi::catalog::Catalog;
use mymusic_sequencer::midi::output::{MidirOutputSink, list_output_ports};
use mymusic_sequencer::midi::smf::read_smf_file;
use mymusic_sequencer::{Calibrator, Player, PlayerStatus, SeqResult, SequencerError, SharedSequence, Tick};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: mymusic_sequencer <file.mid> [--port N] [--from TICK] [--catalog] [--list-ports]";

// Polling period of the main thread while the player runs
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Args {
    file: Option<PathBuf>,
    port: usize,
    from: Tick,
    catalog: bool,
    list_ports: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let value = args.next().ok_or("--port needs a value")?;
                parsed.port = value.parse().map_err(|_| format!("bad port '{value}'"))?;
            }
            "--from" => {
                let value = args.next().ok_or("--from needs a value")?;
                parsed.from = value.parse().map_err(|_| format!("bad tick '{value}'"))?;
            }
            "--catalog" => parsed.catalog = true,
            "--list-ports" => parsed.list_ports = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            other if other.starts_with("--") => return Err(format!("unknown option '{other}'")),
            other => parsed.file = Some(PathBuf::from(other)),
        }
    }
    Ok(parsed)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };
    if let Err(e) = run(args) {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> SeqResult<()> {
    if args.list_ports {
        for (index, name) in list_output_ports()?.iter().enumerate() {
            println!("{index}: {name}");
        }
        if args.file.is_none() {
            return Ok(());
        }
    }
    let Some(path) = args.file else {
        return Err(SequencerError::BadParameter(USAGE.to_string()));
    };

    let (mut sequence, report) = read_smf_file(&path)?;
    tracing::info!(
        file = %path.display(),
        format = report.format,
        tracks = sequence.track_count(),
        duration = sequence.duration(),
        "file loaded"
    );
    if report.orphaned_note_offs > 0 || report.unterminated_notes > 0 {
        tracing::warn!(
            orphaned = report.orphaned_note_offs,
            unterminated = report.unterminated_notes,
            "file has unpaired notes"
        );
    }

    if args.catalog {
        let catalog = Catalog::from_sequence(&sequence, 0, sequence.duration());
        let json = serde_json::to_string_pretty(&catalog)
            .map_err(|e| SequencerError::BadParameter(e.to_string()))?;
        println!("{json}");
        return Ok(());
    }

    let devices = MidirOutputSink::open_context(&[args.port])?;
    // Every track goes to the chosen port
    if let Some(port_name) = devices.destination_name(0) {
        for index in 0..sequence.track_count() {
            if let Some(track) = sequence.track_mut(index) {
                track.set_device_name(port_name.clone());
            }
        }
    }

    let from = args.from.max(0);
    let play_length_us = {
        let mut calibrator = Calibrator::for_playback(&mut sequence)?;
        let duration = sequence.duration();
        let length = calibrator.tick_to_time(&mut sequence, duration) - calibrator.tick_to_time(&mut sequence, from);
        calibrator.release(&mut sequence);
        length.max(0) as u64
    };

    let config = PlayerConfig::load_or_default()?;
    let mut player = Player::new(SharedSequence::new(sequence), devices, config)?;
    player.preroll(from, true)?;
    player.start()?;

    let deadline = Instant::now() + Duration::from_micros(play_length_us) + Duration::from_secs(1);
    while player.status() == PlayerStatus::Playing && Instant::now() < deadline {
        std::thread::sleep(POLL_INTERVAL);
    }
    if player.status() != PlayerStatus::Exhausted {
        tracing::warn!("playback did not reach the end in time");
    }
    player.stop()?;
    Ok(())
}
