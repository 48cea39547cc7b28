//! CAN Live Viewer CLI Application
//!
//! Command-line front end for the can-live-core library:
//! - Loads a DBC and opens a bus backend (dummy bus or candump replay)
//! - Prints the live signal table and bus health on a fixed refresh
//! - Optionally records selected signals to CSV at a fixed interval
//! - Reads single-letter commands from stdin while running

use anyhow::{bail, Context, Result};
use can_live_core::{
    Backend, CandumpBackend, CsvSink, Decoder, NullBackend, Pipeline, PipelineHandle, Recorder,
};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

mod config;
mod view;

use config::{AppSettings, BackendKind, OutputFormat};

/// CAN Live Viewer - Decode and monitor live CAN traffic
#[derive(Parser, Debug)]
#[command(name = "can-live")]
#[command(
    about = "Decode and monitor live CAN traffic with DBC signal definitions",
    long_about = None
)]
#[command(version)]
struct Args {
    /// Path to DBC file (default: last one in the settings)
    #[arg(long, value_name = "FILE")]
    dbc: Option<PathBuf>,

    /// Bus backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// candump log to replay (implies --backend replay)
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Channel name passed to the backend
    #[arg(long)]
    channel: Option<String>,

    /// Nominal bitrate in bit/s
    #[arg(long)]
    bitrate: Option<u32>,

    /// Enable CAN FD with this data-phase bitrate
    #[arg(long, value_name = "BITRATE")]
    fd: Option<u32>,

    /// Signals to record (can be repeated)
    #[arg(long, value_name = "SIGNAL")]
    record: Vec<String>,

    /// Recording interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// CSV output for recording
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Stop after this many seconds (default: run until 'q' or EOF on stdin)
    #[arg(long)]
    duration_s: Option<f64>,

    /// Live view refresh period in milliseconds
    #[arg(long)]
    refresh_ms: Option<u64>,

    /// Live view format
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Settings file
    #[arg(long, value_name = "FILE", default_value = "can-live.toml")]
    settings: PathBuf,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_settings: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

/// Commands typed while the viewer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Quit,
    ResetStats,
    ReloadSchema,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "q" | "quit" => Some(Command::Quit),
        "r" | "reset" => Some(Command::ResetStats),
        "l" | "reload" => Some(Command::ReloadSchema),
        _ => None,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Live Viewer v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using core library v{}", can_live_core::VERSION);

    let mut settings = config::load_settings(&args.settings)?;
    apply_overrides(&mut settings, &args);

    let dbc = settings
        .schema
        .last_dbc
        .clone()
        .context("No DBC given; use --dbc <FILE>")?;
    let decoder = Decoder::new();
    let stats = decoder
        .load_dbc(&dbc)
        .with_context(|| format!("Failed to load DBC: {:?}", dbc))?;
    log::info!(
        "Loaded {:?}: {} messages, {} signals",
        dbc,
        stats.num_messages,
        stats.num_signals
    );

    if args.save_settings {
        config::save_settings(&args.settings, &settings)?;
    }

    let backend = make_backend(&settings)?;
    let mut pipeline = Pipeline::start(
        settings.pipeline.clone(),
        decoder,
        backend,
        settings.bus.params.clone(),
    )?;

    let mut recorder = start_recording(&pipeline, &settings)?;
    let commands = spawn_command_reader();
    let result = run_view(&pipeline, &settings, &dbc, &commands, args.duration_s);

    if let Some(recorder) = recorder.as_mut() {
        let status = recorder.stop();
        log::info!(
            "Recording {}: {} samples, {} written, {} skipped",
            status.state,
            status.samples,
            status.written,
            status.skipped
        );
        if let Some(error) = status.last_error {
            log::error!("Recording failed: {}", error);
        }
    }
    let summary = pipeline.stop();
    log::info!(
        "Summary: {} frames, {} decoded, {} unknown, {} malformed, {} filtered, {} lost, \
         {} reconnects",
        summary.frames,
        summary.decoded,
        summary.unknown,
        summary.malformed,
        summary.filtered,
        summary.overruns,
        summary.reconnects
    );
    result
}

fn apply_overrides(settings: &mut AppSettings, args: &Args) {
    if let Some(dbc) = &args.dbc {
        settings.schema.last_dbc = Some(dbc.clone());
    }
    if let Some(replay) = &args.replay {
        settings.bus.replay_file = Some(replay.clone());
        settings.bus.backend = BackendKind::Replay;
    }
    if let Some(backend) = args.backend {
        settings.bus.backend = backend;
    }
    if let Some(channel) = &args.channel {
        settings.bus.params.channel = channel.clone();
    }
    if let Some(bitrate) = args.bitrate {
        settings.bus.params.bitrate = bitrate;
    }
    if let Some(data_bitrate) = args.fd {
        settings.bus.params = settings.bus.params.clone().with_fd(data_bitrate);
    }
    if !args.record.is_empty() {
        settings.recording.signals = args.record.clone();
    }
    if let Some(interval) = args.interval_ms {
        settings.pipeline.recording_interval_ms = interval;
    }
    if let Some(output) = &args.output {
        settings.recording.output = Some(output.clone());
    }
    if let Some(refresh) = args.refresh_ms {
        settings.view.refresh_ms = refresh;
    }
    if let Some(format) = args.format {
        settings.view.format = format;
    }
}

fn make_backend(settings: &AppSettings) -> Result<Box<dyn Backend>> {
    match settings.bus.backend {
        BackendKind::Null => Ok(Box::new(NullBackend)),
        BackendKind::Replay => {
            let Some(path) = &settings.bus.replay_file else {
                bail!("Replay backend needs a log file; use --replay <FILE>");
            };
            Ok(Box::new(CandumpBackend::new(path.clone())))
        }
    }
}

fn start_recording(pipeline: &PipelineHandle, settings: &AppSettings) -> Result<Option<Recorder>> {
    let recording = &settings.recording;
    if recording.signals.is_empty() {
        return Ok(None);
    }
    let output = recording.output.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "can-live-{}.csv",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        ))
    });

    let mut recorder = pipeline.recorder();
    recorder
        .arm_default(recording.signals.as_slice())
        .context("Cannot arm recorder")?;
    let sink = CsvSink::create(&output)
        .with_context(|| format!("Failed to create recording file: {:?}", output))?;
    recorder.start(Box::new(sink))?;
    log::info!(
        "Recording {} signals every {} ms to {:?}",
        recording.signals.len(),
        recorder.default_interval().as_millis(),
        output
    );
    Ok(Some(recorder))
}

/// Forward stdin commands; the channel disconnects at EOF
fn spawn_command_reader() -> Receiver<Command> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let spawned = std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(command) => {
                        if tx.send(command).is_err() || command == Command::Quit {
                            return;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!(
                        "Unknown command '{}' (q = quit, r = reset stats, l = reload DBC)",
                        line.trim()
                    ),
                }
            }
        });
    if let Err(e) = spawned {
        log::warn!("Cannot read commands from stdin: {}", e);
    }
    rx
}

fn run_view(
    pipeline: &PipelineHandle,
    settings: &AppSettings,
    dbc: &Path,
    commands: &Receiver<Command>,
    duration_s: Option<f64>,
) -> Result<()> {
    let refresh = Duration::from_millis(settings.view.refresh_ms.max(1));
    // An unrepresentable duration runs until stopped
    let deadline = duration_s
        .and_then(|s| Duration::try_from_secs_f64(s.max(0.0)).ok())
        .and_then(|d| Instant::now().checked_add(d));
    let table = pipeline.table();
    let health = pipeline.health();
    let mut stdin_open = true;

    loop {
        let now = Instant::now();
        let snapshot = table.snapshot();
        let bus = health.snapshot();
        let rows = view::rows(&snapshot, now);
        let frames = view::frame_rows(snapshot.schema(), &bus);
        let summary = view::health_summary(&bus);
        match settings.view.format {
            OutputFormat::Text => println!("{}", view::render_text(&rows, &frames, &summary)),
            OutputFormat::Json => println!("{}", view::render_json(&rows, &frames, &summary)?),
        }

        let mut wait = refresh;
        if let Some(deadline) = deadline {
            if now >= deadline {
                return Ok(());
            }
            wait = wait.min(deadline - now);
        }

        if !stdin_open {
            std::thread::sleep(wait);
            continue;
        }
        match commands.recv_timeout(wait) {
            Ok(Command::Quit) => return Ok(()),
            Ok(Command::ResetStats) => {
                pipeline.reset_stats();
                log::info!("Bus statistics reset");
            }
            Ok(Command::ReloadSchema) => match pipeline.reload_schema(dbc) {
                Ok(stats) => log::info!(
                    "Reloaded {:?}: {} messages, {} signals",
                    dbc,
                    stats.num_messages,
                    stats.num_signals
                ),
                Err(e) => log::error!("Reload failed, keeping current database: {}", e),
            },
            Err(RecvTimeoutError::Timeout) => {}
            // EOF ends an open-ended run; a timed run keeps going
            Err(RecvTimeoutError::Disconnected) if deadline.is_none() => return Ok(()),
            Err(RecvTimeoutError::Disconnected) => stdin_open = false,
        }
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(parse_command(" reset \n"), Some(Command::ResetStats));
        assert_eq!(parse_command("l"), Some(Command::ReloadSchema));
        assert_eq!(parse_command("x"), None);
    }

    #[test]
    fn test_overrides_win_over_settings() {
        let args = Args::parse_from([
            "can-live",
            "--dbc",
            "body.dbc",
            "--replay",
            "drive.log",
            "--bitrate",
            "250000",
            "--fd",
            "2000000",
            "--interval-ms",
            "20",
            "--record",
            "Speed",
            "--record",
            "Gear",
            "--format",
            "json",
        ]);
        let mut settings = AppSettings::default();
        settings.recording.signals = vec!["Old".to_string()];
        apply_overrides(&mut settings, &args);

        assert_eq!(settings.schema.last_dbc, Some(PathBuf::from("body.dbc")));
        assert_eq!(settings.bus.backend, BackendKind::Replay);
        assert_eq!(settings.bus.params.bitrate, 250_000);
        assert!(settings.bus.params.fd_mode);
        assert_eq!(settings.bus.params.data_bitrate, Some(2_000_000));
        assert_eq!(settings.recording.signals, vec!["Speed", "Gear"]);
        assert_eq!(settings.pipeline.recording_interval_ms, 20);
        assert_eq!(settings.view.format, OutputFormat::Json);
        assert_eq!(settings.view.refresh_ms, 500);
    }

    #[test]
    fn test_replay_backend_needs_file() {
        let mut settings = AppSettings::default();
        settings.bus.backend = BackendKind::Replay;
        assert!(make_backend(&settings).is_err());

        settings.bus.replay_file = Some(PathBuf::from("drive.log"));
        assert_eq!(make_backend(&settings).unwrap().name(), "candump");
    }
}
