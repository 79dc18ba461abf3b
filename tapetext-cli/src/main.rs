mod header_dump;
mod logging;
mod telemetry;

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use tapetext_core::config::{LineConfig, ProfileRegistry};
use tapetext_core::deconvolver::BackendKind;
use tapetext_core::errors::{ConfigError, InputError, TapeError};
use tapetext_core::filter::{filter_packets, SquashConfig};
use tapetext_core::io::{read_t42, write_t42};
use tapetext_core::logging::{LogConfig, SignalLogger};
use tapetext_core::pipeline::{run_deconvolve, PipelineOptions};
use tapetext_core::utils::PageNumber;

use header_dump::{describe_header, HeaderGate};
use logging::{LogEvent, LogFormat, SignalEvent, StructuredLogger};
use telemetry::TelemetryAggregator;

#[derive(Parser, Debug)]
#[command(author, version, about = "Teletext recovery tools for VBI captures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose diagnostic output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Structured log format on stderr
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deconvolve raw VBI samples into framed teletext packets
    Deconvolve(DeconvolveArgs),
    /// Filter a packet stream by page and/or squash repeated transmissions
    Filter(FilterArgs),
    /// Record raw VBI samples from a capture device
    Record(RecordArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Cpu,
    Batch,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Cpu => BackendKind::Cpu,
            BackendArg::Batch => BackendKind::Batch,
        }
    }
}

#[derive(Args, Debug)]
struct DeconvolveArgs {
    /// Input .vbi file; stdin when omitted
    input: Option<PathBuf>,

    /// Output .t42 file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Device profile name, or path to a profile TOML file
    #[arg(long, default_value = "bt8x8_pal")]
    device: String,

    /// First frame to process
    #[arg(long)]
    start: Option<u64>,

    /// Frame to stop before
    #[arg(long)]
    stop: Option<u64>,

    /// Print decoded header lines as text on stderr
    #[arg(short = 'H', long)]
    headers: bool,

    /// Skip this many frames between header prints
    #[arg(short = 'S', long, default_value_t = 0)]
    skip: u64,

    /// Deconvolver backend
    #[arg(long, value_enum, default_value = "cpu")]
    backend: BackendArg,

    /// Deconvolver worker threads; 0 means one per core
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Input .t42 file; stdin when omitted
    input: Option<PathBuf>,

    /// Output .t42 file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep only this page (three hex digits, e.g. 100)
    #[arg(short = 'p', long)]
    page: Option<String>,

    /// Merge repeated subpage transmissions by confidence-weighted vote
    #[arg(long)]
    squash: bool,

    /// Flush a subpage after this many merged copies
    #[arg(long, default_value_t = 32)]
    max_observations: u32,

    /// Flush a subpage after this many frames of silence
    #[arg(long, default_value_t = 500)]
    quiet_frames: u64,
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Capture device to read raw VBI samples from
    #[arg(short = 'd', long, default_value = "/dev/vbi0")]
    device: PathBuf,

    /// Output .vbi file; stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Device profile that defines the frame size
    #[arg(long, default_value = "bt8x8_pal")]
    profile: String,
}

fn main() {
    if color_eyre::install().is_err() {
        eprintln!("warning: failed to install error reporting hooks");
    }
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// 0 success, 2 malformed input, 3 unknown device profile, 1 anything else.
fn exit_code(err: &color_eyre::Report) -> i32 {
    for cause in err.chain() {
        if let Some(tape) = cause.downcast_ref::<TapeError>() {
            return match tape {
                TapeError::Input(InputError::BadPacketStreamLength { .. }) => 2,
                TapeError::Config(ConfigError::UnknownProfile { .. }) => 3,
                _ => 1,
            };
        }
        if matches!(
            cause.downcast_ref::<InputError>(),
            Some(InputError::BadPacketStreamLength { .. })
        ) {
            return 2;
        }
        if matches!(
            cause.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownProfile { .. })
        ) {
            return 3;
        }
    }
    1
}

fn run(cli: Cli) -> Result<()> {
    let mut logger = StructuredLogger::new(cli.log_format);
    // engine-side signal log, drained into the structured output after
    // each run
    let signal_log = Arc::new(SignalLogger::new(if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    }));
    match cli.command {
        Command::Deconvolve(args) => deconvolve(args, &mut logger, &signal_log),
        Command::Filter(args) => filter(args, cli.verbose, &mut logger, &signal_log),
        Command::Record(args) => record(args, cli.verbose, &mut logger),
    }
}

/// Render everything the engine logged during a run.
fn emit_signal_log(logger: &mut StructuredLogger, signal_log: &SignalLogger) -> Result<()> {
    for entry in signal_log.drain() {
        logger.log(LogEvent::Signal(SignalEvent::from(&entry)))?;
    }
    let evicted = signal_log.evicted();
    if evicted > 0 {
        logger.log(LogEvent::Warn {
            message: format!("{} signal log entries evicted by the buffer cap", evicted),
        })?;
    }
    Ok(())
}

/// Resolve a device profile by registry name, or load one from a TOML
/// file when the argument looks like a path.
fn load_profile(name: &str) -> Result<Arc<LineConfig>> {
    if name.ends_with(".toml") {
        let text = std::fs::read_to_string(name)
            .wrap_err_with(|| format!("failed to read profile file {}", name))?;
        let config: LineConfig =
            toml::from_str(&text).wrap_err_with(|| format!("failed to parse profile {}", name))?;
        config.validate().map_err(TapeError::from)?;
        return Ok(Arc::new(config));
    }
    let registry = ProfileRegistry::builtin();
    let config = registry.get(name).map_err(TapeError::from)?;
    Ok(config)
}

fn open_input(path: &Option<PathBuf>) -> Result<(Box<dyn Read + Send>, Option<u64>)> {
    match path {
        Some(path) => {
            let file =
                File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
            let len = file.metadata().ok().map(|m| m.len());
            Ok((Box::new(file), len))
        }
        // Stdin rather than StdinLock: the pipeline reads from a worker
        // thread, so the handle must be Send
        None => Ok((Box::new(io::stdin()), None)),
    }
}

fn open_output(path: &Option<PathBuf>) -> Result<Box<dyn Write>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .wrap_err_with(|| format!("failed to create {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(BufWriter::new(io::stdout().lock()))),
    }
}

fn byte_progress(total: Option<u64>) -> ProgressBar {
    let bar = match total {
        Some(total) => ProgressBar::new(total),
        None => ProgressBar::hidden(),
    };
    bar.set_style(
        ProgressStyle::with_template("{bytes}/{total_bytes} [{bar:30}] {eta}")
            .expect("static template"),
    );
    bar
}

fn deconvolve(
    args: DeconvolveArgs,
    logger: &mut StructuredLogger,
    signal_log: &Arc<SignalLogger>,
) -> Result<()> {
    let config = load_profile(&args.device)?;
    let options = PipelineOptions {
        backend: args.backend.into(),
        workers: args.threads,
        start_frame: args.start.unwrap_or(0),
        stop_frame: args.stop,
        ..PipelineOptions::default()
    };
    if let (Some(start), Some(stop)) = (args.start, args.stop) {
        if start >= stop {
            return Err(TapeError::from(InputError::EmptyFrameRange { start, stop }).into());
        }
    }

    let (reader, input_len) = open_input(&args.input)?;
    let progress = byte_progress(input_len);
    let reader = progress.wrap_read(reader);
    let mut writer = open_output(&args.output)?;

    let mut telemetry = TelemetryAggregator::new();
    let mut gate = HeaderGate::new(args.skip);

    let stats = run_deconvolve(
        reader,
        &mut writer,
        config,
        &options,
        Arc::new(AtomicBool::new(false)),
        signal_log,
        |packet| {
            telemetry.observe(packet);
            if args.headers {
                if let Some(event) = describe_header(packet) {
                    if gate.should_print(packet.frame_index) {
                        let _ = logger.log(LogEvent::HeaderLine(event));
                    }
                }
            }
        },
    )?;
    progress.finish_and_clear();
    emit_signal_log(logger, signal_log)?;

    let summary = telemetry.summarize(&stats, logger.elapsed_secs());
    logger.log(LogEvent::Statistics(summary))?;
    Ok(())
}

fn filter(
    args: FilterArgs,
    verbose: bool,
    logger: &mut StructuredLogger,
    signal_log: &Arc<SignalLogger>,
) -> Result<()> {
    let page = args
        .page
        .as_deref()
        .map(PageNumber::parse)
        .transpose()
        .map_err(TapeError::from)?;
    let squash = args.squash.then(|| SquashConfig {
        max_observations: args.max_observations,
        quiet_frames: args.quiet_frames,
    });

    let (mut reader, _) = open_input(&args.input)?;
    let records = read_t42(&mut reader)?;
    let filtered = filter_packets(&records, page, squash, Some(signal_log.clone()));

    let mut writer = open_output(&args.output)?;
    write_t42(&mut writer, &filtered)?;
    writer.flush()?;
    emit_signal_log(logger, signal_log)?;

    if verbose {
        logger.info(format!(
            "filtered {} packets down to {}",
            records.len(),
            filtered.len()
        ))?;
    }
    Ok(())
}

fn record(args: RecordArgs, verbose: bool, logger: &mut StructuredLogger) -> Result<()> {
    let config = load_profile(&args.profile)?;
    let frame_bytes = config.samples_per_line as u64;
    let byte_limit = args.frames.map(|frames| frames * frame_bytes);

    let mut reader = File::open(&args.device)
        .wrap_err_with(|| format!("failed to open capture device {}", args.device.display()))?;
    let mut writer = open_output(&args.output)?;

    let mut buffer = vec![0u8; config.samples_per_line];
    let mut copied: u64 = 0;
    loop {
        if let Some(limit) = byte_limit {
            if copied >= limit {
                break;
            }
        }
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).wrap_err("capture device read failed"),
        };
        writer.write_all(&buffer[..n])?;
        copied += n as u64;
    }
    writer.flush()?;

    if verbose {
        logger.info(format!(
            "recorded {} bytes ({} frames)",
            copied,
            copied / frame_bytes
        ))?;
    }
    Ok(())
}
