use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};

use eit_rs::logging::init_rust_logging;
use eit_rs::transport::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
use eit_rs::{
    DatasetWriter, FrameDemultiplexer, Instrument, LiveChannels, LiveSample, Pipeline, RunConfig,
    SweepDefaults,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SweepPreset {
    /// One linear frequency
    Documented,
    /// One logarithmic frequency
    Setup,
    /// Twenty logarithmic frequencies
    Acquisition,
}

impl From<SweepPreset> for SweepDefaults {
    fn from(preset: SweepPreset) -> Self {
        match preset {
            SweepPreset::Documented => SweepDefaults::DOCUMENTED,
            SweepPreset::Setup => SweepDefaults::SETUP_SCRIPT,
            SweepPreset::Acquisition => SweepDefaults::ACQUISITION_SCRIPT,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "eit-acquire",
    about = "Configure an EIT instrument and record a measurement run"
)]
struct Args {
    /// Serial port (e.g. /dev/ttyUSB0, COM3)
    port: String,
    /// Baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Read timeout in milliseconds; this much silence ends the run
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,
    /// JSON file with `measurement` and `output` sections
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dataset name; files are written as `{name}_{loop}.txt`
    #[arg(long, default_value = "measurement")]
    name: String,
    /// Directory for dataset files
    #[arg(long, default_value = "data")]
    out_dir: PathBuf,
    /// Keep the device's current configuration instead of resetting it
    #[arg(long)]
    skip_configure: bool,
    /// Frequency count and scale used when the config leaves them out
    #[arg(long, value_enum, default_value_t = SweepPreset::Documented)]
    sweep_defaults: SweepPreset,
    /// Number of live channels printed while measuring
    #[arg(long, default_value_t = 0)]
    live_channels: usize,
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_rust_logging(match args.verbose {
        0 => None,
        1 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    });

    let run_config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            RunConfig::from_json(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => RunConfig::default(),
    };

    let mut device = Instrument::connect_serial(
        &args.port,
        args.baud,
        Duration::from_millis(args.timeout_ms),
    )?
    .with_sweep_defaults(args.sweep_defaults.into());
    device.read_system_message()?;

    if !args.skip_configure {
        let mut outcomes = device.configure(&run_config.measurement)?;
        outcomes.extend(device.set_output_config(&run_config.output)?);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_applied()).collect();
        if failed.is_empty() {
            info!("{} settings applied", outcomes.len());
        } else {
            for outcome in &failed {
                warn!("not applied: {outcome}");
            }
            println!(
                "{} of {} settings were not confirmed; check the log",
                failed.len(),
                outcomes.len()
            );
        }
    }

    let snapshot = device.query_configuration()?;
    let output = device.query_output_config()?;
    info!("output options: {output:?}");

    let sequence = snapshot.excitation_sequence.clone();
    let (mut live, receivers) = LiveChannels::new(sequence.len());
    let printer = spawn_live_printer(receivers, args.live_channels, Duration::from_secs(1));

    let mut writer = DatasetWriter::new(&args.out_dir);
    let demux = FrameDemultiplexer::new(&args.name, snapshot.dataset_fields(), sequence);
    let summary = device.acquire(Pipeline::new(demux, &mut writer, &mut live))?;

    drop(live);
    if printer.join().is_err() {
        warn!("live printer panicked");
    }
    println!("Run summary: {summary}");
    println!("Datasets in {}", writer.dir().display());
    Ok(())
}

/// Poll the live channels until the run closes them, printing the first `shown`.
fn spawn_live_printer(
    receivers: Vec<Receiver<LiveSample>>,
    shown: usize,
    interval: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut totals = vec![0u64; receivers.len()];
        loop {
            thread::sleep(interval);
            let mut open = false;
            for (index, rx) in receivers.iter().enumerate() {
                let mut last = None;
                loop {
                    match rx.try_recv() {
                        Ok(sample) => {
                            totals[index] += 1;
                            last = Some(sample.value);
                        }
                        Err(TryRecvError::Empty) => {
                            open = true;
                            break;
                        }
                        Err(TryRecvError::Disconnected) => break,
                    }
                }
                if let (true, Some(value)) = (index < shown, last) {
                    println!("[live] channel {index}: {value:.6e} ({} samples)", totals[index]);
                }
            }
            if !open {
                break;
            }
        }
    })
}
