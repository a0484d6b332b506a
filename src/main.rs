use anyhow::Context;
use audiosonde::buffer::{AudioBuffer, WaitOutcome};
use audiosonde::capture::Capture;
use audiosonde::config::Config;
use audiosonde::meter;
use audiosonde::sink::WavSink;
use audiosonde::timebase::SystemClock;
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "audiosonde")]
#[command(author, version, about = "Acoustic sensor recorder with an always-on history ring", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio input devices
    Devices,

    /// Capture and print input levels until interrupted
    Monitor {
        /// Input device name (default: system default input)
        #[arg(short, long)]
        device: Option<String>,

        /// Meter print interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },

    /// Capture a bounded duration to a WAV file
    Record {
        /// Output WAV file path
        #[arg(short, long)]
        output: PathBuf,

        /// Seconds to record
        #[arg(short = 'n', long, default_value_t = 10.0)]
        duration_secs: f64,

        /// Input device name (default: system default input)
        #[arg(short, long)]
        device: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("audiosonde={level}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    audiosonde::panic_handler::install();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Devices => {
            let devices = Capture::list_devices();
            if devices.is_empty() {
                println!("No audio input devices found");
            } else {
                for name in devices {
                    println!("{name}");
                }
            }
            Ok(())
        }
        Commands::Monitor {
            device,
            interval_ms,
        } => monitor(device, interval_ms),
        Commands::Record {
            output,
            duration_secs,
            device,
        } => record(output, duration_secs, device),
    }
}

fn load_config(device_override: Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::load().context("loading configuration")?;
    if device_override.is_some() {
        config.device = device_override;
    }
    Ok(config)
}

fn monitor(device: Option<String>, interval_ms: u64) -> anyhow::Result<()> {
    let config = load_config(device)?;
    let buffer = AudioBuffer::shared(&config.buffer)?;

    let interval = Duration::from_millis(interval_ms.max(1));
    let window = TimeDelta::milliseconds(interval_ms.max(1) as i64);
    let last_print = Mutex::new(Instant::now());
    buffer.subscribe(move |buffer, _, _| {
        {
            let mut last = last_print.lock().unwrap();
            if last.elapsed() < interval {
                return;
            }
            *last = Instant::now();
        }
        let Ok((tail_time, head_time)) = buffer.date_time_range() else {
            return;
        };
        let window = window.min(head_time - tail_time);
        let Ok(result) = buffer.read(head_time - window, window) else {
            return;
        };
        let samples = result.to_vec();
        info!(
            "level {:+6.1} dBFS rms / {:+6.1} dBFS peak ({:.1}s buffered)",
            meter::rms_db(&samples),
            meter::peak_db(&samples),
            (head_time - tail_time).num_milliseconds() as f64 / 1_000.0
        );
    });

    let capture = Capture::start(
        Arc::clone(&buffer),
        config.device.as_deref(),
        Arc::new(SystemClock),
    )?;
    info!("Monitoring {} (press ctrl-c to stop)", capture.device_name());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;

    drop(capture);
    info!("Capture stopped");
    Ok(())
}

fn record(output: PathBuf, duration_secs: f64, device: Option<String>) -> anyhow::Result<()> {
    anyhow::ensure!(duration_secs > 0.0, "duration must be positive");
    let config = load_config(device)?;
    let buffer = AudioBuffer::shared(&config.buffer)?;

    let capture = Capture::start(
        Arc::clone(&buffer),
        config.device.as_deref(),
        Arc::new(SystemClock),
    )?;
    info!(
        "Recording {:.1}s from {} to {}",
        duration_secs,
        capture.device_name(),
        output.display()
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        {
            let cancel = Arc::clone(&cancel);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Interrupted, finishing up");
                cancel.store(true, Ordering::Relaxed);
            });
        }

        let sink = WavSink::create(
            &output,
            buffer.channel_count() as u16,
            buffer.frame_rate(),
        )?;
        let writer_buffer = Arc::clone(&buffer);
        let written = tokio::task::spawn_blocking(move || {
            record_loop(&writer_buffer, sink, duration_secs, &cancel)
        })
        .await??;

        info!("Wrote {} samples to {}", written, output.display());
        anyhow::Ok(())
    })?;

    drop(capture);
    Ok(())
}

/// Chunked copy-out: wait until each one-second window is fully captured,
/// then read it from the ring and append it to the sink.
fn record_loop(
    buffer: &AudioBuffer,
    mut sink: WavSink,
    duration_secs: f64,
    cancel: &AtomicBool,
) -> anyhow::Result<usize> {
    let chunk = TimeDelta::seconds(1);

    // The epoch is set by the first callback; poll until it exists.
    let start = loop {
        if cancel.load(Ordering::Relaxed) {
            sink.finalize()?;
            return Ok(0);
        }
        if let Ok(head_time) = buffer.head_time() {
            break head_time;
        }
        std::thread::sleep(Duration::from_millis(5));
    };

    let end = start + TimeDelta::milliseconds((duration_secs * 1_000.0) as i64);
    let mut cursor = start;

    while cursor < end {
        let target = (cursor + chunk).min(end);
        if buffer.wait_until(target, cancel) == WaitOutcome::Cancelled {
            break;
        }
        let result = buffer.read(cursor, target - cursor)?;
        sink.append(&result)?;
        cursor = target;
    }

    let written = sink.samples_written();
    sink.finalize()?;
    Ok(written)
}
