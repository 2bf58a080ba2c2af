use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use oerad_core::{
    DeviceState, Gain, MIN_BUFFER_IN_SIZE, Radar, RadarConfig, RadarContext, TimeWindow,
};
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Oerad GPR acquisition tool (Pure Rust)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Path to driver configuration (oerad.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List supported radars on the bus
    Devices,
    /// Capture traces with blocking reads
    Trace {
        #[command(flatten)]
        acquisition: Acquisition,

        /// Number of traces to capture
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },
    /// Stream traces through the asynchronous engine
    Stream {
        #[command(flatten)]
        acquisition: Acquisition,

        /// Stream for a fixed time instead of reading commands from stdin
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(clap::Args, Debug)]
struct Acquisition {
    /// Acquisition time window [default: from config]
    #[arg(long, value_enum)]
    window: Option<Window>,

    /// Gain level, 1-5 [default: from config]
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
    gain: Option<u8>,

    /// Index of the radar among those found
    #[arg(long, default_value_t = 0)]
    device: usize,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Window {
    Short,
    Long,
}

impl From<Window> for TimeWindow {
    fn from(w: Window) -> Self {
        match w {
            Window::Short => TimeWindow::Short,
            Window::Long => TimeWindow::Long,
        }
    }
}

impl Acquisition {
    fn window(&self, config: &RadarConfig) -> TimeWindow {
        self.window.map_or(config.time_window, TimeWindow::from)
    }

    fn gain(&self, config: &RadarConfig) -> Result<Gain> {
        match self.gain {
            Some(level) => {
                Gain::from_level(level).ok_or_else(|| anyhow!("Invalid gain level {}", level))
            }
            None => Ok(config.gain),
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => RadarConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => RadarConfig::default(),
    };
    let ctx = RadarContext::system().with_config(config);

    match args.command {
        Cmd::Devices => list_devices(&ctx),
        Cmd::Trace { acquisition, count } => capture(&ctx, &acquisition, count),
        Cmd::Stream {
            acquisition,
            seconds,
        } => stream(&ctx, &acquisition, seconds.map(Duration::from_secs)),
    }
}

fn list_devices(ctx: &RadarContext) -> Result<()> {
    let candidates = ctx.candidates()?;
    if candidates.is_empty() {
        println!("No Oerad radars found");
    }
    for (i, candidate) in candidates.iter().enumerate() {
        println!("[{}] {}", i, candidate);
    }
    Ok(())
}

fn open_radar(ctx: &RadarContext, index: usize) -> Result<Radar> {
    let mut radars = ctx.discover()?;
    if index >= radars.len() {
        return Err(anyhow!(
            "No radar at index {} ({} found)",
            index,
            radars.len()
        ));
    }
    let radar = radars.swap_remove(index);
    radar.connect()?;
    radar.initialize()?;
    Ok(radar)
}

fn capture(ctx: &RadarContext, acquisition: &Acquisition, count: usize) -> Result<()> {
    let window = acquisition.window(ctx.config());
    let gain = acquisition.gain(ctx.config())?;
    let radar = open_radar(ctx, acquisition.device)?;
    radar.start_transmission_sync(window, gain)?;

    let mut buf = vec![0u8; MIN_BUFFER_IN_SIZE];
    for i in 0..count {
        let n = radar.get_current_trace(&mut buf)?;
        let head: Vec<String> = buf[..n.min(16)].iter().map(|b| format!("{:02x}", b)).collect();
        println!("trace {}: {} bytes [{}]", i, n, head.join(" "));
    }

    radar.disconnect()?;
    Ok(())
}

fn stream(ctx: &RadarContext, acquisition: &Acquisition, duration: Option<Duration>) -> Result<()> {
    let window = acquisition.window(ctx.config());
    let gain = acquisition.gain(ctx.config())?;
    let radar = Arc::new(open_radar(ctx, acquisition.device)?);

    let frames = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&frames);
    radar.start_io_async(
        window,
        gain,
        move |data: &[u8]| {
            counter.fetch_add(1, Ordering::Relaxed);
            debug!(len = data.len(), "Trace");
        },
        MIN_BUFFER_IN_SIZE,
        |_: &[u8]| debug!("Command sent"),
        1,
    )?;

    let pump = {
        let radar = Arc::clone(&radar);
        thread::spawn(move || radar.run())
    };
    while radar.state() != DeviceState::Running && !pump.is_finished() {
        thread::sleep(Duration::from_millis(1));
    }

    match duration {
        Some(duration) => {
            info!(seconds = duration.as_secs(), "Streaming");
            thread::sleep(duration);
        }
        None => {
            println!("s/l: time window, 1-5: gain, t: trace count, q: quit");
            interact(&radar, &frames)?;
        }
    }

    radar.stop();
    pump.join().map_err(|_| anyhow!("Event loop panicked"))??;

    println!("{} traces", frames.load(Ordering::Relaxed));
    radar.disconnect()?;
    Ok(())
}

fn interact(radar: &Radar, frames: &AtomicUsize) -> Result<()> {
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let result = match line.trim() {
            "q" => break,
            "s" => radar.set_time_window_async(TimeWindow::Short),
            "l" => radar.set_time_window_async(TimeWindow::Long),
            "t" => {
                println!("{} traces", frames.load(Ordering::Relaxed));
                Ok(())
            }
            other => match other.parse::<u8>().ok().and_then(Gain::from_level) {
                Some(gain) => radar.set_gain_async(gain),
                None => {
                    println!("Unknown command: {}", other);
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            error!("Command failed: {}", e);
        }
    }
    Ok(())
}
