//! CLI entry point for the gantry workstation.
//!
//! # Usage
//!
//! ```bash
//! gantry move --x 10 --y 5
//! gantry move --y -2.5 --relative
//! gantry zero y
//! gantry session 0,0 10,5 20,5
//! gantry snapshot frame.png
//! gantry --simulate preview --frames 20
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gantry_vision::config::{GantryConfig, DEFAULT_CONFIG_PATH};
use gantry_vision::gantry_core::limits::Axis;
use gantry_vision::gantry_driver_grbl::{AxisValues, GrblDriver, MotionOutcome};
use gantry_vision::logging;
use gantry_vision::station::{self, Backend};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "Motion control and image acquisition for a camera gantry", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the in-memory controller and camera instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move to a position, or by an offset with --relative
    Move {
        #[arg(long, allow_hyphen_values = true)]
        x: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        y: Option<f64>,
        /// Treat X/Y as offsets from the current position
        #[arg(long)]
        relative: bool,
        /// Feed rate in mm/min (defaults to motion.feed_rate)
        #[arg(long)]
        feed: Option<f64>,
    },

    /// Run the homing cycle
    Home,

    /// Drive one or both axes to zero
    Zero {
        #[arg(value_enum, default_value_t = ZeroTarget::All)]
        target: ZeroTarget,
    },

    /// Arm the machine, visit each X,Y waypoint, then home and release it
    Session {
        /// Waypoints as X,Y in millimetres
        #[arg(required = true, allow_hyphen_values = true)]
        waypoints: Vec<String>,
    },

    /// Save one frame as PNG
    Snapshot {
        output: PathBuf,
        /// Skip undistortion
        #[arg(long)]
        raw: bool,
    },

    /// Poll frames on a fixed cadence and report capture statistics
    Preview {
        #[arg(long, default_value = "10")]
        frames: u32,
        #[arg(long, default_value = "200")]
        interval_ms: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ZeroTarget {
    X,
    Y,
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GantryConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config)?;

    let backend = if cli.simulate {
        Backend::Simulated
    } else {
        Backend::Hardware
    };
    info!(app = %config.application.name, ?backend, "Starting");

    match cli.command {
        Commands::Move {
            x,
            y,
            relative,
            feed,
        } => {
            let target = AxisValues { x, y };
            if target.is_empty() {
                bail!("give --x, --y or both");
            }
            with_motion(&config, backend, |driver| {
                let feed = feed.unwrap_or(driver.config().feed_rate);
                if relative {
                    driver.move_relative(target, feed)
                } else {
                    driver.move_absolute(target, feed)
                }
            })
        }
        Commands::Home => {
            let mut driver = station::connect_motion(&config.motion, backend)?;
            station::run_and_close(&mut driver, GrblDriver::home)?;
            println!("Homing cycle started");
            Ok(())
        }
        Commands::Zero { target } => with_motion(&config, backend, |driver| match target {
            ZeroTarget::X => driver.zero(Axis::X),
            ZeroTarget::Y => driver.zero(Axis::Y),
            ZeroTarget::All => driver.zero_all(),
        }),
        Commands::Session { waypoints } => run_session(&config, backend, &waypoints),
        Commands::Snapshot { output, raw } => {
            let mut frames = station::open_frames(&config, backend)?;
            // Let the capture thread publish a real frame.
            wait_for_first_frame(&frames, Duration::from_secs(10))?;
            let frame = if raw {
                frames.get_raw_image()
            } else {
                frames.get_image()
            };
            frames.stop()?;
            station::save_png(&frame, &output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {}x{} frame to {}", frame.width, frame.height, output.display());
            Ok(())
        }
        Commands::Preview {
            frames: count,
            interval_ms,
        } => {
            let mut frames = station::open_frames(&config, backend)?;
            let interval = Duration::from_millis(interval_ms);
            for i in 0..count {
                let started = Instant::now();
                let frame = frames.get_image();
                println!(
                    "frame {:>4}: {}x{} mean={:.1} ({:?})",
                    i,
                    frame.width,
                    frame.height,
                    mean_level(&frame.data),
                    started.elapsed()
                );
                thread::sleep(interval);
            }
            frames.stop()?;
            println!("{:?}", frames.stats());
            Ok(())
        }
    }
}

/// Open the link, run one motion command, close.
fn with_motion(
    config: &GantryConfig,
    backend: Backend,
    op: impl FnOnce(&mut GrblDriver) -> gantry_vision::gantry_core::AppResult<MotionOutcome>,
) -> Result<()> {
    let mut driver = station::connect_motion(&config.motion, backend)?;
    let outcome = station::run_and_close(&mut driver, op)?;
    report(outcome, &driver);
    Ok(())
}

fn run_session(config: &GantryConfig, backend: Backend, waypoints: &[String]) -> Result<()> {
    let points = waypoints
        .iter()
        .map(|w| parse_waypoint(w))
        .collect::<Result<Vec<_>>>()?;

    let mut driver = station::connect_motion(&config.motion, backend)?;
    driver.run_session(|driver| {
        for (x, y) in &points {
            let outcome = driver.move_absolute_default(AxisValues::xy(*x, *y))?;
            report(outcome, driver);
        }
        Ok(())
    })?;
    println!("Session complete, {} waypoints", points.len());
    Ok(())
}

fn parse_waypoint(text: &str) -> Result<(f64, f64)> {
    let (x, y) = text
        .split_once(',')
        .with_context(|| format!("waypoint {text:?} is not X,Y"))?;
    let x = x.trim().parse().with_context(|| format!("bad X in {text:?}"))?;
    let y = y.trim().parse().with_context(|| format!("bad Y in {text:?}"))?;
    Ok((x, y))
}

fn report(outcome: MotionOutcome, driver: &GrblDriver) {
    match outcome {
        MotionOutcome::Idle => println!("At {}", driver.position()),
        MotionOutcome::Alarm(line) => {
            warn!(%line, "Move ended in alarm");
            println!("Alarm: {} (position still {})", line, driver.position());
        }
    }
}

fn wait_for_first_frame(
    frames: &gantry_vision::gantry_camera::FrameSource,
    limit: Duration,
) -> Result<()> {
    let deadline = Instant::now() + limit;
    while frames.stats().frames_captured == 0 {
        if Instant::now() >= deadline {
            bail!("no frame captured within {:?}", limit);
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn mean_level(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&b| b as u64).sum::<u64>() as f64 / data.len() as f64
}
