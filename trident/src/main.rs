//! # Trident
//!
//! Real-time motion engine for a linear-delta 3D printer running on a
//! Raspberry-Pi-class Linux board with direct peripheral access.
//!
//! # Usage
//!
//! ```bash
//! # Run against real hardware (needs root for /dev/mem)
//! trident --config /etc/trident/printer.toml
//!
//! # DMA-paced GPIO emission instead of busy-wait timing
//! trident --config printer.toml --dma --rt
//!
//! # No hardware: simulated pins and a monotonic clock
//! trident --config printer.toml --simulate -v
//! ```
//!
//! Commands arrive as G-code lines on stdin; transport fancier than that
//! (TCP, serial) belongs to a host-side sender.

use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use trident::emitter::{DmaEmitter, RingCursor};
use trident::engine::{Emitter, Engine};
use trident::intake::{command_queue, CommandSender};
use trident::{gcode, rt};
use trident_common::config::PrinterConfig;
use trident_common::consts::DMA_FRAME_PERIOD_US;
use trident_hal::dma::{DmaEngine, FrameRing};
use trident_hal::gpio::GpioBlock;
use trident_hal::mmap::Peripherals;
use trident_hal::{Clock, MonotonicClock, PinBackend, SimBus, SysTimer};

/// Trident - linear-delta motion engine
#[derive(Parser, Debug)]
#[command(name = "trident")]
#[command(version)]
#[command(about = "Real-time motion core for a linear-delta 3D printer")]
#[command(long_about = None)]
struct Args {
    /// Path to the printer configuration file.
    #[arg(short, long, default_value = "/etc/trident/printer.toml")]
    config: PathBuf,

    /// Use simulated pins and a monotonic clock (no hardware access).
    #[arg(short, long)]
    simulate: bool,

    /// Emit GPIO through the DMA ring instead of direct busy-wait writes.
    #[arg(long)]
    dma: bool,

    /// Lock memory and request SCHED_FIFO priority.
    #[arg(long)]
    rt: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);
    if let Err(e) = run(&args) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(args: &Args) {
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    info!("trident v{} starting", env!("CARGO_PKG_VERSION"));

    let config = PrinterConfig::load(&args.config)?;
    info!(
        service = %config.shared.service_name,
        r_um = config.geometry.r_um,
        l_um = config.geometry.l_um,
        "config loaded"
    );

    if args.rt {
        if let Err(e) = rt::lock_and_prioritize(rt::DEFAULT_RT_PRIORITY) {
            warn!(error = %e, "RT setup failed; continuing best-effort");
        }
    }

    let abort = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = command_queue(abort.clone());

    // SIGINT must leave every pin in its default state; the abort flag
    // stops the loop and the engine's shutdown path drives the pins.
    {
        let abort = abort.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received");
            abort.store(true, Ordering::SeqCst);
        })?;
    }

    spawn_stdin_reader(sender);

    if args.simulate {
        info!("simulation mode: no hardware will be touched");
        let backend = PinBackend::Sim(SimBus::new());
        let clock = MonotonicClock::new();
        let mut engine = Engine::new(
            &config,
            backend,
            clock,
            receiver,
            abort,
            Emitter::Direct,
        )?;
        engine.run();
        return Ok(());
    }

    let peripherals = Peripherals::map(config.hal.peripheral_base)?;
    let backend = PinBackend::Mem(GpioBlock::new(peripherals.gpio.clone()));
    let clock = SysTimer::new(peripherals.timer.clone());

    let emitter = if args.dma {
        let ring = FrameRing::locked(config.hal.dma_ring_pages)?;
        let dma_engine = DmaEngine::build(
            peripherals.dma.clone(),
            peripherals.pwm.clone(),
            peripherals.clk.clone(),
            config.hal.dma_channel,
            &ring,
            DMA_FRAME_PERIOD_US,
        )?;
        dma_engine.start();
        Emitter::Dma(DmaEmitter::new(
            ring,
            RingCursor::Hw(dma_engine),
            DMA_FRAME_PERIOD_US,
            clock.now_us(),
        ))
    } else {
        Emitter::Direct
    };

    let mut engine = Engine::new(&config, backend, clock, receiver, abort, emitter)?;
    engine.run();
    info!("clean shutdown");
    Ok(())
}

/// The one allowed auxiliary thread: parse stdin lines and feed the
/// bounded intake queue. A full queue blocks this thread, which is the
/// backpressure the transport contract requires.
fn spawn_stdin_reader(sender: CommandSender) {
    std::thread::Builder::new()
        .name("gcode-intake".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                match gcode::parse_line(&line) {
                    Ok(Some(command)) => {
                        if sender.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, line = %line, "rejected line"),
                }
            }
            // Sender drops here; the engine drains and exits.
        })
        .expect("spawn intake thread");
}
