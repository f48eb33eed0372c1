//! # Transit Frame Entry Point
//!
//! Wires the library together: configuration, logging, the panel, the
//! arrivals client and the signal handlers, then hands control to the
//! scheduler until SIGTERM/SIGINT.
//!
//! ```text
//! transit-frame [--simulate] [--config <path>]
//! ```
//!
//! `--simulate` (or a build without the `hardware` feature) drives a
//! simulated panel that can write each presented frame to `SNAPSHOT_PATH`.

use anyhow::{bail, Context};
use log::{error, info, warn};
use std::env;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use transit_frame_lib::{
    arrivals::ArrivalFetcher,
    config::{Config, CONFIG_FILE},
    frames::{DirectoryStore, FrameSequencer},
    panel::{Panel, SimulatedPanel, PANEL_HEIGHT, PANEL_WIDTH},
    refresh::RefreshController,
    render::EinkRenderer,
    schedule::{Scheduler, Shutdown, SystemClock},
};

/// Command line options
struct Args {
    simulate: bool,
    config_path: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        simulate: false,
        config_path: PathBuf::from(CONFIG_FILE),
    };
    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--simulate" => args.simulate = true,
            "--config" => {
                args.config_path = iter
                    .next()
                    .map(PathBuf::from)
                    .context("--config needs a path")?;
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(args)
}

fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .format_timestamp_secs()
        .init();
}

/// Resolve on the first SIGTERM or SIGINT and raise the shutdown flag
async fn signal_handler(shutdown: Shutdown) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received. Initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received. Initiating graceful shutdown."),
    }
    shutdown.trigger();
    Ok(())
}

/// Bring the panel up blank and run the control loop until shutdown
async fn run<P: Panel>(panel: P, config: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let tz = config.schedule.civil_tz();
    let arrivals = ArrivalFetcher::new(&config.transit, tz).context("build HTTP client")?;

    let mut controller = RefreshController::new(panel, &config.refresh);
    controller.initialize().context("panel init")?;
    if let Err(e) = controller.clear() {
        warn!("Initial clear failed: {}", e);
    }

    let mut scheduler = Scheduler::new(
        controller,
        FrameSequencer::new(DirectoryStore::new(&config.frames)),
        EinkRenderer::new(),
        arrivals,
        SystemClock::new(tz),
        shutdown,
        config,
    );
    scheduler.run().await;
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
async fn run_hardware(config: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    use transit_frame_lib::panel::waveshare::WaveshareV2Panel;

    let panel = WaveshareV2Panel::open(&config.hardware).context("open e-paper panel")?;
    run(panel, config, shutdown).await
}

#[cfg(not(all(target_os = "linux", feature = "hardware")))]
async fn run_hardware(config: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    warn!("Built without the `hardware` feature; using the simulated panel");
    run_simulated(config, shutdown).await
}

async fn run_simulated(config: &Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let panel = SimulatedPanel::new(PANEL_WIDTH, PANEL_HEIGHT, config.snapshot_path.clone());
    run(panel, config, shutdown).await
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = Config::load_from_path(&args.config_path);
    init_logging(&config);

    info!("=== Transit frame starting ===");
    config.log_summary();

    // One thread: the control loop and the signal task share it
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let shutdown = Shutdown::new();
    let result = rt.block_on(async {
        let handler_flag = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = signal_handler(handler_flag).await {
                error!("Signal handler failed: {}", e);
            }
        });

        if args.simulate {
            run_simulated(&config, shutdown).await
        } else {
            run_hardware(&config, shutdown).await
        }
    });

    if let Err(e) = &result {
        error!("Fatal: {:#}", e);
    }
    info!("Exiting");
    result
}
