use clap::Parser;
use log::{LevelFilter, error, info, warn};
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use stage_timelapse::{
    AcquisitionPlan, AppConfig, CommandChannel, ExperimentConfig, ProScanController, Scheduler,
    SerialTransport, SimulatedProScan, StageAxis, SyntheticCamera, SystemClock, TiffSink,
    config::load_config, logger, storage::ensure_folder,
};

// Commands the simulated controller remembers during long runs
const SIMULATOR_HISTORY: usize = 256;

/// Multi-position timelapse acquisition on a Prior ProScan stage
#[derive(Parser, Debug)]
#[command(name = "timelapse")]
#[command(about = "Unattended multi-position timelapse acquisition", long_about = None)]
struct Args {
    /// Path to the application configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the experiment parameter file
    #[arg(short, long, value_name = "FILE", default_value = "params.json")]
    experiment: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Run against an in-process controller instead of the serial port
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let experiment = ExperimentConfig::load(&args.experiment, config.stage.z_scale)?;

    // The acquisition log lives next to the images
    let existed = ensure_folder(&experiment.data_folder)?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    initialize_logging(log_level, &config, &experiment.data_folder)?;
    if !existed {
        info!("Created data folder {}", experiment.data_folder.display());
    }
    log_startup_info(&config, &experiment, &args);

    let shutdown_flag = setup_shutdown_handler()?;
    let stage = connect_stage(&config, args.simulate)?;
    let plan = AcquisitionPlan::from_experiment(&experiment)?;

    let camera = SyntheticCamera::new(config.camera.width, config.camera.height);
    info!("Camera: synthetic {}x{}", config.camera.width, config.camera.height);

    let mut scheduler = Scheduler::new(
        stage,
        Box::new(camera),
        Box::new(TiffSink),
        plan,
        Arc::new(SystemClock),
    )
    .with_options(config.scheduler_options());
    scheduler.set_shutdown_flag(shutdown_flag.clone());

    run_and_report(scheduler, shutdown_flag)
}

/// Initialize logging with configurable level
fn initialize_logging(
    log_level: &str,
    config: &AppConfig,
    data_folder: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let level = log_level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
        LevelFilter::Info
    });

    let log_file = config
        .logging
        .log_to_file
        .then(|| logger::log_file_path(data_folder));
    logger::init_logging(level, log_file.as_deref())?;
    Ok(())
}

/// Log startup information
fn log_startup_info(config: &AppConfig, experiment: &ExperimentConfig, args: &Args) {
    info!("=== Stage Timelapse ===");
    if let Some(path) = &args.config {
        info!("Configuration: {}", path.display());
    }
    info!("Experiment: {}", args.experiment.display());
    info!("Data folder: {}", experiment.data_folder.display());
    if args.simulate {
        info!("Stage: simulated controller");
    } else {
        info!(
            "Stage: {} @ {} baud",
            config.stage.port, config.stage.baud_rate
        );
    }
    info!(
        "Rounds: {}, delay between rounds: {:.1}s",
        experiment.target_rounds,
        experiment.delay.as_secs_f64()
    );
    info!("Positions: {}", experiment.positions.len());
    for (index, trigger) in experiment.triggers.iter().enumerate() {
        info!(
            "Trigger {}: {} (TTL pin: {}, exposure: {})",
            index,
            trigger.name,
            trigger
                .ttl_pin
                .map(|p| p.to_string())
                .unwrap_or_else(|| "none".to_string()),
            trigger
                .exposure
                .map(|e| format!("{} ms", e.as_millis()))
                .unwrap_or_else(|| "camera default".to_string())
        );
    }
}

/// Open the serial port (or the simulator) and configure the controller
fn connect_stage(
    config: &AppConfig,
    simulate: bool,
) -> Result<ProScanController, Box<dyn std::error::Error>> {
    let channel = if simulate {
        let (device, handle) = SimulatedProScan::new();
        handle.set_history_limit(SIMULATOR_HISTORY);
        CommandChannel::new(device)
    } else {
        CommandChannel::new(SerialTransport::open(&config.serial_settings())?)
    };

    let mut stage = config
        .controller_builder(Arc::new(SystemClock))
        .connect(channel)?;
    info!("Connected to ProScan controller");

    for axis in [StageAxis::S, StageAxis::Z] {
        if let Err(e) = stage.resolution(axis) {
            warn!("Could not read axis {} resolution: {}", axis, e);
        }
    }

    Ok(stage)
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - finishing current position and shutting down...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

/// Run the acquisition and report results
fn run_and_report(
    mut scheduler: Scheduler,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting acquisition...");

    let result = match scheduler.run() {
        Ok(summary) => {
            if shutdown_flag.load(Ordering::SeqCst) {
                info!("✓ Acquisition stopped by user");
            } else {
                info!("✓ Acquisition completed successfully!");
            }
            info!(
                "Rounds: {}, images written: {}, aborted position rounds: {}",
                summary.rounds, summary.images_written, summary.aborted_slot_rounds
            );
            Ok(())
        }
        Err(e) => {
            error!("✗ Acquisition failed: {}", e);
            let summary = scheduler.summary();
            error!(
                "Completed {} rounds and wrote {} images before the failure",
                summary.rounds, summary.images_written
            );
            Err(e.into())
        }
    };

    info!("Releasing stage controller...");
    drop(scheduler);
    info!("Cleanup complete");
    logger::flush();

    result
}
