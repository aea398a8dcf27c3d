use chrono::Utc;
use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, debug, error, info, warn};
use std::{fs, path::PathBuf, time::Duration};

use sqc_core::{
    AppConfig, Executor, JsonlRecorder, LiveMonitor, RunControl, RunHandle, RunOutcome,
    RunReport, Sequence, SimRig, Station, StripLayout, load_config,
};

/// Strip sensor quality control sequencer
#[derive(Parser, Debug)]
#[command(name = "sqc-run")]
#[command(about = "Runs a strip sensor QC measurement sequence", long_about = None)]
struct Args {
    /// Application configuration, defaults to ./sqc.toml when present
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Measurement sequence to run
    #[arg(short, long, value_name = "FILE")]
    sequence: PathBuf,

    /// Strip pad layout of the sensor
    #[arg(short = 'p', long, value_name = "FILE")]
    layout: PathBuf,

    /// Output directory for measurement rows, overrides the config
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Run against the simulated rig
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.log_level.clone());
    initialize_logging(&log_level);

    let mut sequence = Sequence::load(&args.sequence)?;
    let layout = StripLayout::load(&args.layout)?;
    log_startup_info(&args, &sequence, &layout);

    let mut station = setup_station(&config, args.simulate)?;
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.run.output_path.clone());
    let mut recorder = JsonlRecorder::new(
        create_output_path(&output_dir, &sequence)?,
        config.run.buffer_size,
        config.run.final_format_json,
    );
    info!("Writing rows to {}", recorder.path().display());

    let (handle, mut control) = RunControl::new();
    setup_shutdown_handler(handle)?;

    let (mut monitor, status) = LiveMonitor::spawn(
        station.environment.shared_box(),
        station.motion.shared_position(),
        *station.environment.bounds(),
        config.interlock.live_poll(),
    );
    let status_thread = std::thread::spawn(move || {
        for snapshot in status.iter() {
            match &snapshot.status {
                Some(status) if !status.is_ok() => warn!("Environment: {status:?}"),
                _ => debug!(
                    "Environment {:?} at {:?}",
                    snapshot.environment, snapshot.position
                ),
            }
        }
    });

    let report = Executor::new(
        &mut station,
        &mut recorder,
        &mut control,
        &layout,
        config.run.options(),
    )
    .run(&mut sequence);

    monitor.stop();
    let _ = status_thread.join();

    let report = report?;
    log_report(&report);
    println!("{}", serde_json::to_string_pretty(&report)?);

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Aborted => Err("measurement run aborted".into()),
    }
}

fn setup_station(config: &AppConfig, simulate: bool) -> Result<Station, Box<dyn std::error::Error>> {
    if !(simulate || config.station.simulate) {
        return Err("no instrument drivers are configured, run with --simulate".into());
    }
    info!("Using simulated rig");
    let station = SimRig::new()
        .builder()
        .environment_bounds(config.interlock.bounds)
        .interlock_timing(config.interlock.backoff(), config.interlock.max_wait())
        .motion_settings(config.motion.clone())
        .recover_settle(Duration::from_millis(config.station.recover_settle_ms))
        .build()?;
    Ok(station)
}

/// Ctrl+C requests an abort; the executor brings the station to its safe state
fn setup_shutdown_handler(handle: RunHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - aborting run...");
        handle.abort();
    })
}

fn log_startup_info(args: &Args, sequence: &Sequence, layout: &StripLayout) {
    info!("=== SQC Sequencer ===");
    info!(
        "Sequence: {} ({})",
        sequence.name.as_deref().unwrap_or("unnamed"),
        args.sequence.display()
    );
    info!("Measurements: {}", sequence.nodes.len());
    info!(
        "Layout: {} strips ({})",
        layout.strips.len(),
        args.layout.display()
    );
    if let Some(sensor) = &layout.sensor {
        info!("Sensor: {sensor}");
    }
}

fn log_report(report: &RunReport) {
    let elapsed = report.finished - report.started;
    info!(
        "Run {:?} after {:.1} s",
        report.outcome,
        elapsed.num_milliseconds() as f64 / 1000.0
    );
    for node in &report.nodes {
        if node.failures.is_empty() {
            info!("{}: {:?} ({} rows)", node.path, node.state, node.rows);
        } else {
            error!(
                "{}: {:?} ({} rows, {} failures)",
                node.path,
                node.state,
                node.rows,
                node.failures.len()
            );
        }
    }
}

fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{log_level}', using 'info'");
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn create_output_path(
    output_dir: &PathBuf,
    sequence: &Sequence,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    fs::create_dir_all(output_dir)?;
    let name: String = sequence
        .name
        .as_deref()
        .unwrap_or("sequence")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let filename = format!("sqc_{name}_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(output_dir.join(filename))
}
