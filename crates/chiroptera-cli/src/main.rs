//! `chiroptera` – command line driver for the ranging engine.
//!
//! Runs a [`SonarSession`] against simulated hardware:
//!
//! - `chiroptera scan` sweeps a simulated room with LiDAR, ToF, stereo and
//!   sonar and prints the reconstructed dimensions.
//! - `chiroptera ping <metres>` fires one chirp at a simulated wall and prints
//!   the echo detection.
//! - `chiroptera config` prints the effective configuration, `config save`
//!   writes it to `~/.chiroptera/config.toml`.
//!
//! `--json` switches every report to JSON. Ctrl-C aborts a running sweep.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chiroptera_hal::EchoDevice;
use chiroptera_hal::sim::{SimRegistry, SimRoom};
use chiroptera_middleware::{EventBus, Topic};
use chiroptera_runtime::{SessionHandle, SonarSession, init_tracing};
use chiroptera_types::{
    ChiropteraError, ControlSignal, EchoDetectionResult, EventPayload, PingCapture, RoomModel,
    ScanPhase, SensorType, Vec3, offset_by_seconds,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use crate::config::Config;

const ECHO_DEVICE: &str = "mic";
const IMU: &str = "imu0";

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// Ultrasonic ranging and room reconstruction on simulated hardware.
#[derive(Parser, Debug)]
#[command(name = "chiroptera", version)]
struct Cli {
    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq)]
enum Command {
    /// Sweep the simulated room and report its dimensions
    Scan,
    /// Ping a simulated wall at the given distance
    Ping {
        /// Distance to the wall in metres
        #[arg(value_parser = parse_distance)]
        distance_meters: f64,
    },
    /// Print the effective configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq)]
enum ConfigAction {
    /// Write the effective configuration to ~/.chiroptera/config.toml
    Save,
}

fn parse_distance(raw: &str) -> Result<f64, String> {
    let d: f64 = raw.parse().map_err(|_| format!("'{raw}' is not a distance in metres"))?;
    if !d.is_finite() || d <= 0.0 {
        return Err("ping distance must be a positive number of metres".into());
    }
    Ok(d)
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let _guard = init_tracing("chiroptera");

    let cli = Cli::parse();

    let cfg = match config::load_effective() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "config error".red().bold());
            return ExitCode::FAILURE;
        }
    };

    let abort = Arc::new(AtomicBool::new(false));
    let abort_flag = Arc::clone(&abort);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "Ctrl-C received, aborting …".yellow().bold());
        abort_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let result = match cli.command {
        Command::Config { action: None } => print_config(&cfg, cli.json),
        Command::Config {
            action: Some(ConfigAction::Save),
        } => config::save(&cfg).map(|()| {
            println!("{} {}", "Saved".green(), config::config_path().display());
        }),
        Command::Scan => block_on(run_scan(cfg, cli.json, abort)),
        Command::Ping { distance_meters } => block_on(run_ping(cfg, distance_meters, cli.json)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn block_on<F: Future<Output = Result<(), ChiropteraError>>>(fut: F) -> Result<(), ChiropteraError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ChiropteraError::Config(format!("failed to start runtime: {e}")))?
        .block_on(fut)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ChiropteraError> {
    serde_json::to_string_pretty(value).map_err(|e| ChiropteraError::Config(format!("failed to encode JSON: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

fn print_config(cfg: &Config, json: bool) -> Result<(), ChiropteraError> {
    if json {
        println!("{}", to_json(cfg)?);
    } else {
        let raw = toml::to_string_pretty(cfg)
            .map_err(|e| ChiropteraError::Config(format!("failed to encode TOML: {e}")))?;
        println!("# {}", config::config_path().display());
        println!("{raw}");
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// scan
// ─────────────────────────────────────────────────────────────────────────────

fn sweep_directions(sim: &config::SimulationConfig) -> Vec<Vec3> {
    let az_steps = (360.0 / sim.azimuth_step_deg.max(0.5)).round().max(1.0) as usize;
    let el_steps = (sim.max_elevation_deg / sim.elevation_step_deg.max(0.5)).floor().max(0.0) as i64;
    let mut out = Vec::with_capacity(az_steps * (2 * el_steps as usize + 1));
    for a in 0..az_steps {
        let azimuth = (a as f64 * sim.azimuth_step_deg).to_radians();
        for e in -el_steps..=el_steps {
            let elevation = (e as f64 * sim.elevation_step_deg).to_radians();
            out.push(Vec3::from_spherical(azimuth, elevation));
        }
    }
    out
}

async fn run_scan(cfg: Config, json: bool, abort: Arc<AtomicBool>) -> Result<(), ChiropteraError> {
    let sim_cfg = cfg.simulation;
    let sample_rate = cfg.session.waveform.sample_rate_hz;
    let sim = SimRegistry::builder()
        .with_room(SimRoom::from_dimensions(
            sim_cfg.room_length_m,
            sim_cfg.room_width_m,
            sim_cfg.room_height_m,
            sim_cfg.floor_depth_m,
        ))
        .with_range_sensor("lidar", SensorType::Lidar)
        .with_range_sensor("tof", SensorType::TimeOfFlight)
        .with_range_sensor("stereo", SensorType::StereoVision)
        .with_imu(IMU)
        .with_echo_device(ECHO_DEVICE, sample_rate)
        .with_seed(sim_cfg.seed);
    let mut registry = sim.build();

    let directions = sweep_directions(&sim_cfg);
    let mut session_cfg = cfg.session;
    // Every range sensor reports once per direction.
    let readings = directions.len() * registry.range_sensor_ids().len();
    session_cfg.depth_queue_capacity = session_cfg.depth_queue_capacity.max(readings);
    let session = SonarSession::spawn(session_cfg, EventBus::default())?;
    let handle = session.handle();
    let correlator = cfg.session.correlator;
    let record_seconds =
        correlator.acoustics.delay_from_distance(correlator.max_range_meters) + cfg.session.waveform.duration_seconds;

    handle.send_control(ControlSignal::StartPing).await?;
    handle.send_control(ControlSignal::StartSweep).await?;

    if !json {
        println!("{} {} directions", "Sweeping".bold().cyan(), directions.len());
    }
    let t0 = Utc::now();
    for (i, direction) in directions.iter().enumerate() {
        if abort.load(Ordering::SeqCst) {
            handle.send_control(ControlSignal::StopSweep).await?;
            session.shutdown().await?;
            println!("{}", "Sweep aborted.".yellow());
            return Ok(());
        }
        let ts = offset_by_seconds(t0, i as f64 * sim_cfg.dwell_seconds);
        handle.push_imu(registry.read_imu(IMU, ts)?);
        for reading in registry.sample_all(*direction, ts) {
            handle.push_depth(reading);
        }
        let chirp = handle.chirp_at(ts);
        let recorded = registry.echo_device(ECHO_DEVICE)?.ping(&chirp, *direction, record_seconds)?;
        // Best effort: a full audio queue drops the ping, the other sensors still cover the direction.
        handle.push_capture(PingCapture { recorded, direction: *direction });
        tokio::task::yield_now().await;
    }

    settle(&handle, cfg.session.fusion_interval_ms).await;
    handle.send_control(ControlSignal::SweepComplete).await?;

    let mut phase = handle.watch_phase();
    let finished = tokio::time::timeout(
        Duration::from_secs(120),
        phase.wait_for(|p| matches!(p, ScanPhase::Finalized | ScanPhase::Idle)),
    )
    .await
    .map_err(|_| ChiropteraError::Channel("timed out waiting for reconstruction".into()))?
    .map(|p| *p)
    .map_err(|_| ChiropteraError::Channel("session stopped during reconstruction".into()))?;

    let stats = handle.stats();
    let model = handle.room_model();
    session.shutdown().await?;

    match (finished, model) {
        (ScanPhase::Finalized, Some(model)) => {
            if json {
                println!("{}", to_json(&serde_json::json!({ "room": model, "stats": stats }))?);
            } else {
                print_room(&model);
                println!(
                    "  {} fused readings, {} pings dropped, {} pings discarded",
                    stats.fused, stats.dropped_audio, stats.discarded_pings
                );
            }
            Ok(())
        }
        _ => Err(ChiropteraError::InsufficientGeometry(
            "sweep did not produce enough planes; try again with a denser sweep".into(),
        )),
    }
}

/// Wait until the session has stopped producing fused readings.
async fn settle(handle: &SessionHandle, fusion_interval_ms: u64) {
    let interval = Duration::from_millis(fusion_interval_ms.max(1) * 5);
    let mut last = handle.stats();
    for _ in 0..200 {
        tokio::time::sleep(interval).await;
        let now = handle.stats();
        if now == last {
            break;
        }
        last = now;
    }
    info!(fused = last.fused, "session settled");
}

fn print_room(model: &RoomModel) {
    println!();
    println!("{}", "Room reconstructed".bold().green());
    println!("  scan      {}", model.scan_id.to_string().dimmed());
    println!("  length    {:.2} m", model.length);
    println!("  width     {:.2} m", model.width);
    println!("  height    {:.2} m", model.height);
    println!("  area      {:.2} m²", model.area);
    println!("  volume    {:.2} m³", model.volume);
    println!("  surfaces  {} ({} corners, {} points)", model.walls.len(), model.corners.len(), model.point_count);
    for wall in &model.walls {
        println!(
            "    {:<8} {:>5.2} m  n=({:+.2}, {:+.2}, {:+.2})  support {}",
            format!("{:?}", wall.kind).to_lowercase(),
            wall.offset,
            wall.normal.x,
            wall.normal.y,
            wall.normal.z,
            wall.support
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ping
// ─────────────────────────────────────────────────────────────────────────────

async fn run_ping(cfg: Config, distance_meters: f64, json: bool) -> Result<(), ChiropteraError> {
    let max_range = cfg.session.correlator.max_range_meters;
    if distance_meters > max_range {
        return Err(ChiropteraError::Config(format!(
            "{distance_meters} m is beyond the {max_range} m range gate"
        )));
    }
    let (result, measured) = ping_once(cfg, distance_meters).await?;
    report_ping(distance_meters, result, measured, json)
}

/// Fire one chirp at a wall `distance_meters` straight ahead and wait for
/// the session's echo event.
async fn ping_once(cfg: Config, distance_meters: f64) -> Result<(EchoDetectionResult, Option<f64>), ChiropteraError> {
    let correlator = cfg.session.correlator;
    // Everything but the target wall sits beyond the range gate.
    let far = correlator.max_range_meters * 4.0;
    let room = SimRoom::new(Vec3::new(-far, -far, -far), Vec3::new(distance_meters, far, far));
    let mut registry = SimRegistry::builder()
        .with_room(room)
        .with_echo_device(ECHO_DEVICE, cfg.session.waveform.sample_rate_hz)
        .with_seed(cfg.simulation.seed)
        .build();

    let bus = EventBus::default();
    let mut ranging = bus.subscribe_to(Topic::Ranging);
    let session = SonarSession::spawn(cfg.session, bus)?;
    let handle = session.handle();
    handle.send_control(ControlSignal::StartPing).await?;

    let direction = Vec3::new(1.0, 0.0, 0.0);
    let record_seconds =
        correlator.acoustics.delay_from_distance(distance_meters) + cfg.session.waveform.duration_seconds * 2.0;
    let chirp = handle.chirp_at(Utc::now());
    let recorded = registry.echo_device(ECHO_DEVICE)?.ping(&chirp, direction, record_seconds)?;
    if !handle.push_capture(PingCapture { recorded, direction }) {
        return Err(ChiropteraError::Channel("audio queue refused the capture".into()));
    }

    let echo = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = ranging.next().await {
            if let EventPayload::Echo { result, distance_meters } = event.payload {
                return Some((result, distance_meters));
            }
        }
        None
    })
    .await
    .map_err(|_| ChiropteraError::Channel("timed out waiting for the echo".into()))?
    .ok_or_else(|| ChiropteraError::Channel("event bus closed".into()))?;
    session.shutdown().await?;
    Ok(echo)
}

fn report_ping(
    truth: f64,
    result: EchoDetectionResult,
    measured: Option<f64>,
    json: bool,
) -> Result<(), ChiropteraError> {
    if json {
        let body = serde_json::json!({
            "target_meters": truth,
            "measured_meters": measured,
            "echo": result,
        });
        println!("{}", to_json(&body)?);
        return Ok(());
    }

    match measured {
        Some(d) => {
            println!("{} {:.3} m", "Echo".bold().green(), d);
            println!("  target      {truth:.3} m (error {:+.1} mm)", (d - truth) * 1000.0);
        }
        None => println!("{}", "No echo detected".bold().yellow()),
    }
    println!("  delay       {:.3} ms", result.delay_seconds * 1000.0);
    println!("  peak        {:.3}", result.peak_correlation_magnitude);
    println!("  sidelobes   {:.3}", result.sidelobe_floor);
    println!("  snr         {:.1} dB", result.signal_to_noise_ratio_db);
    println!("  confidence  {:.2}", result.confidence);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(list: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("chiroptera").chain(list.iter().copied()))
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse(&["scan"]).unwrap().command, Command::Scan);
        let ping = parse(&["--json", "ping", "1.5"]).unwrap();
        assert!(ping.json);
        assert_eq!(ping.command, Command::Ping { distance_meters: 1.5 });
        assert!(parse(&["config", "--json"]).unwrap().json);
        assert_eq!(parse(&["config"]).unwrap().command, Command::Config { action: None });
        assert_eq!(
            parse(&["config", "save"]).unwrap().command,
            Command::Config {
                action: Some(ConfigAction::Save)
            }
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["ping"]).is_err());
        assert!(parse(&["ping", "far"]).is_err());
        assert!(parse(&["ping", "-2"]).is_err());
        assert!(parse(&["ping", "0"]).is_err());
        assert!(parse(&["jump"]).is_err());
        assert!(parse(&["--verbose", "scan"]).is_err());
    }

    #[test]
    fn distance_values_are_validated() {
        assert_eq!(parse_distance("2.5"), Ok(2.5));
        assert!(parse_distance("inf").is_err());
        assert!(parse_distance("-1").is_err());
    }

    #[test]
    fn sweep_covers_the_sphere_band() {
        let dirs = sweep_directions(&config::SimulationConfig::default());
        assert_eq!(dirs.len(), 72 * 17);
        assert!(dirs.iter().all(|d| (d.norm() - 1.0).abs() < 1e-12));
        let max_z = dirs.iter().map(|d| d.z).fold(f64::MIN, f64::max);
        assert!((max_z - 80f64.to_radians().sin()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ping_detects_simulated_wall() {
        let (result, measured) = ping_once(Config::default(), 2.0).await.unwrap();
        assert!(result.is_detected());
        assert!((measured.unwrap() - 2.0).abs() < 0.02);
    }
}
