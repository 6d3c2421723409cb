mod actuator;
#[cfg(feature = "adc")]
mod adc;
mod calibration;
mod commands;
mod config;
mod connectivity;
mod executor;
mod identity;
mod scheduler;
mod sensor;
#[cfg(feature = "sim")]
#[cfg_attr(feature = "adc", allow(dead_code))]
mod sim;
mod telemetry;
mod transport;
mod update;

use anyhow::{bail, Context, Result};
use std::env;
use tracing_subscriber::EnvFilter;

use actuator::ActuatorBoard;
use calibration::CalibrationStore;
use config::Config;
use connectivity::ConnectivityManager;
use executor::{CommandExecutor, ExecutorLimits};
use identity::DeviceIdentity;
use scheduler::{DeviceContext, Intervals, Scheduler};
use sensor::{BatteryDivider, SensorReader};
use transport::HttpTransport;
use update::{LoggingObserver, NoUpdates, UpdateAgent};

#[cfg(not(any(feature = "adc", feature = "sim")))]
compile_error!("enable the `adc` feature (hardware) or the `sim` feature (simulator)");

const USAGE: &str = "usage: garden-node [run | calibrate <key>=<value>... | show-calibration]";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = Subcommand::parse(&args)?;

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    match command {
        Subcommand::Run => run(cfg).await,
        Subcommand::Calibrate(pairs) => calibrate(&cfg, &pairs).await,
        Subcommand::ShowCalibration => show_calibration(&cfg).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Subcommand {
    Run,
    Calibrate(Vec<(String, f64)>),
    ShowCalibration,
}

impl Subcommand {
    fn parse(args: &[String]) -> Result<Self> {
        match args.first().map(String::as_str) {
            None | Some("run") if args.len() <= 1 => Ok(Self::Run),
            Some("show-calibration") if args.len() == 1 => Ok(Self::ShowCalibration),
            Some("calibrate") if args.len() > 1 => {
                let pairs = args[1..]
                    .iter()
                    .map(|a| parse_pair(a))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Calibrate(pairs))
            }
            _ => bail!("{USAGE}"),
        }
    }
}

fn parse_pair(arg: &str) -> Result<(String, f64)> {
    let Some((key, value)) = arg.split_once('=') else {
        bail!("expected <key>=<value>, got '{arg}'");
    };
    let value: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("invalid number for '{}': '{value}'", key.trim()))?;
    Ok((key.trim().to_string(), value))
}

async fn calibrate(cfg: &Config, pairs: &[(String, f64)]) -> Result<()> {
    let store = CalibrationStore::open(&cfg.device.calibration_db).await?;
    let mut cal = store.load().await?;
    for (key, value) in pairs {
        cal.set(key, *value)?;
    }
    store.save(&cal).await?;
    println!("{}", serde_json::to_string_pretty(&cal)?);
    Ok(())
}

async fn show_calibration(cfg: &Config) -> Result<()> {
    let store = CalibrationStore::open(&cfg.device.calibration_db).await?;
    let cal = store.load().await?;
    println!("{}", serde_json::to_string_pretty(&cal)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

async fn run(cfg: Config) -> Result<()> {
    let identity = DeviceIdentity::from_config(&cfg)?;

    let store = CalibrationStore::open(&cfg.device.calibration_db).await?;
    let calibration = store.load().await?;

    let (transducers, link) = hardware(&cfg)?;
    let reader = SensorReader::new(transducers, BatteryDivider::from(&cfg.adc));
    let connectivity = ConnectivityManager::new(link, &cfg.network);

    // Fail-safe: the board comes up with everything off.
    let board = ActuatorBoard::new(&cfg.pump, &cfg.lights)?;
    let executor = CommandExecutor::new(board, ExecutorLimits::new(&cfg.pump, &cfg.lights));

    let mut updates = UpdateAgent::new(NoUpdates);
    updates.subscribe(Box::new(LoggingObserver::new(&identity.hostname())));

    let transport = HttpTransport::new(cfg.request_timeout())?;

    tracing::info!(
        server = %identity.server_base_url,
        mac = %identity.mac_address,
        "garden node starting"
    );

    let mut scheduler = Scheduler::new(
        DeviceContext::new(identity, calibration),
        reader,
        connectivity,
        transport,
        executor,
        updates,
        Intervals::from(&cfg),
    );
    scheduler.run(shutdown_signal()).await;
    Ok(())
}

#[cfg(feature = "adc")]
fn hardware(cfg: &Config) -> Result<(adc::I2cTransducers, connectivity::SysfsLink)> {
    let transducers = adc::I2cTransducers::new(&cfg.adc)?;
    Ok((
        transducers,
        connectivity::SysfsLink::new(&cfg.network.interface),
    ))
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
fn hardware(_cfg: &Config) -> Result<(sim::GardenSim, sim::SimLink)> {
    let scenario = sim::Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_else(|_| "drying".to_string()),
    );
    let diurnal_period_s: f64 = env::var("SIM_DIURNAL_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);

    tracing::info!(%scenario, diurnal_period_s, "[sim] using simulated transducers");
    Ok((
        sim::GardenSim::new(scenario, diurnal_period_s),
        sim::SimLink::new(scenario),
    ))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown requested"),
        Err(e) => {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
