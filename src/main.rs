//! CLI entry point for the drive-test engine.
//!
//! Provides a command-line interface for:
//! - Validating a configuration file (`check-config`)
//! - Running a full session against the in-memory mock fleet (`demo`)
//! - Running a session against real serial hardware (`run`, requires the
//!   `serial` feature)
//!
//! The demo wires up the whole engine end to end: discovery, GPS election,
//! scenario dispatch and the measurement loops, all over in-memory pipes,
//! and prints a summary of what was collected.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use drivetest_engine::config::Settings;
use drivetest_engine::lifecycle::EngineController;
use drivetest_engine::logging;
use drivetest_engine::model::SlotId;
use drivetest_engine::publish::BroadcastPublisher;
use drivetest_engine::store::{MemoryStore, Store};
use drivetest_engine::transport::{nmea_sentence, LinkFactory, MockFleet, MockModemProfile};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "drivetest")]
#[command(about = "Drive-test data-collection engine for cellular modem fleets", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config/drivetest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Run a complete session against the simulated modem fleet
    Demo {
        /// How long to record before stopping
        #[arg(long, default_value = "15")]
        seconds: u64,
    },

    /// Run a session against real serial hardware
    Run {
        /// Inspection type, e.g. "benchmark"
        #[arg(long, default_value = "benchmark")]
        kind: String,
        /// Inspection code
        #[arg(long)]
        code: String,
        /// Operator expert name
        #[arg(long)]
        expert: String,
        /// Recording duration; zero records until interrupted
        #[arg(long, default_value = "0")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::CheckConfig => {
            println!(
                "configuration ok: {} slots across {} operators",
                settings.total_slots(),
                settings.operators.len()
            );
            Ok(())
        }
        Commands::Demo { seconds } => run_demo(settings, seconds).await,
        Commands::Run {
            kind,
            code,
            expert,
            seconds,
        } => run_hardware(settings, kind, code, expert, seconds).await,
    }
}

/// Build a simulated fleet matching the configured layout: one modem per
/// slot, the first half on the first operator's SIMs, a GPS track on the
/// last slot.
fn demo_fleet(settings: &Settings) -> MockFleet {
    let track = vec![
        nmea_sentence("GPRMC,110324.00,A,3542.8080,N,05124.5550,E,12.5,80.0,210826,,,A"),
        nmea_sentence("GPGGA,110324.00,3542.8080,N,05124.5550,E,1,08,1.0,1180.2,M,-17.0,M,,"),
        nmea_sentence("GPRMC,110326.00,A,3542.8121,N,05124.5601,E,13.1,80.0,210826,,,A"),
        nmea_sentence("GPGGA,110326.00,3542.8121,N,05124.5601,E,1,08,1.0,1181.0,M,-17.0,M,,"),
    ];

    let mut fleet = MockFleet::new(settings.fleet.device_prefix.clone());
    let total = settings.total_slots();
    for index in 0..total {
        let operator = &settings.operators[index / settings.fleet.slots_per_group];
        let mut profile = MockModemProfile::basic(index + 1, &operator.home_plmn);
        if index == total - 1 {
            profile = profile.with_gps_track(track.clone());
        }
        fleet.add_slot(SlotId(index), profile);
    }
    fleet
}

async fn run_demo(settings: Settings, seconds: u64) -> Result<()> {
    let settings = Arc::new(settings);
    let factory: Arc<dyn LinkFactory> = Arc::new(demo_fleet(&settings));
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(BroadcastPublisher::default());

    // Mirror every engine event to stdout for the duration of the demo.
    let mut events = publisher.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        }
    });

    let controller = EngineController::new(
        Arc::clone(&settings),
        factory,
        Arc::clone(&store) as Arc<dyn Store>,
        publisher,
    );

    drive(&controller, "benchmark", "DEMO-01", "demo").await?;

    let inspection = controller
        .current_inspection()
        .ok_or_else(|| anyhow!("no inspection after init"))?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let fixes = store.fixes(inspection).await;
    let samples = store.samples(inspection).await;
    controller.stop();
    printer.abort();

    println!();
    println!("demo finished:");
    println!("  modems     {}", store.modems(inspection).await.len());
    println!("  gps fixes  {}", fixes.len());
    println!("  samples    {}", samples.len());
    let no_coverage = samples.iter().filter(|s| s.is_no_coverage()).count();
    if no_coverage > 0 {
        println!("  no-coverage rows {no_coverage}");
    }
    Ok(())
}

#[cfg(feature = "serial")]
async fn run_hardware(
    settings: Settings,
    kind: String,
    code: String,
    expert: String,
    seconds: u64,
) -> Result<()> {
    use drivetest_engine::transport::TokioSerialFactory;

    let settings = Arc::new(settings);
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(BroadcastPublisher::default());
    let controller = EngineController::new(
        Arc::clone(&settings),
        Arc::new(TokioSerialFactory),
        Arc::clone(&store) as Arc<dyn Store>,
        publisher,
    );

    drive(&controller, &kind, &code, &expert).await?;

    if seconds > 0 {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    } else {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    }
    controller.stop();
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run_hardware(
    _settings: Settings,
    _kind: String,
    _code: String,
    _expert: String,
    _seconds: u64,
) -> Result<()> {
    Err(drivetest_engine::error::EngineError::SerialFeatureDisabled.into())
}

async fn drive(controller: &EngineController, kind: &str, code: &str, expert: &str) -> Result<()> {
    let outcome = controller.init(kind, code, expert).await?;
    if !outcome.accepted {
        bail!("init refused: {}", outcome.message);
    }
    let outcome = controller.start().await?;
    if !outcome.accepted {
        bail!("start refused: {}", outcome.message);
    }
    Ok(())
}
