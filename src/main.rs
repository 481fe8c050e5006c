use std::path::PathBuf;

use anyhow::Context;
use bm2read::{BatteryMonitor, BluestTransport, MonitorConfig, PollOutcome, ReadingPipeline};
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::oneshot;
use tokio::time::sleep;

/// Poll a BM2 battery monitor and log its readings.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML config file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Poll once and exit
    #[arg(long)]
    once: bool,
}

/// With `--once` the exit status reflects whether the monitor could be read.
fn once_result(title: &str, outcome: PollOutcome) -> anyhow::Result<()> {
    outcome
        .map(|_| ())
        .with_context(|| format!("{title} unavailable"))
}

/// Runs until `shutdown` fires. A poll in progress is always finished first so the
/// monitor is left disconnected.
async fn run(args: Args, mut shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => MonitorConfig::default(),
    };

    let profile = config.profile()?;
    info!("Battery chemistry: {:?}", profile.chemistry());
    let pipeline = ReadingPipeline::new(profile, config.status_map()?);

    info!("Scanning for {:?}", config.device_names);
    let transport = BluestTransport::discover(&config.device_names, config.scan_timeout())
        .await
        .context("Battery monitor not found")?;
    let title = format!("BM2 battery monitor ({})", transport.name());

    let mut monitor = BatteryMonitor::new(transport, pipeline, config.timing(), config.schedule());

    loop {
        if monitor.is_poll_due() {
            let outcome = monitor.poll().await;
            match &outcome {
                Ok(reading) => info!(
                    "{title}: {:.2} V, {} %, {} ({})",
                    reading.voltage,
                    reading.percentage,
                    reading.status,
                    reading.icon()
                ),
                Err(err) => error!("{title} unavailable ({:?}): {err}", err.kind()),
            }
            if args.once {
                return once_result(&title, outcome);
            }
        }
        tokio::select! {
            _ = sleep(config.check_interval()) => {}
            _ = &mut shutdown => {
                warn!("Interrupted, exiting");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(err) => error!("Failed to listen for Ctrl+C: {err}"),
        }
    });

    run(args, rx).await
}

#[test]
fn test_once_fails_when_the_poll_fails() {
    use bm2read::{AdjustedReading, BatteryStatus, PollError};
    use std::time::Duration;

    let err = once_result("BM2", Err(PollError::Timeout(Duration::from_secs(20)))).unwrap_err();
    assert_eq!(err.to_string(), "BM2 unavailable");

    let reading = AdjustedReading {
        voltage: 12.6,
        percentage: 70,
        status_code: 1,
        status: BatteryStatus::Low,
    };
    assert!(once_result("BM2", Ok(reading)).is_ok());
}
