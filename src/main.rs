use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::LevelFilter;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use imu_streamlog::config::{CONFIG_FILE_NAME, Configuration, normalise_address};
use imu_streamlog::core::bluetooth::{BluestRadio, BluetoothScanner, DeviceRegistry, Radio, SeenDevice};
use imu_streamlog::core::stream::{EventReceiver, Stream, StreamEvent, event_channel};
use imu_streamlog::logging::{ConsoleLogger, Logger};

/// Records motion-tracker telemetry from nearby BLE trackers.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON configuration file; defaults are used when it does not exist
    #[arg(short, long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Only scan and list the trackers in range
    #[arg(long)]
    scan_only: bool,

    /// Stop recording after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    duration: Option<f64>,

    /// Record only this tracker (address or alias); may be repeated
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let duration = args
        .duration
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("--duration must be a non-negative number of seconds in range")?;
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if ConsoleLogger::init(level, None).is_err() {
        env_logger::builder().filter_level(level).init();
    }
    let log = Logger::new("imu_streamlog");

    let rt = Runtime::new().context("Failed to create Tokio runtime")?;
    let (config, radio, registry, devices) = rt.block_on(async {
        let config = Configuration::load(&args.config, &log).await?.validated()?;
        let config = Arc::new(config);
        let radio: Arc<dyn Radio> = Arc::new(BluestRadio::new(log.scoped("radio")).await?);
        let registry = Arc::new(DeviceRegistry::new(&config)?);
        let scanner = BluetoothScanner::new(
            &config,
            radio.clone(),
            registry.clone(),
            CancellationToken::new(),
            log.scoped("scanner"),
        );
        let devices = scanner.scan_for_devices().await;
        anyhow::Ok((config, radio, registry, devices))
    })?;

    if args.scan_only {
        for device in &devices {
            println!(
                "{}\t{}\t{}",
                device.display_id(),
                device.address,
                device.rssi.map_or_else(|| "-".to_string(), |r| r.to_string())
            );
        }
        return Ok(());
    }

    let selection = select_devices(&devices, &args.devices)?;
    let (events_tx, events_rx) = event_channel();
    let mut stream = Stream::new(config, radio, registry, Some(events_tx), log.clone());
    stream.start(&selection)?;
    let halt = stream
        .halt_token()
        .context("session did not report a halt signal")?;

    let received = rt.block_on(watch_session(events_rx, halt, duration, &log));
    stream.stop()?;

    for (device, count) in received {
        log.info(format_args!("{}: {} notifications received", device, count));
    }
    Ok(())
}

/// Narrows the scanned devices to the requested ones; no request means all of them.
fn select_devices(scanned: &[SeenDevice], requested: &[String]) -> Result<Vec<SeenDevice>> {
    if requested.is_empty() {
        return Ok(scanned.to_vec());
    }
    let mut selection = Vec::new();
    for wanted in requested {
        let address = normalise_address(wanted);
        let found = scanned
            .iter()
            .find(|d| d.address == address || d.display_id() == wanted.as_str());
        match found {
            Some(device) => selection.push(device.clone()),
            None => bail!("device {} was not found during the scan", wanted),
        }
    }
    Ok(selection)
}

/// Reports session events until Ctrl-C, the duration elapses or the session halts itself.
async fn watch_session(
    mut events: EventReceiver,
    halt: CancellationToken,
    duration: Option<Duration>,
    log: &Logger,
) -> BTreeMap<String, u64> {
    let mut received: BTreeMap<String, u64> = BTreeMap::new();
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log.info("Interrupted, stopping the recording");
                break;
            }
            _ = &mut deadline => {
                log.info("Recording duration reached");
                break;
            }
            _ = halt.cancelled() => {
                log.error("Session halted after a fatal error");
                break;
            }
            event = events.recv() => match event {
                Some(StreamEvent::ConnectState { device, connected }) => {
                    let state = if connected { "connected" } else { "disconnected" };
                    log.info(format_args!("{} {}", device, state));
                }
                Some(StreamEvent::NewData { device }) => {
                    *received.entry(device).or_default() += 1;
                }
                Some(StreamEvent::Log(_)) => {}
                None => break,
            }
        }
    }
    received
}
