//! Daemon entry point: configuration, component wiring and task spawn.

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing_subscriber::EnvFilter;

use particleserver::bus::driver::{DeadLineDriver, RtuBusDriver};
use particleserver::bus::{BusDriver, BusManager, BusRouter};
use particleserver::config::{DaemonConfig, DEFAULT_CONFIG_PATH, DEFAULT_DATA_DIR};
use particleserver::control::{ControlServer, LiveUpdate, CONTROL_ADDR};
use particleserver::core::logging::LogBook;
use particleserver::instrument::MeasurementEvent;
use particleserver::registry::CounterRegistry;
use particleserver::sink::MeasurementSink;
use particleserver::{scheduler, Result};

#[derive(Parser, Debug)]
#[command(name = "particleserver", version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Directory for persisted instrument files
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load configuration, using defaults");
            DaemonConfig::default()
        }
    };

    tracing::info!("particle server startup");

    let log = LogBook::new();

    // One bus manager per configured serial line; a line that cannot be
    // opened stays in the table so bus indices keep their meaning.
    let (bus_tx, mut bus_rx) = mpsc::unbounded_channel();
    let tx_ids = Arc::new(AtomicU64::new(1));
    let mut managers = Vec::new();
    for (index, interface) in config.buses.iter().enumerate() {
        if let Some(redundant) = &interface.redundant_device {
            tracing::warn!(
                bus = index,
                device = %interface.device,
                redundant = %redundant,
                "redundant bus pairs are not supported yet, using the first interface only"
            );
        }
        let driver: Box<dyn BusDriver> = match RtuBusDriver::open(&interface.device) {
            Ok(driver) => {
                tracing::info!(bus = index, device = %interface.device, "serial line activated");
                Box::new(driver)
            }
            Err(e) => {
                tracing::error!(bus = index, device = %interface.device, error = %e, "unable to open serial line");
                Box::new(DeadLineDriver::new(&interface.device))
            }
        };
        managers.push(BusManager::spawn(
            index,
            driver,
            Duration::from_millis(config.tx_delay_ms),
            tx_ids.clone(),
            bus_tx.clone(),
        ));
    }
    let router = BusRouter::new(managers);

    // Registry with persisted instruments
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(Mutex::new(CounterRegistry::new(
        router,
        log.clone(),
        events_tx,
        &args.data_dir,
    )));
    if let Err(e) = registry.lock().await.load_from_disk() {
        tracing::error!(error = %e, "loading persisted instruments failed");
    }
    tracing::info!(instruments = registry.lock().await.len(), "registry loaded");

    // Measurement dispatch: every assembled dataset goes to the sink,
    // live datasets additionally to the control-surface subscribers
    let sink = MeasurementSink::spawn(&config.influx, log.clone());
    let (live_tx, _) = broadcast::channel(1024);
    let pump_live = live_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            sink.handle_event(&event);
            if let MeasurementEvent::Actual { id, data } = &event {
                let _ = pump_live.send(LiveUpdate {
                    id: *id,
                    values: data.key_values(),
                });
            }
        }
    });

    // Bus event pump: single channel in, demux by transaction id
    let pump_registry = registry.clone();
    tokio::spawn(async move {
        while let Some(event) = bus_rx.recv().await {
            pump_registry.lock().await.dispatch_bus_event(event);
        }
    });

    scheduler::spawn_status_poll(registry.clone());
    scheduler::spawn_clock_resync(registry.clone());

    let server = ControlServer::bind(CONTROL_ADDR, registry.clone(), log.clone(), live_tx).await?;
    server.spawn();

    tracing::info!("particle server running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
