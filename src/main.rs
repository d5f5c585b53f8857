use anyhow::Result;
use ble_gatt_sample::domain::models::{AppEvent, MessageSeverity};
use ble_gatt_sample::domain::settings::SettingsService;
use ble_gatt_sample::infrastructure::bluetooth::{BluetoothService, HostService};
use ble_gatt_sample::infrastructure::logging::init_logger;
use ble_gatt_sample::infrastructure::radio::sim::SimAir;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "ble-gatt-sample")]
#[command(about = "BLE GATT central and peripheral sample")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a peripheral and a central against each other over the simulated radio
    Demo,
    /// Print the effective settings
    Settings,
    /// Find the configured service on a real adapter, read it and optionally write
    #[cfg(feature = "btleplug")]
    Central {
        /// Also write the configured write text
        #[arg(short, long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_service = match cli.config {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };
    let _log_guard = init_logger(&settings_service.get().log_settings)?;
    info!("Settings loaded from {}", settings_service.path().display());
    let settings = Arc::new(Mutex::new(settings_service));

    match cli.command {
        Commands::Demo => run_demo(settings).await,
        Commands::Settings => print_settings(&settings),
        #[cfg(feature = "btleplug")]
        Commands::Central { write } => run_central(settings, write).await,
    }
}

fn print_settings(settings: &Mutex<SettingsService>) -> Result<()> {
    let settings = settings.lock().map_err(|_| anyhow::anyhow!("Lock error"))?;
    println!("# {}", settings.path().display());
    println!("{}", serde_json::to_string_pretty(settings.get())?);
    Ok(())
}

/// Report events the way a UI would surface them
fn spawn_event_printer(mut events: mpsc::UnboundedReceiver<AppEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AppEvent::DeviceFound(device) => {
                    println!("Found {} ({})", device.address, device.display_name())
                }
                AppEvent::SessionState(state) => debug!("Session {}", state),
                AppEvent::ReadCompleted(record) => {
                    let text = record.text();
                    println!("Read from {}: {:?} [{}]", record.address, text, record.status)
                }
                AppEvent::WriteCompleted(status) => debug!("Write completed: {}", status),
                AppEvent::ConnectedDevices(devices) => {
                    let addresses: Vec<&str> = devices.iter().map(|d| d.address.as_str()).collect();
                    println!("Connected centrals: {:?}", addresses)
                }
                AppEvent::WriteReceived(write) => {
                    let text = write.text();
                    println!("Peripheral received from {}: {:?}", write.device.address, text)
                }
                AppEvent::LogMessage(message) => match message.severity {
                    MessageSeverity::Error => error!("{}", message.message),
                    MessageSeverity::Warning => warn!("{}", message.message),
                    _ => info!("{}", message.message),
                },
            }
        }
    })
}

async fn run_demo(settings: Arc<Mutex<SettingsService>>) -> Result<()> {
    let air = SimAir::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(rx);

    let mut host = HostService::new(
        Arc::new(air.peripheral("5A:00:00:00:00:01", "GATT Sample")),
        tx.clone(),
        settings.clone(),
    );
    host.start().await?;

    let central = BluetoothService::new(
        Arc::new(air.central("5A:00:00:00:00:02")),
        tx,
        settings,
    );
    let device = central.find_and_connect().await?;
    println!("Connected to {}", device.address);

    central.read().await?;
    central.write().await?;
    central.read().await?;

    println!("Read history:");
    for (i, record) in central.read_history().iter().enumerate() {
        println!("  {}. {}", i + 1, record.text());
    }

    central.disconnect().await;
    host.stop();
    drop(central);
    drop(host);
    printer.abort();
    Ok(())
}

#[cfg(feature = "btleplug")]
async fn run_central(settings: Arc<Mutex<SettingsService>>, write: bool) -> Result<()> {
    use ble_gatt_sample::infrastructure::radio::btleplug::BtleplugCentral;

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(rx);

    let radio = BtleplugCentral::new().await?;
    let central = BluetoothService::new(Arc::new(radio), tx, settings);

    let device = central.find_and_connect().await?;
    println!("Connected to {} ({})", device.address, device.display_name());
    println!("{}", central.read().await?);
    if write {
        central.write().await?;
    }

    central.disconnect().await;
    drop(central);
    printer.abort();
    Ok(())
}
