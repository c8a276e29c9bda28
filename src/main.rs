use anyhow::{bail, Context, Result};
use smartwatch_sync::domain::models::{NotificationPayload, OutgoingCommand};
use smartwatch_sync::domain::pins::{format_reading, Pin, PinOperation};
use smartwatch_sync::domain::settings::{Settings, SettingsService};
use smartwatch_sync::infrastructure::bluetooth::connection::ConnectionConfig;
use smartwatch_sync::infrastructure::bluetooth::notifications::notification_channel;
use smartwatch_sync::infrastructure::bluetooth::transport::GattConnector;
use smartwatch_sync::infrastructure::bluetooth::{AdapterMonitor, BluetoothService, SessionRegistry};
use smartwatch_sync::infrastructure::data_plane::{DataPlaneClient, DataPlaneServer};
use smartwatch_sync::infrastructure::logging::init_logger;
use smartwatch_sync::presentation::console::run_console;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

const USAGE: &str = "\
usage: smartwatch_sync [mode]

modes:
  serve                     run the session engine (default)
  send <pin> <high|low|read> send one pin command
  status                    print session states
  listen                    print incoming readings
  console                   interactive pin console";

fn main() -> Result<()> {
    let settings = SettingsService::new()?;
    let settings = settings.get().clone();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None | Some("serve") => {
            let _guard = init_logger(&settings.log_settings)?;
            info!("Starting Smartwatch Sync");
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(settings))
        }
        Some("send") => {
            let _guard = init_client_logger(&settings)?;
            let (pin, op) = match &args[1..] {
                [pin, op] => (pin.parse::<Pin>()?, op.parse::<PinOperation>()?),
                _ => bail!("usage: smartwatch_sync send <pin> <high|low|read>"),
            };
            let mut client = DataPlaneClient::connect(&settings.data_plane_name)?;
            client.send_command(OutgoingCommand::set_pin(settings.ble.origin, pin, op))?;
            println!("sent {} {}", pin, op);
            Ok(())
        }
        Some("status") => {
            let _guard = init_client_logger(&settings)?;
            let mut client = DataPlaneClient::connect(&settings.data_plane_name)?;
            let sessions = client.status()?;
            if sessions.is_empty() {
                println!("no sessions");
            }
            for s in sessions {
                println!("{}  {}", s.device, s.state);
            }
            Ok(())
        }
        Some("listen") => {
            let _guard = init_client_logger(&settings)?;
            let mut client = DataPlaneClient::connect(&settings.data_plane_name)?;
            client.ping()?;
            while let Some(received) = client.next_notification()? {
                let NotificationPayload::PinReading { pin, value } = received.notification.payload;
                println!("[{}] {} = {}", received.device, pin, format_reading(value));
            }
            Ok(())
        }
        Some("console") => {
            let _guard = init_client_logger(&settings)?;
            let client = DataPlaneClient::connect(&settings.data_plane_name)?;
            run_console(client, settings.ble.origin)
        }
        Some("help") | Some("--help") | Some("-h") => {
            println!("{}", USAGE);
            Ok(())
        }
        Some(other) => bail!("unknown mode '{}'\n\n{}", other, USAGE),
    }
}

/// Client modes only log warnings to stderr so stdout stays readable.
fn init_client_logger(
    settings: &Settings,
) -> Result<smartwatch_sync::infrastructure::logging::LoggingGuard> {
    let mut log = settings.log_settings.clone();
    log.file_logging_enabled = false;
    log.level = "warn".to_string();
    init_logger(&log)
}

#[cfg(windows)]
fn platform() -> Result<(Arc<dyn GattConnector>, Arc<dyn AdapterMonitor>)> {
    use smartwatch_sync::infrastructure::bluetooth::winrt::{WinRtAdapterMonitor, WinRtConnector};
    Ok((
        Arc::new(WinRtConnector),
        Arc::new(WinRtAdapterMonitor::default()),
    ))
}

#[cfg(not(windows))]
fn platform() -> Result<(Arc<dyn GattConnector>, Arc<dyn AdapterMonitor>)> {
    bail!("serve needs the Windows Bluetooth stack; this platform has no transport")
}

async fn serve(settings: Settings) -> Result<()> {
    let (connector, monitor) = platform()?;

    let (notify_tx, notify_rx) = notification_channel(settings.ble.notification_capacity);
    let registry = Arc::new(SessionRegistry::new(
        connector,
        ConnectionConfig::from(&settings.ble),
        notify_tx,
    ));

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    DataPlaneServer::new(command_tx, registry.clone())
        .spawn(&settings.data_plane_name, notify_rx)
        .context("starting data plane")?;

    let service = BluetoothService::new(registry, monitor);
    service
        .run(command_rx, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
