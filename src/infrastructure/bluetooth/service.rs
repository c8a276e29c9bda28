//! Bluetooth Service Module
//!
//! Main service that turns adapter and bonding events into registry calls
//! and forwards application commands to every ready session.

use crate::domain::models::{AdapterEvent, DeviceIdentity, OutgoingCommand};
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::registry::SessionRegistry;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Source of adapter power and bonding information.
#[async_trait]
pub trait AdapterMonitor: Send + Sync {
    async fn is_enabled(&self) -> Result<bool, TransportError>;

    /// Devices that are bonded right now.
    async fn bonded_devices(&self) -> Result<Vec<DeviceIdentity>, TransportError>;

    /// Start delivering adapter and bonding changes to `events`.
    async fn watch(&self, events: mpsc::UnboundedSender<AdapterEvent>)
        -> Result<(), TransportError>;
}

/// Main Bluetooth service coordinating all sessions
pub struct BluetoothService {
    registry: Arc<SessionRegistry>,
    monitor: Arc<dyn AdapterMonitor>,
}

impl BluetoothService {
    pub fn new(registry: Arc<SessionRegistry>, monitor: Arc<dyn AdapterMonitor>) -> Self {
        Self { registry, monitor }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Add a session for every bonded device if the adapter is on.
    /// Returns how many devices were found.
    pub async fn start(&self) -> Result<usize, TransportError> {
        if !self.monitor.is_enabled().await? {
            info!("Bluetooth adapter is off, waiting for it to be enabled");
            return Ok(0);
        }
        let bonded = self.monitor.bonded_devices().await?;
        info!("Found {} bonded device(s)", bonded.len());
        for identity in &bonded {
            self.registry.add_or_get_session(identity);
        }
        Ok(bonded.len())
    }

    pub async fn handle_event(&self, event: AdapterEvent) {
        debug!("Adapter event: {:?}", event);
        match event {
            AdapterEvent::Enabled => {
                if let Err(e) = self.start().await {
                    warn!("Could not enumerate bonded devices: {}", e);
                }
            }
            AdapterEvent::Disabled => {
                info!("Bluetooth adapter disabled");
                self.registry.shutdown_all().await;
            }
            AdapterEvent::Bonded(identity) => {
                self.registry.add_or_get_session(&identity);
            }
            AdapterEvent::Unbonded(identity) => {
                self.registry.remove_session(&identity).await;
            }
        }
    }

    /// Fire-and-forget delivery to every ready session.
    pub fn dispatch(&self, command: &OutgoingCommand) -> usize {
        let delivered = self.registry.broadcast(command);
        if delivered == 0 {
            debug!("No ready session for {:?}", command.payload());
        }
        delivered
    }

    /// Run until `shutdown` resolves or both inputs are closed, then close
    /// every session.
    pub async fn run(
        &self,
        mut commands: mpsc::UnboundedReceiver<OutgoingCommand>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), TransportError> {
        let (event_tx, mut events) = mpsc::unbounded_channel();
        self.monitor.watch(event_tx).await?;
        self.start().await?;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(command) = commands.recv() => {
                    self.dispatch(&command);
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                else => break,
            }
        }

        self.registry.shutdown_all().await;
        info!("Bluetooth service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SessionState;
    use crate::domain::pins::{Pin, PinOperation};
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::mock::{MockConnector, MockPeripheral};
    use crate::infrastructure::bluetooth::notifications::notification_channel;
    use crate::infrastructure::bluetooth::protocol::{self, HOST_ORIGIN};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct MockAdapter {
        enabled: bool,
        bonded: Vec<DeviceIdentity>,
        events: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
    }

    impl MockAdapter {
        fn new(enabled: bool, bonded: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                enabled,
                bonded: bonded.iter().map(|s| DeviceIdentity::new(*s)).collect(),
                events: Mutex::new(None),
            })
        }

        fn emit(&self, event: AdapterEvent) {
            if let Some(tx) = self.events.lock().unwrap().as_ref() {
                tx.send(event).unwrap();
            }
        }
    }

    #[async_trait]
    impl AdapterMonitor for MockAdapter {
        async fn is_enabled(&self) -> Result<bool, TransportError> {
            Ok(self.enabled)
        }

        async fn bonded_devices(&self) -> Result<Vec<DeviceIdentity>, TransportError> {
            Ok(self.bonded.clone())
        }

        async fn watch(
            &self,
            events: mpsc::UnboundedSender<AdapterEvent>,
        ) -> Result<(), TransportError> {
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }
    }

    fn service(connector: &Arc<MockConnector>, adapter: Arc<MockAdapter>) -> BluetoothService {
        let (tx, _rx) = notification_channel(None);
        let registry = SessionRegistry::new(connector.clone(), ConnectionConfig::default(), tx);
        BluetoothService::new(Arc::new(registry), adapter)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met");
    }

    #[tokio::test]
    async fn test_start_adds_bonded_devices() {
        let connector = MockConnector::new();
        connector.add("D1", MockPeripheral::default());
        connector.add("D2", MockPeripheral::default());
        let service = service(&connector, MockAdapter::new(true, &["D1", "D2"]));

        assert_eq!(service.start().await.unwrap(), 2);
        assert_eq!(service.registry().len(), 2);
    }

    #[tokio::test]
    async fn test_start_with_adapter_off_adds_nothing() {
        let connector = MockConnector::new();
        let service = service(&connector, MockAdapter::new(false, &["D1"]));

        assert_eq!(service.start().await.unwrap(), 0);
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_bond_events_drive_registry() {
        let connector = MockConnector::new();
        connector.add("D1", MockPeripheral::default());
        let service = service(&connector, MockAdapter::new(true, &[]));
        let d1 = DeviceIdentity::new("D1");

        service.handle_event(AdapterEvent::Bonded(d1.clone())).await;
        service.handle_event(AdapterEvent::Bonded(d1.clone())).await;
        assert_eq!(service.registry().len(), 1);

        service.handle_event(AdapterEvent::Unbonded(d1.clone())).await;
        service.handle_event(AdapterEvent::Unbonded(d1.clone())).await;
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_adapter_disabled_shuts_down_sessions() {
        let connector = MockConnector::new();
        connector.add("D1", MockPeripheral::default());
        let service = service(&connector, MockAdapter::new(true, &["D1"]));
        service.start().await.unwrap();

        service.handle_event(AdapterEvent::Disabled).await;
        assert!(service.registry().is_empty());

        service.handle_event(AdapterEvent::Enabled).await;
        assert_eq!(service.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_run_forwards_commands_and_stops() {
        let connector = MockConnector::new();
        connector.add("D1", MockPeripheral::default());
        connector.add("D2", MockPeripheral::default());
        let adapter = MockAdapter::new(true, &["D1"]);
        let service = Arc::new(service(&connector, adapter.clone()));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .run(command_rx, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let registry = service.registry().clone();
        let d1 = DeviceIdentity::new("D1");
        eventually(|| registry.state(&d1) == Some(SessionState::Ready)).await;

        adapter.emit(AdapterEvent::Bonded(DeviceIdentity::new("D2")));
        let d2 = DeviceIdentity::new("D2");
        eventually(|| registry.state(&d2) == Some(SessionState::Ready)).await;

        let command = OutgoingCommand::set_pin(HOST_ORIGIN, Pin::G26, PinOperation::SetHigh);
        command_tx.send(command).unwrap();
        let link = connector.link("D1").unwrap();
        eventually(|| link.writes().len() == 2).await;
        assert_eq!(link.writes()[1], protocol::encode(&command));
        eventually(|| connector.link("D2").unwrap().writes().len() == 2).await;

        stop_tx.send(()).unwrap();
        timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
        assert!(registry.is_empty());
        assert!(link.was_disconnected());
    }
}
