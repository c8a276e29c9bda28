//! Scripted in-memory transport for unit tests.

use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, CharacteristicProperties, ConnectOptions, DiscoveredCharacteristic,
    DiscoveredService, GattConnector, GattLink, LinkEvent, ValueHandler, WriteType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// How a scripted peripheral behaves.
#[derive(Clone)]
pub struct MockPeripheral {
    pub services: Vec<DiscoveredService>,
    pub payload_size: usize,
    pub connect_error: Option<TransportError>,
    pub connect_hangs: bool,
    pub negotiate_error: Option<TransportError>,
    pub write_error: Option<TransportError>,
    pub subscribe_error: Option<TransportError>,
    /// Subscription waits for this to be notified before succeeding.
    pub subscribe_gate: Option<Arc<Notify>>,
    /// Disconnect takes this long to complete.
    pub disconnect_delay: Option<Duration>,
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self {
            services: full_profile(),
            payload_size: 500,
            connect_error: None,
            connect_hangs: false,
            negotiate_error: None,
            write_error: None,
            subscribe_error: None,
            subscribe_gate: None,
            disconnect_delay: None,
        }
    }
}

pub fn handle(uuid: &str) -> CharacteristicHandle {
    CharacteristicHandle {
        service_uuid: protocol::SERVICE_UUID.to_string(),
        uuid: uuid.to_string(),
    }
}

fn characteristic(uuid: &str, properties: CharacteristicProperties) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic {
        handle: handle(uuid),
        properties,
    }
}

/// The service with both required characteristics.
pub fn full_profile() -> Vec<DiscoveredService> {
    vec![DiscoveredService {
        uuid: protocol::SERVICE_UUID.to_string(),
        characteristics: vec![
            characteristic(
                protocol::MESSAGE_WRITE_UUID,
                CharacteristicProperties {
                    write: true,
                    ..Default::default()
                },
            ),
            characteristic(
                protocol::NOTIFICATION_UUID,
                CharacteristicProperties {
                    notify: true,
                    ..Default::default()
                },
            ),
        ],
    }]
}

/// The service without the command characteristic.
pub fn notify_only_profile() -> Vec<DiscoveredService> {
    let mut services = full_profile();
    services[0]
        .characteristics
        .retain(|c| c.handle.uuid == protocol::NOTIFICATION_UUID);
    services
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Discover,
    Negotiate(u16),
    Write(CharacteristicHandle, Vec<u8>),
    EnableNotifications(CharacteristicHandle),
    Disconnect,
}

#[derive(Default)]
pub struct MockConnector {
    peripherals: Mutex<HashMap<DeviceIdentity, MockPeripheral>>,
    links: Mutex<HashMap<DeviceIdentity, Arc<MockLink>>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, device: &str, peripheral: MockPeripheral) {
        self.peripherals
            .lock()
            .unwrap()
            .insert(DeviceIdentity::new(device), peripheral);
    }

    /// The most recent link opened to `device`.
    pub fn link(&self, device: &str) -> Option<Arc<MockLink>> {
        self.links
            .lock()
            .unwrap()
            .get(&DeviceIdentity::new(device))
            .cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattConnector for MockConnector {
    async fn connect(
        &self,
        device: &DeviceIdentity,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn GattLink>, TransportError> {
        assert!(options.auto_reconnect);
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .peripherals
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .ok_or(TransportError::NotConnected)?;

        if script.connect_hangs {
            std::future::pending::<()>().await;
        }
        if let Some(e) = script.connect_error.clone() {
            return Err(e);
        }

        let link = Arc::new(MockLink {
            script,
            events,
            connected: AtomicBool::new(true),
            failing_writes: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        });
        self.links
            .lock()
            .unwrap()
            .insert(device.clone(), link.clone());
        Ok(link)
    }
}

pub struct MockLink {
    script: MockPeripheral,
    events: mpsc::UnboundedSender<LinkEvent>,
    connected: AtomicBool,
    failing_writes: AtomicBool,
    calls: Mutex<Vec<MockCall>>,
    handler: Mutex<Option<ValueHandler>>,
}

impl MockLink {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Write(_, value) => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn was_disconnected(&self) -> bool {
        self.calls().contains(&MockCall::Disconnect)
    }

    /// Deliver a value on the notification characteristic.
    pub fn notify(&self, value: &[u8]) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(value);
        }
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Simulate the radio link dropping without an explicit close.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every later write fail with a GATT status.
    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError> {
        self.record(MockCall::Discover);
        Ok(self.script.services.clone())
    }

    async fn negotiate_payload_size(&self, mtu: u16) -> Result<usize, TransportError> {
        self.record(MockCall::Negotiate(mtu));
        match self.script.negotiate_error.clone() {
            Some(e) => Err(e),
            None => Ok(self.script.payload_size),
        }
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        _write_type: WriteType,
    ) -> Result<(), TransportError> {
        self.record(MockCall::Write(characteristic.clone(), value.to_vec()));
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Status { status: 3 });
        }
        match self.script.write_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn enable_notifications(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), TransportError> {
        self.record(MockCall::EnableNotifications(characteristic.clone()));
        if let Some(gate) = &self.script.subscribe_gate {
            gate.notified().await;
        }
        match self.script.subscribe_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_notification_handler(
        &self,
        _characteristic: &CharacteristicHandle,
        handler: ValueHandler,
    ) -> Result<(), TransportError> {
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.record(MockCall::Disconnect);
        if let Some(delay) = self.script.disconnect_delay {
            tokio::time::sleep(delay).await;
        }
    }
}
