//! Boundary to the platform GATT client.
//!
//! The session engine only talks to peripherals through these traits; the
//! platform adapter (WinRT on Windows) and the test transport implement them.

use crate::domain::models::DeviceIdentity;
use crate::infrastructure::bluetooth::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opaque reference to a characteristic resolved during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service_uuid: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub handle: CharacteristicHandle,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: String,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Link-level signals reported by the transport after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Remote services changed or went away; handles must be re-resolved.
    ServicesInvalidated,
    /// The link is gone for good.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Let the transport re-establish the link on its own after drops.
    pub auto_reconnect: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
        }
    }
}

/// Invoked with every value received on a subscribed characteristic.
pub type ValueHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[async_trait]
pub trait GattConnector: Send + Sync {
    /// Open a link to `device`. Link events are reported on `events` for as
    /// long as the link lives.
    async fn connect(
        &self,
        device: &DeviceIdentity,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn GattLink>, TransportError>;
}

/// An established connection to one peripheral. Exclusively owned by its session.
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError>;

    /// Request an ATT MTU; returns the usable payload size per write.
    async fn negotiate_payload_size(&self, mtu: u16) -> Result<usize, TransportError>;

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    /// Write the client configuration descriptor to enable notifications.
    async fn enable_notifications(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), TransportError>;

    /// Route values received on `characteristic` to `handler`, replacing any
    /// previous handler. Takes effect immediately.
    fn set_notification_handler(
        &self,
        characteristic: &CharacteristicHandle,
        handler: ValueHandler,
    ) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Release the connection. Idempotent.
    async fn disconnect(&self);
}
