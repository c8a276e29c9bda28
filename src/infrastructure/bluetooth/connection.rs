//! Session Connection Settings
//!
//! The service profile a peripheral must expose and the tunables that bound
//! each connection phase.

use crate::domain::settings::BleSettings;
use crate::infrastructure::bluetooth::error::DiscoveryError;
use crate::infrastructure::bluetooth::protocol::{self, uuid_eq};
use crate::infrastructure::bluetooth::transport::{CharacteristicHandle, DiscoveredService};
use std::time::Duration;
use tracing::info;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service UUID to look for
    pub service_uuid: String,
    /// Command characteristic UUID (must support write)
    pub command_char_uuid: String,
    /// Notification characteristic UUID (must support notify)
    pub notification_char_uuid: String,
    /// ATT MTU requested during initialization
    pub requested_mtu: u16,
    /// Origin id stamped on the clock sync
    pub origin: u32,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    pub init_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID.to_string(),
            command_char_uuid: protocol::MESSAGE_WRITE_UUID.to_string(),
            notification_char_uuid: protocol::NOTIFICATION_UUID.to_string(),
            requested_mtu: protocol::REQUESTED_MTU,
            origin: protocol::HOST_ORIGIN,
            connect_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&BleSettings> for ConnectionConfig {
    fn from(s: &BleSettings) -> Self {
        Self {
            service_uuid: s.service_uuid.clone(),
            command_char_uuid: s.command_char_uuid.clone(),
            notification_char_uuid: s.notification_char_uuid.clone(),
            requested_mtu: s.requested_mtu,
            origin: s.origin,
            connect_timeout: s.connect_timeout(),
            discovery_timeout: s.discovery_timeout(),
            init_timeout: s.init_timeout(),
        }
    }
}

/// Both characteristics of the profile, validated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCharacteristics {
    pub command: CharacteristicHandle,
    pub notification: CharacteristicHandle,
}

impl ConnectionConfig {
    /// Find the profile's characteristics and check their property bits.
    pub fn resolve_characteristics(
        &self,
        services: &[DiscoveredService],
    ) -> Result<ResolvedCharacteristics, DiscoveryError> {
        let service = services
            .iter()
            .find(|s| uuid_eq(&s.uuid, &self.service_uuid))
            .ok_or_else(|| DiscoveryError::ServiceMissing(self.service_uuid.clone()))?;
        info!(
            "Found service with {} characteristics",
            service.characteristics.len()
        );

        let find = |uuid: &str| {
            service
                .characteristics
                .iter()
                .find(|c| uuid_eq(&c.handle.uuid, uuid))
                .ok_or_else(|| DiscoveryError::CharacteristicMissing(uuid.to_string()))
        };

        let command = find(&self.command_char_uuid)?;
        if !command.properties.write {
            return Err(DiscoveryError::MissingProperty {
                uuid: self.command_char_uuid.clone(),
                property: "write",
            });
        }

        let notification = find(&self.notification_char_uuid)?;
        if !notification.properties.notify {
            return Err(DiscoveryError::MissingProperty {
                uuid: self.notification_char_uuid.clone(),
                property: "notify",
            });
        }

        Ok(ResolvedCharacteristics {
            command: command.handle.clone(),
            notification: notification.handle.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::transport::{
        CharacteristicProperties, DiscoveredCharacteristic,
    };

    fn characteristic(uuid: &str, write: bool, notify: bool) -> DiscoveredCharacteristic {
        DiscoveredCharacteristic {
            handle: CharacteristicHandle {
                service_uuid: protocol::SERVICE_UUID.into(),
                uuid: uuid.into(),
            },
            properties: CharacteristicProperties {
                write,
                notify,
                ..Default::default()
            },
        }
    }

    fn service(characteristics: Vec<DiscoveredCharacteristic>) -> Vec<DiscoveredService> {
        vec![DiscoveredService {
            uuid: protocol::SERVICE_UUID.to_uppercase(),
            characteristics,
        }]
    }

    #[test]
    fn test_resolves_both_characteristics() {
        let config = ConnectionConfig::default();
        let resolved = config
            .resolve_characteristics(&service(vec![
                characteristic(protocol::NOTIFICATION_UUID, false, true),
                characteristic(protocol::MESSAGE_WRITE_UUID, true, false),
            ]))
            .unwrap();
        assert_eq!(resolved.command.uuid, protocol::MESSAGE_WRITE_UUID);
        assert_eq!(resolved.notification.uuid, protocol::NOTIFICATION_UUID);
    }

    #[test]
    fn test_missing_service() {
        let config = ConnectionConfig::default();
        assert_eq!(
            config.resolve_characteristics(&[]),
            Err(DiscoveryError::ServiceMissing(protocol::SERVICE_UUID.into()))
        );
    }

    #[test]
    fn test_missing_write_characteristic() {
        let config = ConnectionConfig::default();
        let result = config.resolve_characteristics(&service(vec![characteristic(
            protocol::NOTIFICATION_UUID,
            false,
            true,
        )]));
        assert_eq!(
            result,
            Err(DiscoveryError::CharacteristicMissing(
                protocol::MESSAGE_WRITE_UUID.into()
            ))
        );
    }

    #[test]
    fn test_missing_property_bits() {
        let config = ConnectionConfig::default();
        let result = config.resolve_characteristics(&service(vec![
            characteristic(protocol::MESSAGE_WRITE_UUID, true, false),
            characteristic(protocol::NOTIFICATION_UUID, true, false),
        ]));
        assert!(matches!(
            result,
            Err(DiscoveryError::MissingProperty {
                property: "notify",
                ..
            })
        ));
    }
}
