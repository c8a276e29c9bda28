use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::pins::{Pin, PinOperation};

/// Stable identifier of a bonded peripheral (its hardware address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Format a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`.
    pub fn from_address(address: u64) -> Self {
        let bytes = address.to_be_bytes();
        let text = bytes[2..]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self(text)
    }

    /// Parse the identity back into a 48-bit address, if it is one.
    pub fn to_address(&self) -> Option<u64> {
        let hex: String = self.0.split(':').collect();
        if hex.len() != 12 {
            return None;
        }
        u64::from_str_radix(&hex, 16).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a per-device GATT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Discovering,
    Initializing,
    Ready,
    /// Discovery or initialization failed; no automatic retry.
    Failed,
    Disconnected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Events from the OS Bluetooth adapter and its bond list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    Enabled,
    Disabled,
    Bonded(DeviceIdentity),
    Unbonded(DeviceIdentity),
}

/// Payload of a host-to-peripheral command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CommandPayload {
    ClockSync { epoch_seconds: i64, nanos: i32 },
    SetPin { pin: Pin, operation: PinOperation },
}

/// A command message addressed to every ready peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutgoingCommand {
    origin: u32,
    payload: CommandPayload,
}

impl OutgoingCommand {
    /// Clock sync carrying `time` as seconds and nanos since the Unix epoch.
    /// Times before the epoch are normalised so that `nanos` stays positive.
    pub fn clock_sync(origin: u32, time: std::time::SystemTime) -> Self {
        let (epoch_seconds, nanos) = match time.duration_since(std::time::UNIX_EPOCH) {
            Ok(since) => (since.as_secs() as i64, since.subsec_nanos() as i32),
            Err(before) => {
                let before = before.duration();
                let mut seconds = -(before.as_secs() as i64);
                let mut nanos = before.subsec_nanos() as i32;
                if nanos > 0 {
                    seconds -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                (seconds, nanos)
            }
        };
        Self {
            origin,
            payload: CommandPayload::ClockSync {
                epoch_seconds,
                nanos,
            },
        }
    }

    pub fn set_pin(origin: u32, pin: Pin, operation: PinOperation) -> Self {
        Self {
            origin,
            payload: CommandPayload::SetPin { pin, operation },
        }
    }

    pub fn origin(&self) -> u32 {
        self.origin
    }

    pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }
}

/// Payload of a peripheral-to-host notification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NotificationPayload {
    PinReading { pin: Pin, value: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncomingNotification {
    pub origin: u32,
    pub payload: NotificationPayload,
}

/// A decoded notification together with the device that emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedNotification {
    pub device: DeviceIdentity,
    pub notification: IncomingNotification,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_address_formatting() {
        let id = DeviceIdentity::from_address(0xA4C1_3801_02FF);
        assert_eq!(id.as_str(), "A4:C1:38:01:02:FF");
        assert_eq!(id.to_address(), Some(0xA4C1_3801_02FF));
        assert_eq!(DeviceIdentity::new("not-an-address").to_address(), None);
    }

    #[test]
    fn test_clock_sync_splits_seconds_and_nanos() {
        let time = UNIX_EPOCH + Duration::new(1_700_000_000, 250);
        let cmd = OutgoingCommand::clock_sync(7, time);
        assert_eq!(cmd.origin(), 7);
        assert_eq!(
            *cmd.payload(),
            CommandPayload::ClockSync {
                epoch_seconds: 1_700_000_000,
                nanos: 250
            }
        );
    }

    #[test]
    fn test_clock_sync_before_epoch() {
        let time = UNIX_EPOCH - Duration::new(1, 500_000_000);
        let cmd = OutgoingCommand::clock_sync(7, time);
        assert_eq!(
            *cmd.payload(),
            CommandPayload::ClockSync {
                epoch_seconds: -2,
                nanos: 500_000_000
            }
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Disconnected.is_terminal());
        assert!(!SessionState::Ready.is_terminal());
    }
}
