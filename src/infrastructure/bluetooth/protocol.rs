//! Smartwatch Sync Protocol
//!
//! Profile UUIDs and the binary frames exchanged with the peripheral firmware.
//!
//! Frames are proto3 messages. The layout is owned by the firmware and must
//! stay byte-compatible:
//!
//! ```text
//! Message       { uint32 origin = 1; oneof payload { SyncClock sync_clock = 2; SetPin set_pin = 3; } }
//! SyncClock     { google.protobuf.Timestamp timestamp = 1; }
//! SetPin        { Pins pin = 1; PinOperation op = 2; }
//! Notification  { uint32 origin = 1; oneof payload { PinRead pin_read = 2; } }
//! PinRead       { Pins pin = 1; float value = 2; }
//! ```

use crate::domain::models::{
    CommandPayload, IncomingNotification, NotificationPayload, OutgoingCommand,
};
use crate::domain::pins::Pin;
use crate::infrastructure::bluetooth::error::DecodeError;
use prost::Message as _;
use tracing::trace;

/// Primary service exposed by the peripheral
pub const SERVICE_UUID: &str = "98200001-2160-4474-82b4-1a25cef92156";

/// Command characteristic UUID - where host messages are written
pub const MESSAGE_WRITE_UUID: &str = "98200002-2160-4474-82b4-1a25cef92156";

/// Notification characteristic UUID - where readings are received
pub const NOTIFICATION_UUID: &str = "98200003-2160-4474-82b4-1a25cef92156";

/// Origin id the host stamps on every message
pub const HOST_ORIGIN: u32 = 3_387_062;

/// ATT MTU requested during initialization
pub const REQUESTED_MTU: u16 = 517;

/// Usable payload before any MTU negotiation (default ATT MTU 23 minus header)
///
/// A clock sync carrying a present-day timestamp encodes to 21 bytes whenever
/// its nanoseconds need a five-byte varint, so a peripheral that stays at this
/// size can fail initialization. Writes are never split across several ATT
/// requests.
pub const DEFAULT_PAYLOAD_SIZE: usize = 20;

/// Wire representations generated by hand from the firmware schema.
pub mod wire {
    use crate::domain::pins::{Pin, PinOperation};

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Message {
        #[prost(uint32, tag = "1")]
        pub origin: u32,
        #[prost(oneof = "message::Payload", tags = "2, 3")]
        pub payload: Option<message::Payload>,
    }

    pub mod message {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "2")]
            SyncClock(super::SyncClock),
            #[prost(message, tag = "3")]
            SetPin(super::SetPin),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SyncClock {
        #[prost(message, optional, tag = "1")]
        pub timestamp: Option<::prost_types::Timestamp>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SetPin {
        #[prost(enumeration = "Pin", tag = "1")]
        pub pin: i32,
        #[prost(enumeration = "PinOperation", tag = "2")]
        pub op: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Notification {
        #[prost(uint32, tag = "1")]
        pub origin: u32,
        #[prost(oneof = "notification::Payload", tags = "2")]
        pub payload: Option<notification::Payload>,
    }

    pub mod notification {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "2")]
            PinRead(super::PinRead),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PinRead {
        #[prost(enumeration = "Pin", tag = "1")]
        pub pin: i32,
        #[prost(float, tag = "2")]
        pub value: f32,
    }
}

/// Encode a host command into a frame for the command characteristic.
pub fn encode(command: &OutgoingCommand) -> Vec<u8> {
    let payload = match *command.payload() {
        CommandPayload::ClockSync {
            epoch_seconds,
            nanos,
        } => wire::message::Payload::SyncClock(wire::SyncClock {
            timestamp: Some(prost_types::Timestamp {
                seconds: epoch_seconds,
                nanos,
            }),
        }),
        CommandPayload::SetPin { pin, operation } => {
            wire::message::Payload::SetPin(wire::SetPin {
                pin: pin.into(),
                op: operation.into(),
            })
        }
    };

    wire::Message {
        origin: command.origin(),
        payload: Some(payload),
    }
    .encode_to_vec()
}

/// Decode a frame received on the notification characteristic.
pub fn decode(bytes: &[u8]) -> Result<IncomingNotification, DecodeError> {
    #[cfg(debug_assertions)]
    trace!("Raw notification: {:02X?}", bytes);

    let frame = wire::Notification::decode(bytes)?;
    let payload = match frame.payload {
        Some(wire::notification::Payload::PinRead(read)) => NotificationPayload::PinReading {
            pin: Pin::try_from(read.pin).map_err(|_| DecodeError::UnknownPin(read.pin))?,
            value: read.value,
        },
        None => return Err(DecodeError::UnrecognizedPayload),
    };

    Ok(IncomingNotification {
        origin: frame.origin,
        payload,
    })
}

/// Encode a notification the way the firmware does.
#[cfg(test)]
pub(crate) fn encode_notification(notification: &IncomingNotification) -> Vec<u8> {
    let payload = match notification.payload {
        NotificationPayload::PinReading { pin, value } => {
            wire::notification::Payload::PinRead(wire::PinRead {
                pin: pin.into(),
                value,
            })
        }
    };

    wire::Notification {
        origin: notification.origin,
        payload: Some(payload),
    }
    .encode_to_vec()
}

/// Compare two UUID strings ignoring case and surrounding braces.
pub fn uuid_eq(a: &str, b: &str) -> bool {
    let normalize = |s: &str| s.trim_matches(|c| c == '{' || c == '}').to_ascii_lowercase();
    normalize(a) == normalize(b)
}
