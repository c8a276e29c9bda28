//! Error taxonomy of the GATT session engine.

use std::time::Duration;
use thiserror::Error;

use crate::infrastructure::bluetooth::queue::OperationKind;

/// Failure reported by the underlying transport primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("GATT operation failed with status {status}")]
    Status { status: i32 },
    #[error("device is not connected")]
    NotConnected,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("frame of {size} bytes exceeds the negotiated payload size {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("{0}")]
    Platform(String),
}

/// The peripheral does not expose the required service profile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("service {0} not found")]
    ServiceMissing(String),
    #[error("characteristic {0} not found")]
    CharacteristicMissing(String),
    #[error("characteristic {uuid} lacks the {property} property")]
    MissingProperty {
        uuid: String,
        property: &'static str,
    },
}

/// An incoming notification frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame carries no recognised payload")]
    UnrecognizedPayload,
    #[error("unknown pin value {0}")]
    UnknownPin(i32),
}

impl From<prost::DecodeError> for DecodeError {
    fn from(e: prost::DecodeError) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

/// A queued operation failed; the rest of its batch was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} (step {index}) failed: {error}; {skipped} step(s) skipped")]
pub struct BatchAbort {
    pub index: usize,
    pub operation: OperationKind,
    pub error: TransportError,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    BatchAbort(#[from] BatchAbort),
    #[error("batch cancelled")]
    Cancelled,
}

pub type GattResult<T> = std::result::Result<T, GattError>;
