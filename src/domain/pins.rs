//! Peripheral pins and the per-pin control board.
//!
//! `Pin` and `PinOperation` double as the wire enumerations of the firmware
//! schema, so their discriminants must not change.

use crate::domain::models::{IncomingNotification, NotificationPayload, OutgoingCommand};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum Pin {
    G26 = 0,
    G25 = 1,
    G0 = 2,
}

impl Pin {
    pub const ALL: [Pin; 3] = [Pin::G26, Pin::G25, Pin::G0];

    pub fn name(self) -> &'static str {
        match self {
            Pin::G26 => "G26",
            Pin::G25 => "G25",
            Pin::G0 => "G0",
        }
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum PinOperation {
    SetLow = 0,
    SetHigh = 1,
    AnalogueRead = 2,
}

impl fmt::Display for PinOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PinOperation::SetLow => "low",
            PinOperation::SetHigh => "high",
            PinOperation::AnalogueRead => "read",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParsePinError {
    #[error("unknown pin '{0}' (expected G26, G25 or G0)")]
    UnknownPin(String),
    #[error("unknown pin operation '{0}' (expected high, low or read)")]
    UnknownOperation(String),
}

impl FromStr for Pin {
    type Err = ParsePinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pin::ALL
            .into_iter()
            .find(|pin| pin.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParsePinError::UnknownPin(s.to_string()))
    }
}

impl FromStr for PinOperation {
    type Err = ParsePinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "setlow" => Ok(PinOperation::SetLow),
            "high" | "sethigh" => Ok(PinOperation::SetHigh),
            "read" | "analogueread" | "analog" => Ok(PinOperation::AnalogueRead),
            _ => Err(ParsePinError::UnknownOperation(s.to_string())),
        }
    }
}

/// Render a pin voltage the way the controls display it.
pub fn format_reading(value: f32) -> String {
    format!("{:.2}v", value)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PinState {
    pub pin: Pin,
    pub mode: PinOperation,
    pub reading: Option<f32>,
}

/// Per-pin modes and last readings behind the pin controls.
#[derive(Debug, Clone)]
pub struct PinBoard {
    origin: u32,
    pins: Vec<PinState>,
}

impl PinBoard {
    pub fn new(origin: u32) -> Self {
        Self {
            origin,
            pins: Pin::ALL
                .into_iter()
                .map(|pin| PinState {
                    pin,
                    mode: PinOperation::SetLow,
                    reading: None,
                })
                .collect(),
        }
    }

    pub fn pins(&self) -> &[PinState] {
        &self.pins
    }

    pub fn mode(&self, pin: Pin) -> PinOperation {
        self.state(pin).map_or(PinOperation::SetLow, |s| s.mode)
    }

    pub fn reading(&self, pin: Pin) -> Option<f32> {
        self.state(pin).and_then(|s| s.reading)
    }

    /// Switch a pin's mode. Output levels are sent straight away; an
    /// analogue read only takes effect on the next [`PinBoard::read_requests`].
    pub fn select(&mut self, pin: Pin, operation: PinOperation) -> Option<OutgoingCommand> {
        let origin = self.origin;
        let state = self.pins.iter_mut().find(|s| s.pin == pin)?;
        state.mode = operation;

        match operation {
            PinOperation::SetHigh | PinOperation::SetLow => {
                Some(OutgoingCommand::set_pin(origin, pin, operation))
            }
            PinOperation::AnalogueRead => None,
        }
    }

    pub fn read_requests(&self) -> Vec<OutgoingCommand> {
        self.pins
            .iter()
            .filter(|s| s.mode == PinOperation::AnalogueRead)
            .map(|s| OutgoingCommand::set_pin(self.origin, s.pin, PinOperation::AnalogueRead))
            .collect()
    }

    /// Store a reading; returns the pin it was for.
    pub fn record(&mut self, notification: &IncomingNotification) -> Option<Pin> {
        match notification.payload {
            NotificationPayload::PinReading { pin, value } => {
                let state = self.pins.iter_mut().find(|s| s.pin == pin)?;
                state.reading = Some(value);
                Some(pin)
            }
        }
    }

    fn state(&self, pin: Pin) -> Option<&PinState> {
        self.pins.iter().find(|s| s.pin == pin)
    }
}
