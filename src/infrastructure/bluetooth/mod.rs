//! Bluetooth Module
//!
//! Per-device GATT sessions for the smartwatch peripherals.
//!
//! ## Architecture
//!
//! ```text
//! adapter / bond events          OutgoingCommand ingress
//!          │                              │
//!          ▼                              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ add / remove / broadcast
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionRegistry                       │
//! │           DeviceIdentity ──► SessionHandle               │
//! └──────┬──────────────────┬──────────────────┬────────────┘
//!        ▼                  ▼                  ▼
//! ┌────────────┐     ┌────────────┐     ┌────────────┐
//! │ GattSession│     │ GattSession│     │ GattSession│   one task each
//! │  + queue   │     │  + queue   │     │  + queue   │
//! └─────┬──────┘     └─────┬──────┘     └─────┬──────┘
//!       │ decoded notifications               │
//!       └──────────────────┬──────────────────┘
//!                          ▼
//!              NotificationSender ──► consumer
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, wire schema and the frame codec
//! - [`transport`] - the link primitives a platform must provide
//! - [`queue`] - ordered, all-or-abort operation batches
//! - [`connection`] - profile validation and session tunables
//! - [`session`] - the per-device state machine
//! - [`registry`] - identity → session map and broadcast
//! - [`notifications`] - fan-out channel to the single consumer
//! - [`service`] - main service coordinator
//! - `winrt` - Windows transport and adapter monitor

pub mod connection;
pub mod error;
pub mod notifications;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod service;
pub mod session;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main service for convenience
pub use registry::SessionRegistry;
pub use service::{AdapterMonitor, BluetoothService};
