//! Host-side session engine for BLE pin-controller peripherals.

pub mod domain;
pub mod infrastructure;
pub mod presentation;
