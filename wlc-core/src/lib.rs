#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Charging control logic for a wireless-power receiver.
//
// Everything here is `no_std` and executor-agnostic: hardware sits behind the
// traits in `hal`, time is passed in as a `TelemetryInstant`, and the runtime
// crate supplies scheduling, locking and the authentication wait.

pub mod accessory;
pub mod alarm;
pub mod auth;
pub mod config;
pub mod console;
pub mod controller;
pub mod hal;
pub mod limits;
pub mod modes;
pub mod stage;
pub mod telemetry;
