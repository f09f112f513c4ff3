//! espnow-ble-proxy library: portable BLE-to-ESP-NOW relay engine.
//!
//! Listens for BLE sensor advertisements, filters and renames them by MAC
//! address, seals each reading in an authenticated frame and broadcasts it
//! to a single ESP-NOW peer. A heartbeat timer reports liveness over the same
//! path and a watchdog asks the platform to restart the device.
//!
//! Everything here is `no_std` and allocation-free, testable on any host with
//! `cargo test`. The firmware binary (`firmware-std`) is a thin consumer that
//! supplies the radio, the BLE scanner, the vendor payload decoder and a
//! clock.
//!
//! Data path: `scanner` → `listener` (`policy`) → `codec` (`protocol`) →
//! `comm`. `controller` wires these together and owns both timers.

#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod codec;
pub mod comm;
pub mod config;
pub mod controller;
pub mod listener;
pub mod mac;
pub mod policy;
pub mod protocol;
pub mod scanner;

#[cfg(test)]
mod testing;
