//! Host-testable core of mouthpad-usb.
//!
//! Everything that decides *what* the bridge does lives here: frame codec,
//! report translation, the BLE connection state machine, the bond table and
//! the USB-side plumbing.  None of it touches hardware, so the whole crate
//! builds and tests on the host.
//!
//! Usage: `cargo test --lib` (unit tests) or `cargo test` (plus tests/).
//!
//! Note: The embedded binary uses main.rs with #![no_std] and #![no_main]
//! and wires these modules to the SoftDevice, Embassy USB and flash.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

// ═══════════════════════════════════════════════════════════════════════════
// Shared definitions
// ═══════════════════════════════════════════════════════════════════════════

pub mod config;
pub mod error;

// ═══════════════════════════════════════════════════════════════════════════
// Wire formats
// ═══════════════════════════════════════════════════════════════════════════

pub mod framing;
pub mod hid;
pub mod relay;

// ═══════════════════════════════════════════════════════════════════════════
// BLE central
// ═══════════════════════════════════════════════════════════════════════════

pub mod ble;
pub mod bonds;

// ═══════════════════════════════════════════════════════════════════════════
// USB side
// ═══════════════════════════════════════════════════════════════════════════

pub mod bridge;
pub mod watchdog;

pub use error::Error;
