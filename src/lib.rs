#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The messages clients send, the lines the device receives,
/// and the envelopes clients get back.
pub mod actions;

/// The command line interface.
pub mod cli;

/// Configuration of the bridge.
pub mod config;

pub mod detect;

/// Possible errors in this library.
pub mod error;

/// Logging setup.
pub mod logging;

pub mod mock;

/// Moving device lines to clients.
pub mod pump;

/// Keeping track of connected clients.
pub mod registry;

/// Moving client messages to the device.
pub mod router;

/// Everything related to the serial side of the bridge.
pub mod serial;

pub(crate) mod server;

pub mod supervisor;

pub(crate) mod websocket;
