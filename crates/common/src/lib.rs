//! Common utilities for dmxd
//!
//! This crate provides the pieces shared between the daemon and its plugins:
//! the DMX frame container, the host/plugin interfaces, error handling,
//! logging setup and test fakes for the host side.

pub mod dmx;
pub mod error;
pub mod host;
pub mod logging;
pub mod test_utils;

pub use dmx::{DMX_UNIVERSE_SIZE, DmxBuffer};
pub use error::{Error, Result};
pub use host::{
    Device, Interest, Plugin, PluginAdaptor, PluginConstructor, PluginHandle, PluginRegistration,
    PortDirection, PortInfo, ReadableTarget, TimerId, destroy,
};
pub use logging::setup_logging;
