//! Host interfaces
//!
//! The contract between the daemon and its plugins. The daemon provides a
//! [`PluginAdaptor`] (descriptor readiness, timers, device registry); plugins
//! implement [`Plugin`] and publish [`Device`]s.
//!
//! Plugins are created through a [`PluginRegistration`] table entry rather
//! than dynamic symbol lookup, and torn down with [`destroy`].

use crate::dmx::DmxBuffer;
use crate::error::Result;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Readiness interest for a registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
}

/// Handle for a repeating timer scheduled on the host reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// Receives read-readiness callbacks for registered descriptors
pub trait ReadableTarget: Send + Sync {
    /// Called from the reactor when `fd` is readable. Must not block.
    fn on_readable(&self, fd: RawFd);
}

/// Direction of a device port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "input"),
            PortDirection::Output => write!(f, "output"),
        }
    }
}

/// Snapshot of a port for the host registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub index: u8,
    pub direction: PortDirection,
    /// Universe the port is patched to, if any
    pub universe: Option<u8>,
    pub description: String,
}

/// A device published to the host registry
pub trait Device: Send + Sync {
    /// Stable identifier, unique within the registry
    fn id(&self) -> &str;

    /// Human readable name
    fn name(&self) -> &str;

    /// All ports of the device
    fn ports(&self) -> Vec<PortInfo>;

    /// Assign (or clear) the universe of a port
    fn patch(&self, direction: PortDirection, port: u8, universe: Option<u8>) -> Result<()>;

    /// Send a frame out of an output port
    fn write_dmx(&self, port: u8, buffer: &DmxBuffer) -> Result<()>;

    /// Latest frame received on an input port
    fn read_dmx(&self, _port: u8) -> Option<DmxBuffer> {
        None
    }
}

/// Services the host daemon offers to plugins
pub trait PluginAdaptor: Send + Sync {
    /// Register `fd` for readiness callbacks on `target`
    fn register_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        target: Arc<dyn ReadableTarget>,
    ) -> Result<()>;

    /// Remove a descriptor registration
    ///
    /// Once this returns, no callback for `fd` is running or will run.
    fn unregister_fd(&self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Publish a device
    fn register_device(&self, device: Arc<dyn Device>) -> Result<()>;

    /// Withdraw a device
    fn unregister_device(&self, device_id: &str) -> Result<()>;

    /// Run `callback` every `period` on the reactor
    fn schedule_repeating(&self, period: Duration, callback: Box<dyn FnMut() + Send>) -> TimerId;

    /// Cancel a repeating timer
    ///
    /// Once this returns, the callback is not running and will not run again.
    fn remove_timeout(&self, id: TimerId);
}

/// A plugin instance driven by the host
pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Start the plugin; fails if it is already running
    fn start(&mut self) -> Result<()>;

    /// Stop the plugin; fails if it is not running
    fn stop(&mut self) -> Result<()>;

    fn is_enabled(&self) -> bool;
}

/// Owned plugin instance as handed to the host
pub type PluginHandle = Box<dyn Plugin>;

/// Constructor stored in a registration table
pub type PluginConstructor = Box<dyn Fn(Arc<dyn PluginAdaptor>) -> PluginHandle + Send + Sync>;

/// One entry of the host's plugin table
pub struct PluginRegistration {
    pub name: &'static str,
    create: PluginConstructor,
}

impl PluginRegistration {
    pub fn new(name: &'static str, create: PluginConstructor) -> Self {
        Self { name, create }
    }

    /// Instantiate the plugin against a host adaptor
    pub fn create(&self, adaptor: Arc<dyn PluginAdaptor>) -> PluginHandle {
        debug!("Creating plugin {}", self.name);
        (self.create)(adaptor)
    }
}

impl fmt::Debug for PluginRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Tear down a plugin, stopping it first if it is still running
pub fn destroy(mut plugin: PluginHandle) {
    if plugin.is_enabled()
        && let Err(e) = plugin.stop()
    {
        warn!("Failed to stop plugin {} during destroy: {}", plugin.name(), e);
    }
    debug!("Destroyed plugin {}", plugin.name());
}
