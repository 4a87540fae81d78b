//! Art-Net plugin lifecycle

use crate::config::ArtNetConfig;
use crate::device::ArtNetDevice;
use common::{Device, Error, Interest, Plugin, PluginAdaptor, PluginRegistration, Result};
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const PLUGIN_NAME: &str = "Art-Net";

const PLUGIN_DESCRIPTION: &str = "\
ArtNet Plugin
----------------------------

This plugin creates a single device with four input and four output ports.
The node binds to the configured address, 0.0.0.0 (all interfaces) unless
set otherwise.

Art-Net has the concept of 'ports' on a device. Each device can support a
maximum of 4 ports in each direction and each port is assigned a universe
address in the range 0-255. When sending data from a port, the data is
addressed to the universe the port is patched to. For example if port 0 is
patched to universe 10, the data will be sent to Art-Net universe 10.

--- Config section: [artnet] ---

enabled = true
bind_address = \"0.0.0.0\"
port = 6454
broadcast_address = \"255.255.255.255\"
destination_port = 6454
short_name = \"dmxd\"
long_name = \"dmxd Art-Net node\"
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Disabled,
    Enabled,
}

pub struct ArtNetPlugin {
    adaptor: Arc<dyn PluginAdaptor>,
    config: ArtNetConfig,
    state: PluginState,
    device: Option<Arc<ArtNetDevice>>,
    fds: Vec<RawFd>,
}

impl ArtNetPlugin {
    pub fn new(adaptor: Arc<dyn PluginAdaptor>, config: ArtNetConfig) -> Self {
        Self {
            adaptor,
            config,
            state: PluginState::Disabled,
            device: None,
            fds: Vec::new(),
        }
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    /// The node, while enabled
    pub fn device(&self) -> Option<&Arc<ArtNetDevice>> {
        self.device.as_ref()
    }

    fn unregister_fds(&mut self) {
        for fd in self.fds.drain(..) {
            if let Err(e) = self.adaptor.unregister_fd(fd, Interest::Read) {
                warn!("Failed to unregister descriptor {}: {}", fd, e);
            }
        }
    }

    /// Bind and publish the node, undoing everything on failure
    fn bring_up(&mut self, device: &Arc<ArtNetDevice>) -> Result<()> {
        device.start()?;

        for fd in device.fds() {
            let registered = self
                .adaptor
                .register_fd(fd, Interest::Read, device.clone());
            if let Err(e) = registered {
                self.unregister_fds();
                let _ = device.stop();
                return Err(e);
            }
            self.fds.push(fd);
        }

        if let Err(e) = self.adaptor.register_device(device.clone()) {
            self.unregister_fds();
            let _ = device.stop();
            return Err(e);
        }
        Ok(())
    }
}

impl Plugin for ArtNetPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn description(&self) -> &str {
        PLUGIN_DESCRIPTION
    }

    fn start(&mut self) -> Result<()> {
        if self.state == PluginState::Enabled {
            return Err(Error::AlreadyRunning);
        }
        self.config.validate()?;

        let device = Arc::new(ArtNetDevice::new(self.config.clone()));
        if let Err(e) = self.bring_up(&device) {
            error!("Failed to start {} plugin: {}", PLUGIN_NAME, e);
            return Err(e);
        }

        self.device = Some(device);
        self.state = PluginState::Enabled;
        info!("{} plugin started", PLUGIN_NAME);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state != PluginState::Enabled {
            return Err(Error::NotRunning);
        }

        self.unregister_fds();

        if let Some(device) = self.device.take() {
            if let Err(e) = device.stop() {
                warn!("Failed to close Art-Net sockets: {}", e);
            }
            if let Err(e) = self.adaptor.unregister_device(device.id()) {
                warn!("Failed to unregister Art-Net device: {}", e);
            }
        }

        self.state = PluginState::Disabled;
        info!("{} plugin stopped", PLUGIN_NAME);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.state == PluginState::Enabled
    }
}

impl Drop for ArtNetPlugin {
    fn drop(&mut self) {
        if self.state == PluginState::Enabled
            && let Err(e) = self.stop()
        {
            warn!("Failed to stop {} plugin on drop: {}", PLUGIN_NAME, e);
        }
    }
}

/// Plugin table entry
pub fn registration(config: ArtNetConfig) -> PluginRegistration {
    PluginRegistration::new(
        PLUGIN_NAME,
        Box::new(move |adaptor| Box::new(ArtNetPlugin::new(adaptor, config.clone()))),
    )
}
