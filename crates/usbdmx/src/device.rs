//! Host device fronting a widget

use crate::widget::{Widget, lock};
use common::{Device, DmxBuffer, Error, PortDirection, PortInfo, Result};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A widget published to the host as a device with one output port
pub struct UsbDmxDevice {
    id: String,
    name: String,
    widget: Arc<Widget>,
    universe: Mutex<Option<u8>>,
}

impl UsbDmxDevice {
    pub fn new(widget: Arc<Widget>) -> Self {
        let id = format!("usbdmx-{}-{}", widget.kind(), widget.serial());
        let name = format!("{} ({})", widget.kind().display_name(), widget.serial());
        Self {
            id,
            name,
            widget,
            universe: Mutex::new(None),
        }
    }

    pub fn widget(&self) -> &Arc<Widget> {
        &self.widget
    }
}

impl Device for UsbDmxDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<PortInfo> {
        vec![PortInfo {
            index: 0,
            direction: PortDirection::Output,
            universe: *lock(&self.universe),
            description: format!("Serial #: {}", self.widget.serial()),
        }]
    }

    fn patch(&self, direction: PortDirection, port: u8, universe: Option<u8>) -> Result<()> {
        if direction != PortDirection::Output || port != 0 {
            return Err(Error::NoSuchPort(port));
        }
        debug!("Patched {} port 0 to universe {:?}", self.id, universe);
        *lock(&self.universe) = universe;
        Ok(())
    }

    fn write_dmx(&self, port: u8, buffer: &DmxBuffer) -> Result<()> {
        if port != 0 {
            return Err(Error::NoSuchPort(port));
        }
        if self.widget.send_dmx(buffer) {
            Ok(())
        } else {
            Err(Error::Other(format!("widget {} is not running", self.id)))
        }
    }
}
