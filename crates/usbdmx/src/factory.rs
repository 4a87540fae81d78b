//! Widget factories
//!
//! A factory recognises one widget model by its USB IDs and, for a matching
//! device, reads enough of it to build a [`Widget`]. Matching is pure; only
//! `create` talks to the device.

use crate::error::{Result, UsbDmxError};
use crate::transport::{BusAddress, DeviceDescriptor, UsbContextAdaptor, UsbDevice, UsbHandle};
use crate::widget::{ModelSpec, Widget, WidgetEvent, WidgetIdentity, WidgetKind, WidgetSettings};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives widgets from factories and removals from discovery
pub trait WidgetObserver {
    /// Take ownership of a new, not yet initialised widget
    ///
    /// Returns false if the widget was rejected (for example because it
    /// failed to initialise).
    fn new_widget(&mut self, widget: Widget) -> bool;

    /// The device that was in `slot` is gone
    fn widget_removed(&mut self, slot: BusAddress);
}

pub trait WidgetFactory: Send {
    fn name(&self) -> &str;

    /// VID/PID check, no I/O
    fn matches(&self, descriptor: &DeviceDescriptor) -> bool;

    /// Build a widget for `device` and hand it to `observer`
    ///
    /// Returns false on any USB error or if the observer rejected the widget.
    fn create(
        &mut self,
        observer: &mut dyn WidgetObserver,
        device: Arc<dyn UsbDevice>,
        descriptor: &DeviceDescriptor,
    ) -> bool;
}

/// Factory for one of the built-in models
pub struct ModelFactory {
    model: &'static ModelSpec,
    name: String,
    context: Arc<dyn UsbContextAdaptor>,
    settings: WidgetSettings,
    events: async_channel::Sender<WidgetEvent>,
    missing_serial_logged: bool,
}

impl ModelFactory {
    pub fn new(
        kind: WidgetKind,
        context: Arc<dyn UsbContextAdaptor>,
        settings: WidgetSettings,
        events: async_channel::Sender<WidgetEvent>,
    ) -> Self {
        Self {
            model: kind.spec(),
            name: format!("{} factory", kind.display_name()),
            context,
            settings,
            events,
            missing_serial_logged: false,
        }
    }

    pub fn kind(&self) -> WidgetKind {
        self.model.kind
    }

    fn check_string(
        &self,
        handle: &dyn UsbHandle,
        slot: BusAddress,
        what: &str,
        index: Option<u8>,
        expected: &str,
    ) -> bool {
        let Some(index) = index else {
            debug!("Device at {} has no {} string", slot, what);
            return false;
        };

        match handle.read_string(index) {
            Ok(actual) if actual == expected => true,
            Ok(actual) => {
                debug!(
                    "Device at {} has {} {:?}, expected {:?}",
                    slot, what, actual, expected
                );
                false
            }
            Err(e) => {
                warn!("Failed to read {} string of device at {}: {}", what, slot, e);
                false
            }
        }
    }

    /// The device's serial number, or `IdentityUnavailable` when it has
    /// none or the string cannot be read
    fn read_serial(
        &self,
        handle: &dyn UsbHandle,
        slot: BusAddress,
        descriptor: &DeviceDescriptor,
    ) -> Result<String> {
        let index = descriptor
            .serial_number_index
            .ok_or(UsbDmxError::IdentityUnavailable(slot))?;
        match handle.read_string(index) {
            Ok(serial) if !serial.trim().is_empty() => Ok(serial.trim().to_string()),
            Ok(_) => Err(UsbDmxError::IdentityUnavailable(slot)),
            Err(e) => {
                debug!("Serial number read failed: {}", e);
                Err(UsbDmxError::IdentityUnavailable(slot))
            }
        }
    }

    fn placeholder_identity(
        &mut self,
        slot: BusAddress,
        descriptor: &DeviceDescriptor,
    ) -> WidgetIdentity {
        if !self.missing_serial_logged {
            warn!(
                "{} at {} has no serial number; using a per-slot placeholder. \
                 Identities of serial-less devices change when they are re-plugged.",
                self.model.kind.display_name(),
                slot
            );
            self.missing_serial_logged = true;
        }
        WidgetIdentity {
            vendor_id: descriptor.vendor_id,
            product_id: descriptor.product_id,
            serial: placeholder_serial(slot),
            serial_synthesized: true,
        }
    }
}

/// Placeholder serial for a device that does not report one
pub fn placeholder_serial(slot: BusAddress) -> String {
    format!("NO-SERIAL-{:03}-{:03}", slot.bus, slot.address)
}

impl WidgetFactory for ModelFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.model.kind.matches(descriptor)
    }

    fn create(
        &mut self,
        observer: &mut dyn WidgetObserver,
        device: Arc<dyn UsbDevice>,
        descriptor: &DeviceDescriptor,
    ) -> bool {
        let slot = device.bus_address();

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "Failed to open {} at {}: {}",
                    self.model.kind.display_name(),
                    slot,
                    e
                );
                return false;
            }
        };

        if let Some(expected) = self.model.manufacturer
            && !self.check_string(
                handle.as_ref(),
                slot,
                "manufacturer",
                descriptor.manufacturer_index,
                expected,
            )
        {
            return false;
        }
        if let Some(expected) = self.model.product
            && !self.check_string(
                handle.as_ref(),
                slot,
                "product",
                descriptor.product_index,
                expected,
            )
        {
            return false;
        }

        let serial = self.read_serial(handle.as_ref(), slot, descriptor);
        drop(handle);

        let identity = match serial {
            Ok(serial) => WidgetIdentity {
                vendor_id: descriptor.vendor_id,
                product_id: descriptor.product_id,
                serial,
                serial_synthesized: false,
            },
            Err(UsbDmxError::IdentityUnavailable(slot)) => {
                self.placeholder_identity(slot, descriptor)
            }
            Err(e) => {
                warn!("Failed to identify device at {}: {}", slot, e);
                return false;
            }
        };

        info!(
            "Found {} at {}: {}",
            self.model.kind.display_name(),
            slot,
            identity
        );

        let widget = Widget::new(
            self.model.kind,
            identity,
            device,
            self.context.clone(),
            self.settings,
            self.events.clone(),
        );
        observer.new_widget(widget)
    }
}
