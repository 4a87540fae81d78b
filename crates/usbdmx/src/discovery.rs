//! Device discovery
//!
//! USB offers no hotplug notification on every platform, so discovery is a
//! periodic full scan diffed against the slots we already hold a widget
//! for.

use crate::error::Result;
use crate::factory::{WidgetFactory, WidgetObserver};
use crate::transport::{BusAddress, DeviceDescriptor, UsbContextAdaptor};
use crate::widget::WidgetKind;
use std::collections::HashSet;
use tracing::{debug, info, trace};

/// Outcome of one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Devices present on the bus
    pub found: usize,
    /// Widgets created and accepted
    pub added: usize,
    /// Known slots that disappeared
    pub removed: usize,
}

#[derive(Default)]
pub struct DeviceDiscovery {
    factories: Vec<Box<dyn WidgetFactory>>,
    seen: HashSet<BusAddress>,
}

impl DeviceDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factories are tried in the order they were added
    pub fn add_factory(&mut self, factory: Box<dyn WidgetFactory>) {
        debug!("Added widget factory {}", factory.name());
        self.factories.push(factory);
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    pub fn is_known(&self, slot: BusAddress) -> bool {
        self.seen.contains(&slot)
    }

    /// Forget a slot so its device is offered to the factories again
    pub fn forget(&mut self, slot: BusAddress) -> bool {
        self.seen.remove(&slot)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    /// Run one discovery pass
    pub fn scan(
        &mut self,
        context: &dyn UsbContextAdaptor,
        observer: &mut dyn WidgetObserver,
    ) -> Result<ScanSummary> {
        let devices = context.devices()?;
        let mut summary = ScanSummary {
            found: devices.len(),
            ..ScanSummary::default()
        };
        let mut present = HashSet::with_capacity(devices.len());

        for device in devices {
            let slot = device.bus_address();
            present.insert(slot);

            if self.seen.contains(&slot) {
                continue;
            }

            let descriptor = match device.descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    trace!("Skipping device at {}: {}", slot, e);
                    continue;
                }
            };

            for factory in self.factories.iter_mut() {
                if !factory.matches(&descriptor) {
                    continue;
                }
                debug!(
                    "Device {:04x}:{:04x} at {} matches {}",
                    descriptor.vendor_id,
                    descriptor.product_id,
                    slot,
                    factory.name()
                );
                if factory.create(observer, device.clone(), &descriptor) {
                    self.seen.insert(slot);
                    summary.added += 1;
                    break;
                }
            }
        }

        let gone: Vec<BusAddress> = self
            .seen
            .iter()
            .filter(|slot| !present.contains(slot))
            .copied()
            .collect();
        for slot in gone {
            info!("USB device at {} was removed", slot);
            self.seen.remove(&slot);
            observer.widget_removed(slot);
            summary.removed += 1;
        }

        if summary.added > 0 || summary.removed > 0 {
            info!(
                "USB scan: {} devices, {} widgets added, {} removed",
                summary.found, summary.added, summary.removed
            );
        } else {
            trace!("USB scan: {} devices, no changes", summary.found);
        }

        Ok(summary)
    }
}

/// One enumerated device and the model it matches, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub slot: BusAddress,
    pub descriptor: DeviceDescriptor,
    pub kind: Option<WidgetKind>,
}

/// List every device on the bus without opening any of them
pub fn survey(context: &dyn UsbContextAdaptor) -> Result<Vec<DeviceListing>> {
    let mut listings: Vec<DeviceListing> = context
        .devices()?
        .into_iter()
        .filter_map(|device| {
            let descriptor = device.descriptor().ok()?;
            Some(DeviceListing {
                slot: device.bus_address(),
                descriptor,
                kind: WidgetKind::identify(&descriptor),
            })
        })
        .collect();
    listings.sort_by_key(|listing| listing.slot);
    Ok(listings)
}
