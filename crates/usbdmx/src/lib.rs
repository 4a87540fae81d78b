//! USB DMX widget support
//!
//! Discovers supported USB DMX widgets by periodically scanning the bus,
//! publishes each one to the host as a device with a single output port,
//! and moves DMX frames to the hardware either from a worker thread per
//! widget or through asynchronous libusb transfers.
//!
//! Layers, bottom up:
//! - [`transport`]: USB access behind small traits (libusb in production)
//! - [`widget`]: one attached interface and its sender
//! - [`factory`] and [`discovery`]: matching devices to models and diffing
//!   scans
//! - [`plugin`]: the host-facing lifecycle

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod plugin;
pub mod test_utils;
pub mod transport;
pub mod widget;

pub use config::UsbDmxConfig;
pub use device::UsbDmxDevice;
pub use discovery::{DeviceDiscovery, DeviceListing, ScanSummary, survey};
pub use error::{OpenError, Result, TransferError, UsbDmxError};
pub use factory::{ModelFactory, WidgetFactory, WidgetObserver};
pub use plugin::{PLUGIN_NAME, PluginState, UsbDmxPlugin, registration};
pub use transport::{BusAddress, LibUsbSubsystem, UsbSubsystem};
pub use widget::{
    TransferMode, Widget, WidgetEvent, WidgetIdentity, WidgetKind, WidgetSettings, WidgetState,
};
