//! USB transport adaptor
//!
//! A thin layer over the raw USB primitives the widgets need: enumeration,
//! descriptors, open/claim/release, and transfers in blocking and
//! asynchronous form.
//!
//! Asynchronous completions are only delivered while somebody pumps
//! [`UsbContextAdaptor::handle_events`]; the adaptor never starts a thread of
//! its own.
//!
//! The production implementation lives in [`libusb`]; tests use the fakes in
//! [`crate::test_utils`].

pub mod async_transfer;
pub mod libusb;

use crate::error::{OpenError, Result, TransferError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use libusb::LibUsbSubsystem;

/// Transient (bus, address) key of an attached device
///
/// Not stable across re-plugging; only used to recognise a slot that still
/// holds a device we already know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddress {
    pub bus: u8,
    pub address: u8,
}

impl BusAddress {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// The parts of a USB device descriptor used for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer_index: Option<u8>,
    pub product_index: Option<u8>,
    pub serial_number_index: Option<u8>,
}

/// One outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Vendor request on endpoint 0
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    },
    Bulk {
        endpoint: u8,
        data: Vec<u8>,
    },
    Interrupt {
        endpoint: u8,
        data: Vec<u8>,
    },
}

impl WireFrame {
    /// Payload bytes (excluding any control setup packet)
    pub fn data(&self) -> &[u8] {
        match self {
            WireFrame::Control { data, .. }
            | WireFrame::Bulk { data, .. }
            | WireFrame::Interrupt { data, .. } => data,
        }
    }
}

/// Called from the pump context when an asynchronous transfer finishes
pub type CompletionCallback = Arc<dyn Fn(std::result::Result<(), TransferError>) + Send + Sync>;

/// A reusable asynchronous transfer slot
///
/// At most one submission is in flight at a time. Every successful
/// `submit` produces exactly one completion callback, including after
/// `cancel` (with [`TransferError::Cancelled`]).
pub trait AsyncTransfer: Send {
    /// Queue `frame`; returns as soon as the transfer is submitted
    fn submit(&mut self, frame: &WireFrame) -> std::result::Result<(), TransferError>;

    /// Request cancellation of the in-flight submission, if any
    fn cancel(&self) -> std::result::Result<(), TransferError>;
}

/// An opened device
///
/// Dropping the handle releases any claimed interfaces and closes the device.
pub trait UsbHandle: Send {
    fn read_string(&self, index: u8) -> std::result::Result<String, TransferError>;

    fn claim_interface(&mut self, interface: u8) -> std::result::Result<(), OpenError>;

    fn release_interface(&mut self, interface: u8);

    /// Blocking transfer; returns once the device accepted the frame or
    /// `timeout` elapsed
    fn transmit(&self, frame: &WireFrame, timeout: Duration)
    -> std::result::Result<(), TransferError>;

    /// Allocate an asynchronous transfer bound to this handle
    fn async_transfer(
        &self,
        timeout: Duration,
        on_complete: CompletionCallback,
    ) -> std::result::Result<Box<dyn AsyncTransfer>, TransferError>;
}

/// An enumerated (not necessarily opened) device
pub trait UsbDevice: Send + Sync {
    fn bus_address(&self) -> BusAddress;

    fn descriptor(&self) -> std::result::Result<DeviceDescriptor, OpenError>;

    fn open(&self) -> std::result::Result<Box<dyn UsbHandle>, OpenError>;
}

/// The process-wide USB context
pub trait UsbContextAdaptor: Send + Sync {
    /// Enumerate the devices currently on the bus
    fn devices(&self) -> Result<Vec<Arc<dyn UsbDevice>>>;

    /// Process pending asynchronous completions, waiting at most `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<()>;
}

/// Opens USB contexts
pub trait UsbSubsystem: Send + Sync {
    fn open_context(&self) -> Result<Arc<dyn UsbContextAdaptor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_address_display_and_order() {
        let a = BusAddress::new(1, 9);
        let b = BusAddress::new(2, 1);
        assert_eq!(a.to_string(), "001:009");
        assert!(a < b);
    }

    #[test]
    fn test_wire_frame_data() {
        let frame = WireFrame::Control {
            request_type: 0x40,
            request: 2,
            value: 3,
            index: 0,
            data: vec![1, 2, 3],
        };
        assert_eq!(frame.data(), &[1, 2, 3]);

        let frame = WireFrame::Bulk {
            endpoint: 1,
            data: vec![9],
        };
        assert_eq!(frame.data(), &[9]);
    }
}
