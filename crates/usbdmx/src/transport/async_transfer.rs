//! libusb asynchronous transfers
//!
//! rusb only exposes blocking transfers, so the asynchronous path talks to
//! libusb directly through `rusb::ffi`. One [`LibUsbAsyncTransfer`] owns one
//! `libusb_transfer` and is resubmitted for every frame.
//!
//! Completions are delivered from `libusb_handle_events`, i.e. from whoever
//! pumps [`super::UsbContextAdaptor::handle_events`].

use super::{AsyncTransfer, CompletionCallback, WireFrame};
use crate::error::TransferError;
use crate::transport::libusb::map_transfer_error;
use rusb::{Context, DeviceHandle, ffi};
use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const TRANSFER_TYPE_CONTROL: u8 = 0;
const TRANSFER_TYPE_BULK: u8 = 2;
const TRANSFER_TYPE_INTERRUPT: u8 = 3;

const STATUS_COMPLETED: c_int = 0;
const STATUS_ERROR: c_int = 1;
const STATUS_TIMED_OUT: c_int = 2;
const STATUS_CANCELLED: c_int = 3;
const STATUS_STALL: c_int = 4;
const STATUS_NO_DEVICE: c_int = 5;
const STATUS_OVERFLOW: c_int = 6;

const CONTROL_SETUP_SIZE: usize = 8;

/// State reachable from the libusb callback through `user_data`
struct CallbackState {
    on_complete: CompletionCallback,
    /// Payload bytes the current submission must move
    expected: AtomicUsize,
    in_flight: AtomicBool,
}

/// A single reusable libusb transfer
pub struct LibUsbAsyncTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    state: NonNull<CallbackState>,
    /// Keeps the device handle open for as long as the transfer exists
    handle: Arc<DeviceHandle<Context>>,
    buffer: Vec<u8>,
    timeout: Duration,
}

// The raw transfer is only touched by its owner and, while in flight, by
// libusb's completion path, which synchronises through `in_flight`.
unsafe impl Send for LibUsbAsyncTransfer {}

impl LibUsbAsyncTransfer {
    pub fn new(
        handle: Arc<DeviceHandle<Context>>,
        timeout: Duration,
        on_complete: CompletionCallback,
    ) -> Result<Self, TransferError> {
        // SAFETY: allocating a transfer with no isochronous packets has no
        // preconditions; a null return means allocation failed.
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        let raw = NonNull::new(raw)
            .ok_or_else(|| TransferError::Other("libusb_alloc_transfer failed".into()))?;

        let state = Box::new(CallbackState {
            on_complete,
            expected: AtomicUsize::new(0),
            in_flight: AtomicBool::new(false),
        });

        Ok(Self {
            raw,
            state: NonNull::from(Box::leak(state)),
            handle,
            buffer: Vec::new(),
            timeout,
        })
    }

    fn state(&self) -> &CallbackState {
        // SAFETY: `state` is created in `new` and only freed in `drop`.
        unsafe { self.state.as_ref() }
    }

    fn is_in_flight(&self) -> bool {
        self.state().in_flight.load(Ordering::Acquire)
    }
}

impl AsyncTransfer for LibUsbAsyncTransfer {
    fn submit(&mut self, frame: &WireFrame) -> Result<(), TransferError> {
        if self.is_in_flight() {
            return Err(TransferError::InFlight);
        }

        let (transfer_type, endpoint) = match frame {
            WireFrame::Control {
                request_type,
                request,
                value,
                index,
                data,
            } => {
                self.buffer.clear();
                self.buffer.push(*request_type);
                self.buffer.push(*request);
                self.buffer.extend_from_slice(&value.to_le_bytes());
                self.buffer.extend_from_slice(&index.to_le_bytes());
                self.buffer
                    .extend_from_slice(&(data.len() as u16).to_le_bytes());
                self.buffer.extend_from_slice(data);
                (TRANSFER_TYPE_CONTROL, 0)
            }
            WireFrame::Bulk { endpoint, data } => {
                self.buffer.clear();
                self.buffer.extend_from_slice(data);
                (TRANSFER_TYPE_BULK, *endpoint)
            }
            WireFrame::Interrupt { endpoint, data } => {
                self.buffer.clear();
                self.buffer.extend_from_slice(data);
                (TRANSFER_TYPE_INTERRUPT, *endpoint)
            }
        };

        let state = self.state();
        state.expected.store(frame.data().len(), Ordering::Relaxed);
        state.in_flight.store(true, Ordering::Release);

        // SAFETY: the transfer is not in flight, so libusb holds no reference
        // to it. `buffer` and `state` outlive the submission: neither is
        // touched again until the completion callback cleared `in_flight`,
        // and `drop` leaks both if it runs while the transfer is in flight.
        let rc = unsafe {
            let transfer = self.raw.as_ptr();
            (*transfer).dev_handle = self.handle.as_raw();
            (*transfer).flags = 0;
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = transfer_type;
            (*transfer).timeout = self.timeout.as_millis().min(u32::MAX as u128) as u32;
            (*transfer).length = self.buffer.len() as c_int;
            (*transfer).actual_length = 0;
            (*transfer).callback = transfer_complete;
            (*transfer).user_data = self.state.as_ptr() as *mut c_void;
            (*transfer).buffer = self.buffer.as_mut_ptr();
            (*transfer).num_iso_packets = 0;
            ffi::libusb_submit_transfer(transfer)
        };

        if rc < 0 {
            self.state().in_flight.store(false, Ordering::Release);
            let err = map_transfer_error(rusb_error(rc));
            warn!("Failed to submit transfer: {}", err);
            return Err(err);
        }

        Ok(())
    }

    fn cancel(&self) -> Result<(), TransferError> {
        if !self.is_in_flight() {
            return Ok(());
        }

        // SAFETY: cancelling a transfer that already completed is reported by
        // libusb as NOT_FOUND and is otherwise harmless.
        let rc = unsafe { ffi::libusb_cancel_transfer(self.raw.as_ptr()) };
        if rc < 0 && rc != ffi::constants::LIBUSB_ERROR_NOT_FOUND {
            return Err(map_transfer_error(rusb_error(rc)));
        }
        Ok(())
    }
}

impl Drop for LibUsbAsyncTransfer {
    fn drop(&mut self) {
        if self.is_in_flight() {
            // libusb still owns the transfer; freeing it would leave the
            // completion path with dangling pointers.
            warn!("Dropping an in-flight USB transfer; leaking it");
            // SAFETY: see `cancel`.
            unsafe {
                ffi::libusb_cancel_transfer(self.raw.as_ptr());
            }
            std::mem::forget(std::mem::take(&mut self.buffer));
            std::mem::forget(self.handle.clone());
            return;
        }

        // SAFETY: not in flight, so libusb no longer references the transfer
        // or the callback state.
        unsafe {
            ffi::libusb_free_transfer(self.raw.as_ptr());
            drop(Box::from_raw(self.state.as_ptr()));
        }
        debug!("Freed USB transfer");
    }
}

extern "system" fn transfer_complete(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back the transfer we submitted, whose `user_data`
    // points at a live `CallbackState` until `in_flight` is cleared.
    let (on_complete, result) = unsafe {
        let transfer = &*transfer;
        let state = &*(transfer.user_data as *const CallbackState);
        let expected = state.expected.load(Ordering::Relaxed);
        let result = completion_result(transfer.status, transfer.actual_length, expected);
        let on_complete = state.on_complete.clone();
        state.in_flight.store(false, Ordering::Release);
        (on_complete, result)
    };

    on_complete(result);
}

fn completion_result(status: c_int, actual: c_int, expected: usize) -> Result<(), TransferError> {
    match status {
        STATUS_COMPLETED => {
            let actual = actual.max(0) as usize;
            if actual < expected {
                Err(TransferError::ShortWrite { expected, actual })
            } else {
                Ok(())
            }
        }
        STATUS_TIMED_OUT => Err(TransferError::Timeout),
        STATUS_CANCELLED => Err(TransferError::Cancelled),
        STATUS_STALL => Err(TransferError::Stall),
        STATUS_NO_DEVICE => Err(TransferError::DeviceGone),
        STATUS_OVERFLOW => Err(TransferError::Overflow),
        STATUS_ERROR => Err(TransferError::Other("transfer error".into())),
        other => Err(TransferError::Other(format!("transfer status {}", other))),
    }
}

fn rusb_error(rc: c_int) -> rusb::Error {
    use ffi::constants::*;

    match rc {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_result() {
        assert_eq!(completion_result(STATUS_COMPLETED, 513, 513), Ok(()));
        assert_eq!(
            completion_result(STATUS_COMPLETED, 64, 518),
            Err(TransferError::ShortWrite {
                expected: 518,
                actual: 64
            })
        );
        assert_eq!(
            completion_result(STATUS_CANCELLED, 0, 64),
            Err(TransferError::Cancelled)
        );
        assert_eq!(
            completion_result(STATUS_NO_DEVICE, 0, 64),
            Err(TransferError::DeviceGone)
        );
        assert!(matches!(
            completion_result(42, 0, 64),
            Err(TransferError::Other(_))
        ));
    }

    #[test]
    fn test_rusb_error_mapping() {
        assert_eq!(
            rusb_error(ffi::constants::LIBUSB_ERROR_NO_DEVICE),
            rusb::Error::NoDevice
        );
        assert_eq!(
            rusb_error(ffi::constants::LIBUSB_ERROR_PIPE),
            rusb::Error::Pipe
        );
        assert_eq!(rusb_error(-1234), rusb::Error::Other);
    }
}
