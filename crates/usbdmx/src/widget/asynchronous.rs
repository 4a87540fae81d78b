//! Asynchronous sender
//!
//! Frames are submitted without blocking. While a transfer is in flight,
//! newer frames collapse into a single pending slot that is submitted from
//! the completion callback. Callbacks run wherever the context is pumped.

use super::{Health, WidgetKind, lock};
use crate::error::{Result, TransferError};
use crate::transport::{AsyncTransfer, CompletionCallback, UsbContextAdaptor, UsbHandle, WireFrame};
use common::DmxBuffer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_PUMP_INTERVAL: Duration = Duration::from_millis(10);

struct Inner {
    transfer: Option<Box<dyn AsyncTransfer>>,
    handle: Option<Box<dyn UsbHandle>>,
    /// Remaining transfers of the frame being sent
    queue: VecDeque<WireFrame>,
    in_flight: bool,
    pending: Option<DmxBuffer>,
    shutting_down: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    kind: WidgetKind,
    health: Arc<Health>,
}

impl Shared {
    fn start_frame(&self, inner: &mut Inner, buffer: &DmxBuffer) {
        inner.queue = self.kind.encode(buffer).into();
        self.submit_next(inner);
    }

    fn submit_next(&self, inner: &mut Inner) {
        let Some(frame) = inner.queue.pop_front() else {
            return;
        };
        let Some(transfer) = inner.transfer.as_mut() else {
            return;
        };

        match transfer.submit(&frame) {
            Ok(()) => inner.in_flight = true,
            Err(e) => {
                inner.queue.clear();
                if self.health.record_failure(&e) {
                    inner.pending = None;
                }
            }
        }
    }

    fn on_complete(&self, result: std::result::Result<(), TransferError>) {
        let mut inner = lock(&self.inner);
        inner.in_flight = false;

        match result {
            Ok(()) => {
                if inner.queue.is_empty() {
                    self.health.record_success();
                }
            }
            Err(TransferError::Cancelled) if inner.shutting_down => {
                debug!("Transfer cancelled for shutdown");
                return;
            }
            Err(e) => {
                inner.queue.clear();
                if self.health.record_failure(&e) {
                    inner.pending = None;
                    return;
                }
            }
        }

        if inner.shutting_down || self.health.is_failed() {
            return;
        }

        if !inner.queue.is_empty() {
            self.submit_next(&mut inner);
        } else if let Some(buffer) = inner.pending.take() {
            trace!("Submitting coalesced frame");
            self.start_frame(&mut inner, &buffer);
        }
    }
}

pub(crate) struct AsyncSender {
    shared: Arc<Shared>,
    context: Arc<dyn UsbContextAdaptor>,
    interface: u8,
}

impl AsyncSender {
    pub(crate) fn new(
        kind: WidgetKind,
        handle: Box<dyn UsbHandle>,
        context: Arc<dyn UsbContextAdaptor>,
        health: Arc<Health>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                transfer: None,
                handle: None,
                queue: VecDeque::new(),
                in_flight: false,
                pending: None,
                shutting_down: false,
            }),
            kind,
            health,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let on_complete: CompletionCallback = Arc::new(move |result| {
            if let Some(shared) = weak.upgrade() {
                shared.on_complete(result);
            }
        });

        let transfer = handle.async_transfer(kind.spec().timeout, on_complete)?;
        {
            let mut inner = lock(&shared.inner);
            inner.transfer = Some(transfer);
            inner.handle = Some(handle);
        }

        Ok(Self {
            shared,
            context,
            interface: kind.spec().interface,
        })
    }

    pub(crate) fn send(&self, buffer: &DmxBuffer) {
        let mut inner = lock(&self.shared.inner);
        if inner.shutting_down {
            return;
        }
        if inner.in_flight {
            inner.pending = Some(buffer.clone());
            return;
        }
        self.shared.start_frame(&mut inner, buffer);
    }

    /// Cancel any in-flight transfer and pump until its callback has run
    pub(crate) fn shutdown(self) {
        {
            let mut inner = lock(&self.shared.inner);
            inner.shutting_down = true;
            inner.pending = None;
            inner.queue.clear();
            if inner.in_flight
                && let Some(transfer) = inner.transfer.as_ref()
                && let Err(e) = transfer.cancel()
            {
                warn!("Failed to cancel transfer: {}", e);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while lock(&self.shared.inner).in_flight {
            if Instant::now() >= deadline {
                warn!("Timed out waiting for a cancelled transfer to complete");
                break;
            }
            if let Err(e) = self.context.handle_events(SHUTDOWN_PUMP_INTERVAL) {
                warn!("Error handling USB events during shutdown: {}", e);
            }
        }

        let (transfer, handle) = {
            let mut inner = lock(&self.shared.inner);
            (inner.transfer.take(), inner.handle.take())
        };
        drop(transfer);
        if let Some(mut handle) = handle {
            handle.release_interface(self.interface);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{FakeUsbContext, FakeUsbDevice};
    use crate::widget::{
        TransferMode, Widget, WidgetIdentity, WidgetKind, WidgetSettings, WidgetState,
    };
    use common::DmxBuffer;
    use std::sync::Arc;

    fn async_widget(context: &FakeUsbContext, device: &FakeUsbDevice, limit: u32) -> Widget {
        let (tx, _rx) = async_channel::unbounded();
        let widget = Widget::new(
            WidgetKind::Anyma,
            WidgetIdentity {
                vendor_id: 0x16C0,
                product_id: 0x05DC,
                serial: "A1".into(),
                serial_synthesized: false,
            },
            Arc::new(device.clone()),
            context.adaptor(),
            WidgetSettings {
                mode: TransferMode::Asynchronous,
                max_consecutive_failures: limit,
            },
            tx,
        );
        widget.init().unwrap();
        widget
    }

    #[test]
    fn test_frames_coalesce_while_in_flight() {
        let context = FakeUsbContext::new();
        let device = FakeUsbDevice::anyma(1, 4, "A1");
        context.attach(device.clone());
        let widget = async_widget(&context, &device, 3);

        widget.send_dmx(&DmxBuffer::from_slice(&[1]));
        widget.send_dmx(&DmxBuffer::from_slice(&[2]));
        widget.send_dmx(&DmxBuffer::from_slice(&[3]));
        assert_eq!(device.attempts(), 1);

        // completes [1], submits the newest pending frame
        context.pump();
        assert_eq!(device.attempts(), 2);
        context.pump();

        let sent: Vec<Vec<u8>> = device.frames().iter().map(|f| f.data().to_vec()).collect();
        assert_eq!(sent, vec![vec![1], vec![3]]);
    }

    #[test]
    fn test_shutdown_cancels_in_flight_transfer() {
        let context = FakeUsbContext::new();
        let device = FakeUsbDevice::anyma(1, 4, "A1");
        context.attach(device.clone());
        let widget = async_widget(&context, &device, 3);

        widget.send_dmx(&DmxBuffer::from_slice(&[1]));
        widget.send_dmx(&DmxBuffer::from_slice(&[2]));
        assert_eq!(context.pending_completions(), 1);

        widget.shutdown();
        assert_eq!(context.pending_completions(), 0);
        assert_eq!(device.cancellations(), 1);
        assert!(device.frames().is_empty());
        assert_eq!(device.attempts(), 1);
        assert_eq!(widget.state(), WidgetState::Stopped);
    }

    #[test]
    fn test_async_failures_fail_widget() {
        let context = FakeUsbContext::new();
        let device = FakeUsbDevice::anyma(1, 4, "A1");
        device.fail_transfers(Some(crate::error::TransferError::Stall));
        context.attach(device.clone());
        let widget = async_widget(&context, &device, 2);

        widget.send_dmx(&DmxBuffer::from_slice(&[1]));
        context.pump();
        widget.send_dmx(&DmxBuffer::from_slice(&[2]));
        context.pump();
        assert_eq!(widget.state(), WidgetState::Failed);

        widget.send_dmx(&DmxBuffer::from_slice(&[3]));
        assert_eq!(device.attempts(), 2);
    }
}
