//! Synchronous sender
//!
//! A dedicated worker thread owns the device handle and performs blocking
//! transfers. The caller side only touches a one-slot mailbox, so
//! `send` never blocks on the device and a newer frame replaces one the
//! worker has not picked up yet.

use super::{Health, WidgetKind, lock};
use crate::error::{Result, UsbDmxError};
use crate::transport::{BusAddress, UsbHandle};
use common::DmxBuffer;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct Mailbox {
    pending: Option<DmxBuffer>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    mailbox: Mutex<Mailbox>,
    wakeup: Condvar,
}

pub(crate) struct ThreadedSender {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedSender {
    pub(crate) fn spawn(
        kind: WidgetKind,
        slot: BusAddress,
        handle: Box<dyn UsbHandle>,
        health: Arc<Health>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();

        let worker = thread::Builder::new()
            .name(format!("usbdmx-{}", slot))
            .spawn(move || run_worker(kind, slot, handle, health, worker_shared))
            .map_err(|e| UsbDmxError::Thread(e.to_string()))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Replace the mailbox contents with `buffer`
    pub(crate) fn send(&self, buffer: &DmxBuffer) {
        let mut mailbox = lock(&self.shared.mailbox);
        if mailbox.shutdown {
            return;
        }
        if mailbox.pending.replace(buffer.clone()).is_some() {
            trace!("Replaced unsent frame");
        }
        self.shared.wakeup.notify_one();
    }

    /// Signal the worker and wait for it to exit
    ///
    /// A transfer already in progress completes; a frame still in the
    /// mailbox is discarded.
    pub(crate) fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut mailbox = lock(&self.shared.mailbox);
            mailbox.shutdown = true;
            mailbox.pending = None;
        }
        self.shared.wakeup.notify_all();

        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("USB DMX worker thread panicked");
        }
    }
}

impl Drop for ThreadedSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    kind: WidgetKind,
    slot: BusAddress,
    mut handle: Box<dyn UsbHandle>,
    health: Arc<Health>,
    shared: Arc<Shared>,
) {
    info!("USB DMX worker for {} started", slot);
    let spec = kind.spec();

    loop {
        let buffer = {
            let mut mailbox = lock(&shared.mailbox);
            while mailbox.pending.is_none() && !mailbox.shutdown {
                mailbox = shared
                    .wakeup
                    .wait(mailbox)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if mailbox.shutdown {
                break;
            }
            mailbox.pending.take()
        };

        let Some(buffer) = buffer else {
            continue;
        };

        // A failed widget keeps its handle open until shutdown so the
        // device is closed only after the controller withdrew it.
        if health.is_failed() {
            continue;
        }

        let mut ok = true;
        for frame in kind.encode(&buffer) {
            if let Err(e) = handle.transmit(&frame, spec.timeout) {
                health.record_failure(&e);
                ok = false;
                break;
            }
        }
        if ok {
            health.record_success();
            trace!("Sent {} channels to {}", buffer.len(), slot);
        }
    }

    handle.release_interface(spec.interface);
    drop(handle);
    debug!("USB DMX worker for {} stopped", slot);
}
