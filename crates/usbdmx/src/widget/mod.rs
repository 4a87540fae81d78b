//! DMX widgets
//!
//! A [`Widget`] is one attached USB DMX interface. It is created by a
//! factory in the `Created` state, opened and configured by [`Widget::init`],
//! and from then on accepts frames through [`Widget::send_dmx`]. Frames are
//! handed to the widget's sender, which is either a dedicated worker thread
//! doing blocking transfers or an asynchronous transfer driven by the
//! context pump.

mod asynchronous;
pub mod kind;
mod threaded;

use crate::error::{Result, TransferError, UsbDmxError};
use crate::transport::{BusAddress, UsbContextAdaptor, UsbDevice};
use asynchronous::AsyncSender;
use common::DmxBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use threaded::ThreadedSender;
use tracing::{debug, error, info, trace, warn};

pub use kind::{ModelSpec, WidgetKind};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Who a widget is, for the lifetime of one attachment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WidgetIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
    /// True if the device had no readable serial and `serial` is a placeholder
    pub serial_synthesized: bool,
}

impl fmt::Display for WidgetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} serial {}",
            self.vendor_id, self.product_id, self.serial
        )
    }
}

/// How frames reach the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// One worker thread per widget, blocking transfers
    #[default]
    Synchronous,
    /// Non-blocking submission, completions delivered by the context pump
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WidgetState {
    Created = 0,
    Running = 1,
    /// Consecutive-failure limit reached; terminal
    Failed = 2,
    /// Shut down; terminal
    Stopped = 3,
}

impl WidgetState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WidgetState::Created,
            1 => WidgetState::Running,
            2 => WidgetState::Failed,
            _ => WidgetState::Stopped,
        }
    }
}

/// Notifications from widgets to the lifecycle controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetEvent {
    /// The widget gave up after repeated transfer failures
    Failed { slot: BusAddress, serial: String },
}

/// Per-widget settings taken from the plugin config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidgetSettings {
    pub mode: TransferMode,
    pub max_consecutive_failures: u32,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            mode: TransferMode::Synchronous,
            max_consecutive_failures: 3,
        }
    }
}

/// Failure accounting shared between a widget and its sender
pub(crate) struct Health {
    slot: BusAddress,
    serial: String,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    limit: u32,
    notified: AtomicBool,
    events: async_channel::Sender<WidgetEvent>,
}

impl Health {
    fn new(
        slot: BusAddress,
        serial: String,
        limit: u32,
        events: async_channel::Sender<WidgetEvent>,
    ) -> Self {
        Self {
            slot,
            serial,
            state: AtomicU8::new(WidgetState::Created as u8),
            consecutive_failures: AtomicU32::new(0),
            limit: limit.max(1),
            notified: AtomicBool::new(false),
            events,
        }
    }

    pub(crate) fn state(&self) -> WidgetState {
        WidgetState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.state() == WidgetState::Failed
    }

    fn transition(&self, from: WidgetState, to: WidgetState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Count a failed transfer; returns true once the widget has failed
    pub(crate) fn record_failure(&self, err: &TransferError) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Transfer to widget {} at {} failed ({}/{}): {}",
            self.serial, self.slot, failures, self.limit, err
        );
        if failures >= self.limit {
            self.fail();
            return true;
        }
        false
    }

    /// Enter `Failed` and notify the controller, at most once
    pub(crate) fn fail(&self) {
        if !self.transition(WidgetState::Running, WidgetState::Failed) {
            return;
        }
        error!(
            "Widget {} at {} failed; dropping further frames",
            self.serial, self.slot
        );
        if !self.notified.swap(true, Ordering::AcqRel) {
            let event = WidgetEvent::Failed {
                slot: self.slot,
                serial: self.serial.clone(),
            };
            if let Err(e) = self.events.try_send(event) {
                debug!("Widget event not delivered: {}", e);
            }
        }
    }
}

enum Sender {
    Threaded(ThreadedSender),
    Async(AsyncSender),
}

/// One attached DMX widget
pub struct Widget {
    kind: WidgetKind,
    identity: WidgetIdentity,
    slot: BusAddress,
    mode: TransferMode,
    device: Arc<dyn UsbDevice>,
    context: Arc<dyn UsbContextAdaptor>,
    health: Arc<Health>,
    sender: Mutex<Option<Sender>>,
}

impl Widget {
    pub fn new(
        kind: WidgetKind,
        identity: WidgetIdentity,
        device: Arc<dyn UsbDevice>,
        context: Arc<dyn UsbContextAdaptor>,
        settings: WidgetSettings,
        events: async_channel::Sender<WidgetEvent>,
    ) -> Self {
        let slot = device.bus_address();
        let health = Health::new(
            slot,
            identity.serial.clone(),
            settings.max_consecutive_failures,
            events,
        );

        Self {
            kind,
            identity,
            slot,
            mode: settings.mode,
            device,
            context,
            health: Arc::new(health),
            sender: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> WidgetKind {
        self.kind
    }

    pub fn identity(&self) -> &WidgetIdentity {
        &self.identity
    }

    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    pub fn slot(&self) -> BusAddress {
        self.slot
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    pub fn state(&self) -> WidgetState {
        self.health.state()
    }

    /// Open the device, claim its interface, send the model's setup frames
    /// and start the sender
    pub fn init(&self) -> Result<()> {
        let mut sender = lock(&self.sender);
        if sender.is_some() || self.health.state() != WidgetState::Created {
            return Err(UsbDmxError::AlreadyInitialised);
        }

        let spec = self.kind.spec();
        let mut handle = self.device.open()?;
        handle.claim_interface(spec.interface)?;

        for frame in self.kind.setup_frames() {
            if let Err(e) = handle.transmit(&frame, spec.timeout) {
                warn!(
                    "Failed to configure {} widget {}: {}",
                    self.kind, self.identity.serial, e
                );
                handle.release_interface(spec.interface);
                return Err(e.into());
            }
        }

        *sender = Some(match self.mode {
            TransferMode::Synchronous => Sender::Threaded(ThreadedSender::spawn(
                self.kind,
                self.slot,
                handle,
                self.health.clone(),
            )?),
            TransferMode::Asynchronous => Sender::Async(AsyncSender::new(
                self.kind,
                handle,
                self.context.clone(),
                self.health.clone(),
            )?),
        });

        self.health
            .transition(WidgetState::Created, WidgetState::Running);
        info!(
            "Initialised {} widget {} at {} ({:?})",
            self.kind, self.identity.serial, self.slot, self.mode
        );
        Ok(())
    }

    /// Queue a frame for transmission
    ///
    /// Returns false if the widget has not been initialised or was shut
    /// down. A failed widget accepts frames and drops them.
    pub fn send_dmx(&self, buffer: &DmxBuffer) -> bool {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return false;
        };

        if self.health.is_failed() {
            trace!("Dropping frame for failed widget {}", self.identity.serial);
            return true;
        }

        match sender {
            Sender::Threaded(sender) => sender.send(buffer),
            Sender::Async(sender) => sender.send(buffer),
        }
        true
    }

    /// Stop the sender and close the device; idempotent
    pub fn shutdown(&self) {
        let sender = lock(&self.sender).take();
        if let Some(sender) = sender {
            match sender {
                Sender::Threaded(sender) => sender.shutdown(),
                Sender::Async(sender) => sender.shutdown(),
            }
            debug!(
                "Shut down {} widget {} at {}",
                self.kind, self.identity.serial, self.slot
            );
        }

        if !self.health.transition(WidgetState::Running, WidgetState::Stopped) {
            self.health
                .transition(WidgetState::Created, WidgetState::Stopped);
        }
    }
}

impl Drop for Widget {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Widget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Widget")
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .field("slot", &self.slot)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}
