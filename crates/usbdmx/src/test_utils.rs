//! Fake USB backend for tests
//!
//! [`FakeUsbContext`] stands in for the libusb context: devices are attached
//! and detached by the test, asynchronous completions queue up until the
//! context is pumped, and every open/claim/close lands in a shared
//! [`Journal`] so orderings against host calls can be checked.
//!
//! ```
//! use usbdmx::test_utils::{FakeUsbContext, FakeUsbDevice};
//!
//! let context = FakeUsbContext::new();
//! let device = FakeUsbDevice::eurolite(1, 2, "EL-1");
//! context.attach(device.clone());
//! assert_eq!(context.adaptor().devices().unwrap().len(), 1);
//! ```

use crate::error::{OpenError, Result, TransferError, UsbDmxError};
use crate::transport::{
    AsyncTransfer, BusAddress, CompletionCallback, DeviceDescriptor, UsbContextAdaptor, UsbDevice,
    UsbHandle, UsbSubsystem, WireFrame,
};
use crate::widget::{WidgetKind, lock};
use common::test_utils::Journal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

const MANUFACTURER_INDEX: u8 = 1;
const PRODUCT_INDEX: u8 = 2;
const SERIAL_INDEX: u8 = 3;

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Blocks blocking transfers while closed
#[derive(Clone)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            inner: Arc::new((Mutex::new(true), Condvar::new())),
        }
    }
}

impl Gate {
    pub fn close(&self) {
        *lock(&self.inner.0) = false;
    }

    pub fn open(&self) {
        *lock(&self.inner.0) = true;
        self.inner.1.notify_all();
    }

    fn wait(&self) {
        let mut open = lock(&self.inner.0);
        while !*open {
            open = self.inner.1.wait(open).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct DeviceState {
    descriptor: DeviceDescriptor,
    strings: HashMap<u8, String>,
    open_error: Option<OpenError>,
    claim_fails: bool,
    default_outcome: Option<TransferError>,
    script: VecDeque<std::result::Result<(), TransferError>>,
    frames: Vec<WireFrame>,
    attempts: usize,
    cancellations: usize,
    present: bool,
}

struct DeviceShared {
    slot: BusAddress,
    state: Mutex<DeviceState>,
    gate: Gate,
    context: Mutex<Weak<ContextShared>>,
}

impl DeviceShared {
    fn journal(&self) -> Journal {
        lock(&self.context)
            .upgrade()
            .map(|context| context.journal.clone())
            .unwrap_or_default()
    }

    fn begin_attempt(&self) {
        lock(&self.state).attempts += 1;
    }

    fn next_outcome(&self) -> std::result::Result<(), TransferError> {
        let mut state = lock(&self.state);
        if !state.present {
            return Err(TransferError::DeviceGone);
        }
        match state.script.pop_front() {
            Some(outcome) => outcome,
            None => match &state.default_outcome {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
        }
    }

    fn record_frame(&self, frame: &WireFrame) {
        lock(&self.state).frames.push(frame.clone());
    }
}

/// A scriptable USB device
///
/// Clones share state, so a test can keep one clone for inspection while
/// another is attached to a [`FakeUsbContext`].
#[derive(Clone)]
pub struct FakeUsbDevice {
    shared: Arc<DeviceShared>,
}

impl FakeUsbDevice {
    /// A device with the given IDs and no string descriptors
    pub fn new(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> Self {
        let state = DeviceState {
            descriptor: DeviceDescriptor {
                vendor_id,
                product_id,
                manufacturer_index: None,
                product_index: None,
                serial_number_index: None,
            },
            strings: HashMap::new(),
            open_error: None,
            claim_fails: false,
            default_outcome: None,
            script: VecDeque::new(),
            frames: Vec::new(),
            attempts: 0,
            cancellations: 0,
            present: true,
        };

        Self {
            shared: Arc::new(DeviceShared {
                slot: BusAddress::new(bus, address),
                state: Mutex::new(state),
                gate: Gate::default(),
                context: Mutex::new(Weak::new()),
            }),
        }
    }

    /// A device that looks like `kind`, with matching strings
    pub fn for_model(kind: WidgetKind, bus: u8, address: u8, serial: Option<&str>) -> Self {
        let spec = kind.spec();
        Self::new(bus, address, spec.vendor_id, spec.product_id)
            .with_strings(
                spec.manufacturer.unwrap_or_default(),
                spec.product.unwrap_or_default(),
            )
            .with_serial(serial)
    }

    pub fn anyma(bus: u8, address: u8, serial: &str) -> Self {
        Self::for_model(WidgetKind::Anyma, bus, address, Some(serial))
    }

    pub fn eurolite(bus: u8, address: u8, serial: &str) -> Self {
        Self::for_model(WidgetKind::EurolitePro, bus, address, Some(serial))
    }

    pub fn fadecandy(bus: u8, address: u8, serial: Option<&str>) -> Self {
        Self::for_model(WidgetKind::Fadecandy, bus, address, serial)
    }

    pub fn sunlite(bus: u8, address: u8, serial: Option<&str>) -> Self {
        let spec = WidgetKind::Sunlite.spec();
        Self::new(bus, address, spec.vendor_id, spec.product_id).with_serial(serial)
    }

    pub fn velleman(bus: u8, address: u8, serial: Option<&str>) -> Self {
        let spec = WidgetKind::Velleman.spec();
        Self::new(bus, address, spec.vendor_id, spec.product_id).with_serial(serial)
    }

    /// A device none of the factories know
    pub fn other(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> Self {
        Self::new(bus, address, vendor_id, product_id).with_strings("Generic", "Keyboard")
    }

    pub fn with_strings(self, manufacturer: &str, product: &str) -> Self {
        {
            let mut state = lock(&self.shared.state);
            state.descriptor.manufacturer_index = Some(MANUFACTURER_INDEX);
            state.descriptor.product_index = Some(PRODUCT_INDEX);
            state
                .strings
                .insert(MANUFACTURER_INDEX, manufacturer.to_string());
            state.strings.insert(PRODUCT_INDEX, product.to_string());
        }
        self
    }

    pub fn with_serial(self, serial: Option<&str>) -> Self {
        {
            let mut state = lock(&self.shared.state);
            match serial {
                Some(serial) => {
                    state.descriptor.serial_number_index = Some(SERIAL_INDEX);
                    state.strings.insert(SERIAL_INDEX, serial.to_string());
                }
                None => {
                    state.descriptor.serial_number_index = None;
                    state.strings.remove(&SERIAL_INDEX);
                }
            }
        }
        self
    }

    /// Advertise a serial number string that cannot be read
    pub fn with_unreadable_serial(self) -> Self {
        {
            let mut state = lock(&self.shared.state);
            state.descriptor.serial_number_index = Some(SERIAL_INDEX);
            state.strings.remove(&SERIAL_INDEX);
        }
        self
    }

    pub fn slot(&self) -> BusAddress {
        self.shared.slot
    }

    pub fn descriptor_value(&self) -> DeviceDescriptor {
        lock(&self.shared.state).descriptor
    }

    pub fn fail_open(&self, error: Option<OpenError>) {
        lock(&self.shared.state).open_error = error;
    }

    pub fn fail_claim(&self, fails: bool) {
        lock(&self.shared.state).claim_fails = fails;
    }

    /// Outcome of every transfer not covered by a script
    pub fn fail_transfers(&self, error: Option<TransferError>) {
        lock(&self.shared.state).default_outcome = error;
    }

    /// Outcomes for the next transfers, in order
    pub fn script_transfers(
        &self,
        outcomes: impl IntoIterator<Item = std::result::Result<(), TransferError>>,
    ) {
        lock(&self.shared.state).script.extend(outcomes);
    }

    /// Gate that blocking transfers wait on
    pub fn gate(&self) -> Gate {
        self.shared.gate.clone()
    }

    /// Frames that were transferred successfully
    pub fn frames(&self) -> Vec<WireFrame> {
        lock(&self.shared.state).frames.clone()
    }

    /// Transfers attempted, successful or not
    pub fn attempts(&self) -> usize {
        lock(&self.shared.state).attempts
    }

    pub fn cancellations(&self) -> usize {
        lock(&self.shared.state).cancellations
    }
}

impl UsbDevice for FakeUsbDevice {
    fn bus_address(&self) -> BusAddress {
        self.shared.slot
    }

    fn descriptor(&self) -> std::result::Result<DeviceDescriptor, OpenError> {
        let state = lock(&self.shared.state);
        if !state.present {
            return Err(OpenError::Removed);
        }
        Ok(state.descriptor)
    }

    fn open(&self) -> std::result::Result<Box<dyn UsbHandle>, OpenError> {
        {
            let state = lock(&self.shared.state);
            if !state.present {
                return Err(OpenError::Removed);
            }
            if let Some(err) = &state.open_error {
                return Err(err.clone());
            }
        }

        let journal = self.shared.journal();
        journal.record(format!("open:{}", self.shared.slot));
        Ok(Box::new(FakeHandle {
            device: self.shared.clone(),
            journal,
            claimed: Vec::new(),
        }))
    }
}

struct FakeHandle {
    device: Arc<DeviceShared>,
    journal: Journal,
    claimed: Vec<u8>,
}

impl UsbHandle for FakeHandle {
    fn read_string(&self, index: u8) -> std::result::Result<String, TransferError> {
        let state = lock(&self.device.state);
        if !state.present {
            return Err(TransferError::DeviceGone);
        }
        state.strings.get(&index).cloned().ok_or(TransferError::Stall)
    }

    fn claim_interface(&mut self, interface: u8) -> std::result::Result<(), OpenError> {
        if lock(&self.device.state).claim_fails {
            return Err(OpenError::Busy);
        }
        self.claimed.push(interface);
        self.journal
            .record(format!("claim:{}:{}", self.device.slot, interface));
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) {
        if let Some(pos) = self.claimed.iter().position(|i| *i == interface) {
            self.claimed.remove(pos);
            self.journal
                .record(format!("release:{}:{}", self.device.slot, interface));
        }
    }

    fn transmit(
        &self,
        frame: &WireFrame,
        _timeout: Duration,
    ) -> std::result::Result<(), TransferError> {
        self.device.begin_attempt();
        self.device.gate.wait();
        self.device.next_outcome()?;
        self.device.record_frame(frame);
        Ok(())
    }

    fn async_transfer(
        &self,
        _timeout: Duration,
        on_complete: CompletionCallback,
    ) -> std::result::Result<Box<dyn AsyncTransfer>, TransferError> {
        let context = lock(&self.device.context).clone();
        if context.upgrade().is_none() {
            return Err(TransferError::Other("device is not attached".into()));
        }
        Ok(Box::new(FakeAsyncTransfer {
            device: self.device.clone(),
            context,
            on_complete,
            current: None,
        }))
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        for interface in std::mem::take(&mut self.claimed) {
            self.journal
                .record(format!("release:{}:{}", self.device.slot, interface));
        }
        self.journal.record(format!("close:{}", self.device.slot));
    }
}

struct Completion {
    device: Arc<DeviceShared>,
    frame: WireFrame,
    result: Mutex<std::result::Result<(), TransferError>>,
    done: AtomicBool,
    on_complete: CompletionCallback,
}

struct FakeAsyncTransfer {
    device: Arc<DeviceShared>,
    context: Weak<ContextShared>,
    on_complete: CompletionCallback,
    current: Option<Arc<Completion>>,
}

impl FakeAsyncTransfer {
    fn in_flight(&self) -> Option<&Arc<Completion>> {
        self.current
            .as_ref()
            .filter(|completion| !completion.done.load(Ordering::Acquire))
    }
}

impl AsyncTransfer for FakeAsyncTransfer {
    fn submit(&mut self, frame: &WireFrame) -> std::result::Result<(), TransferError> {
        if self.in_flight().is_some() {
            return Err(TransferError::InFlight);
        }
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| TransferError::Other("context is gone".into()))?;

        self.device.begin_attempt();
        let outcome = self.device.next_outcome();
        let completion = Arc::new(Completion {
            device: self.device.clone(),
            frame: frame.clone(),
            result: Mutex::new(outcome),
            done: AtomicBool::new(false),
            on_complete: self.on_complete.clone(),
        });
        lock(&context.completions).push_back(completion.clone());
        self.current = Some(completion);
        Ok(())
    }

    fn cancel(&self) -> std::result::Result<(), TransferError> {
        if let Some(completion) = self.in_flight() {
            *lock(&completion.result) = Err(TransferError::Cancelled);
            lock(&self.device.state).cancellations += 1;
        }
        Ok(())
    }
}

struct ContextShared {
    devices: Mutex<BTreeMap<BusAddress, FakeUsbDevice>>,
    completions: Mutex<VecDeque<Arc<Completion>>>,
    journal: Journal,
    fail_open: AtomicBool,
    enumerations: AtomicUsize,
}

impl UsbContextAdaptor for ContextShared {
    fn devices(&self) -> Result<Vec<Arc<dyn UsbDevice>>> {
        self.enumerations.fetch_add(1, Ordering::Relaxed);
        Ok(lock(&self.devices)
            .values()
            .map(|device| Arc::new(device.clone()) as Arc<dyn UsbDevice>)
            .collect())
    }

    fn handle_events(&self, _timeout: Duration) -> Result<()> {
        // Only what is queued now; resubmissions from callbacks wait for the
        // next pump.
        let batch: Vec<Arc<Completion>> = lock(&self.completions).drain(..).collect();
        for completion in batch {
            let result = lock(&completion.result).clone();
            if result.is_ok() {
                completion.device.record_frame(&completion.frame);
            }
            completion.done.store(true, Ordering::Release);
            (completion.on_complete)(result);
        }
        Ok(())
    }
}

struct FakeSubsystem {
    context: Arc<ContextShared>,
}

impl UsbSubsystem for FakeSubsystem {
    fn open_context(&self) -> Result<Arc<dyn UsbContextAdaptor>> {
        if self.context.fail_open.load(Ordering::Relaxed) {
            return Err(UsbDmxError::Usb("libusb_init failed".into()));
        }
        self.context.journal.record("open_context");
        Ok(self.context.clone())
    }
}

/// A fake USB context with a scriptable device list
#[derive(Clone)]
pub struct FakeUsbContext {
    shared: Arc<ContextShared>,
}

impl Default for FakeUsbContext {
    fn default() -> Self {
        Self::with_journal(Journal::default())
    }
}

impl FakeUsbContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record into `journal`, e.g. one shared with a `RecordingAdaptor`
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                devices: Mutex::new(BTreeMap::new()),
                completions: Mutex::new(VecDeque::new()),
                journal,
                fail_open: AtomicBool::new(false),
                enumerations: AtomicUsize::new(0),
            }),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.shared.journal
    }

    pub fn adaptor(&self) -> Arc<dyn UsbContextAdaptor> {
        self.shared.clone()
    }

    /// A subsystem whose `open_context` hands out this context
    pub fn subsystem(&self) -> Arc<dyn UsbSubsystem> {
        Arc::new(FakeSubsystem {
            context: self.shared.clone(),
        })
    }

    pub fn fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::Relaxed);
    }

    /// Plug `device` in
    pub fn attach(&self, device: FakeUsbDevice) {
        *lock(&device.shared.context) = Arc::downgrade(&self.shared);
        lock(&device.shared.state).present = true;
        self.shared
            .journal
            .record(format!("attach:{}", device.slot()));
        lock(&self.shared.devices).insert(device.slot(), device);
    }

    /// Unplug the device in `slot`; later transfers fail with `DeviceGone`
    pub fn detach(&self, slot: BusAddress) -> Option<FakeUsbDevice> {
        let device = lock(&self.shared.devices).remove(&slot)?;
        lock(&device.shared.state).present = false;
        self.shared.journal.record(format!("detach:{}", slot));
        Some(device)
    }

    /// Deliver queued completions
    pub fn pump(&self) {
        let _ = self.shared.handle_events(Duration::ZERO);
    }

    pub fn pending_completions(&self) -> usize {
        lock(&self.shared.completions).len()
    }

    /// Number of times the device list was enumerated
    pub fn enumerations(&self) -> usize {
        self.shared.enumerations.load(Ordering::Relaxed)
    }
}
