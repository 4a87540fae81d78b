//! USB DMX plugin lifecycle
//!
//! Owns the USB context while running, drives discovery from a host timer
//! and keeps one registered host device per initialised widget.

use crate::config::UsbDmxConfig;
use crate::device::UsbDmxDevice;
use crate::discovery::DeviceDiscovery;
use crate::error::UsbDmxError;
use crate::factory::{ModelFactory, WidgetObserver};
use crate::transport::{BusAddress, LibUsbSubsystem, UsbContextAdaptor, UsbSubsystem};
use crate::widget::{TransferMode, Widget, WidgetEvent, lock};
use common::{Device, Error, Plugin, PluginAdaptor, PluginRegistration, Result, TimerId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const PLUGIN_NAME: &str = "USB DMX";

const PLUGIN_DESCRIPTION: &str = "\
USB DMX Plugin
----------------------------

This plugin supports USB DMX widgets: the Anyma uDMX, the Eurolite USB-DMX512
PRO, the Fadecandy, the Sunlite USBDMX2 and the Velleman K8062. Each widget
appears as a device with a single output port.

The bus is scanned periodically; widgets are added and removed as they are
plugged in and out. Widgets are driven either by a worker thread per widget
(synchronous mode) or by asynchronous transfers serviced from the event loop
(asynchronous mode).

--- Config section: [usbdmx] ---

enabled = true
mode = \"synchronous\" | \"asynchronous\"
rescan_interval_ms = 2000
pump_interval_ms = 10
max_consecutive_failures = 3
libusb_debug_level = 0..4
models = [\"anyma\", \"eurolite-pro\", \"fadecandy\", \"sunlite\", \"velleman\"]
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct RegisteredDevice {
    widget: Arc<Widget>,
    device_id: String,
}

/// Withdraw the host device, then shut the widget down
fn teardown(adaptor: &dyn PluginAdaptor, entry: RegisteredDevice) {
    if let Err(e) = adaptor.unregister_device(&entry.device_id) {
        warn!("Failed to unregister device {}: {}", entry.device_id, e);
    }
    entry.widget.shutdown();
    info!("Removed device {}", entry.device_id);
}

/// Everything that exists only while the plugin runs
struct Session {
    context: Arc<dyn UsbContextAdaptor>,
    discovery: DeviceDiscovery,
    devices: BTreeMap<BusAddress, RegisteredDevice>,
    events: async_channel::Receiver<WidgetEvent>,
    adaptor: Arc<dyn PluginAdaptor>,
}

impl Session {
    fn rescan(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                WidgetEvent::Failed { slot, serial } => {
                    warn!("Removing failed widget {} at {}", serial, slot);
                    if let Some(entry) = self.devices.remove(&slot) {
                        teardown(self.adaptor.as_ref(), entry);
                    }
                    self.discovery.forget(slot);
                }
            }
        }

        let mut binder = Binder {
            devices: &mut self.devices,
            adaptor: self.adaptor.as_ref(),
        };
        if let Err(e) = self.discovery.scan(self.context.as_ref(), &mut binder) {
            warn!("USB scan failed: {}", e);
        }
    }

    fn teardown(&mut self) {
        let devices = std::mem::take(&mut self.devices);
        for (_, entry) in devices {
            teardown(self.adaptor.as_ref(), entry);
        }
        self.discovery.clear();
        while self.events.try_recv().is_ok() {}
    }
}

/// Binds widgets found by discovery to host devices
struct Binder<'a> {
    devices: &'a mut BTreeMap<BusAddress, RegisteredDevice>,
    adaptor: &'a dyn PluginAdaptor,
}

impl WidgetObserver for Binder<'_> {
    fn new_widget(&mut self, widget: Widget) -> bool {
        let slot = widget.slot();
        if self.devices.contains_key(&slot) {
            warn!("{}", UsbDmxError::RegistrationConflict(slot));
            return false;
        }

        if let Err(e) = widget.init() {
            warn!(
                "Failed to initialise {} widget {} at {}: {}",
                widget.kind(),
                widget.serial(),
                slot,
                e
            );
            return false;
        }

        let widget = Arc::new(widget);
        let device = Arc::new(UsbDmxDevice::new(widget.clone()));
        let device_id = device.id().to_string();

        if let Err(e) = self.adaptor.register_device(device) {
            warn!("Failed to register device {}: {}", device_id, e);
            widget.shutdown();
            return false;
        }

        info!("Added device {} at {}", device_id, slot);
        self.devices
            .insert(slot, RegisteredDevice { widget, device_id });
        true
    }

    fn widget_removed(&mut self, slot: BusAddress) {
        if let Some(entry) = self.devices.remove(&slot) {
            teardown(self.adaptor, entry);
        }
    }
}

pub struct UsbDmxPlugin {
    adaptor: Arc<dyn PluginAdaptor>,
    subsystem: Arc<dyn UsbSubsystem>,
    config: UsbDmxConfig,
    state: PluginState,
    session: Option<Arc<Mutex<Session>>>,
    timers: Vec<TimerId>,
}

impl UsbDmxPlugin {
    pub fn new(adaptor: Arc<dyn PluginAdaptor>, config: UsbDmxConfig) -> Self {
        let subsystem = Arc::new(LibUsbSubsystem::new(config.libusb_debug_level));
        Self::with_subsystem(adaptor, subsystem, config)
    }

    pub fn with_subsystem(
        adaptor: Arc<dyn PluginAdaptor>,
        subsystem: Arc<dyn UsbSubsystem>,
        config: UsbDmxConfig,
    ) -> Self {
        Self {
            adaptor,
            subsystem,
            config,
            state: PluginState::Stopped,
            session: None,
            timers: Vec::new(),
        }
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Ids of the host devices currently registered by this plugin
    pub fn device_ids(&self) -> Vec<String> {
        match &self.session {
            Some(session) => lock(session)
                .devices
                .values()
                .map(|entry| entry.device_id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Run a discovery pass now instead of waiting for the timer
    pub fn rescan(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::NotRunning)?;
        lock(session).rescan();
        Ok(())
    }

    fn open_session(&self) -> std::result::Result<Session, UsbDmxError> {
        self.config.validate()?;
        let context = self.subsystem.open_context()?;

        let (events_tx, events_rx) = async_channel::unbounded();
        let mut discovery = DeviceDiscovery::new();
        for kind in &self.config.models {
            discovery.add_factory(Box::new(ModelFactory::new(
                *kind,
                context.clone(),
                self.config.widget_settings(),
                events_tx.clone(),
            )));
        }

        Ok(Session {
            context,
            discovery,
            devices: BTreeMap::new(),
            events: events_rx,
            adaptor: self.adaptor.clone(),
        })
    }

    fn schedule_timers(&mut self, session: &Arc<Mutex<Session>>) {
        let weak: Weak<Mutex<Session>> = Arc::downgrade(session);
        let rescan = self.adaptor.schedule_repeating(
            self.config.rescan_interval(),
            Box::new(move || {
                if let Some(session) = weak.upgrade() {
                    lock(&session).rescan();
                }
            }),
        );
        self.timers.push(rescan);

        if self.config.mode == TransferMode::Asynchronous {
            let context = lock(session).context.clone();
            let pump = self.adaptor.schedule_repeating(
                self.config.pump_interval(),
                Box::new(move || {
                    if let Err(e) = context.handle_events(Duration::ZERO) {
                        warn!("Error handling USB events: {}", e);
                    }
                }),
            );
            self.timers.push(pump);
        }
    }
}

impl Plugin for UsbDmxPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn description(&self) -> &str {
        PLUGIN_DESCRIPTION
    }

    fn start(&mut self) -> Result<()> {
        if self.state != PluginState::Stopped {
            return Err(Error::AlreadyRunning);
        }
        self.state = PluginState::Starting;

        let mut session = match self.open_session() {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to start {} plugin: {}", PLUGIN_NAME, e);
                self.state = PluginState::Stopped;
                return Err(match e {
                    UsbDmxError::Config(msg) => Error::Config(msg),
                    other => Error::Other(other.to_string()),
                });
            }
        };

        session.rescan();
        let count = session.devices.len();
        let session = Arc::new(Mutex::new(session));
        self.schedule_timers(&session);
        self.session = Some(session);
        self.state = PluginState::Running;

        info!(
            "{} plugin started with {} device(s), {:?} mode",
            PLUGIN_NAME, count, self.config.mode
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state != PluginState::Running {
            return Err(Error::NotRunning);
        }
        self.state = PluginState::Stopping;

        for timer in self.timers.drain(..) {
            self.adaptor.remove_timeout(timer);
        }

        if let Some(session) = self.session.take() {
            lock(&session).teardown();
            debug!("Released USB context");
        }

        self.state = PluginState::Stopped;
        info!("{} plugin stopped", PLUGIN_NAME);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.state == PluginState::Running
    }
}

impl Drop for UsbDmxPlugin {
    fn drop(&mut self) {
        if self.state == PluginState::Running
            && let Err(e) = self.stop()
        {
            warn!("Failed to stop {} plugin on drop: {}", PLUGIN_NAME, e);
        }
    }
}

/// Plugin table entry
pub fn registration(config: UsbDmxConfig) -> PluginRegistration {
    PluginRegistration::new(
        PLUGIN_NAME,
        Box::new(move |adaptor| Box::new(UsbDmxPlugin::new(adaptor, config.clone()))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeUsbContext, FakeUsbDevice};
    use common::test_utils::RecordingAdaptor;

    fn make_plugin(
        context: &FakeUsbContext,
        config: UsbDmxConfig,
    ) -> (Arc<RecordingAdaptor>, UsbDmxPlugin) {
        let adaptor = Arc::new(RecordingAdaptor::new());
        let plugin = UsbDmxPlugin::with_subsystem(adaptor.clone(), context.subsystem(), config);
        (adaptor, plugin)
    }

    #[test]
    fn test_description_and_name() {
        let context = FakeUsbContext::new();
        let (_adaptor, plugin) = make_plugin(&context, UsbDmxConfig::default());
        assert_eq!(plugin.name(), "USB DMX");
        assert!(plugin.description().contains("Fadecandy"));
        assert!(plugin.description().contains("Velleman K8062"));
        assert_eq!(plugin.state(), PluginState::Stopped);
    }

    #[test]
    fn test_start_twice_fails() {
        let context = FakeUsbContext::new();
        let (_adaptor, mut plugin) = make_plugin(&context, UsbDmxConfig::default());
        plugin.start().unwrap();
        assert!(matches!(plugin.start(), Err(Error::AlreadyRunning)));
        plugin.stop().unwrap();
        assert!(matches!(plugin.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn test_context_failure_leaves_plugin_stopped() {
        let context = FakeUsbContext::new();
        context.attach(FakeUsbDevice::eurolite(1, 2, "EL"));
        context.fail_open(true);
        let (adaptor, mut plugin) = make_plugin(&context, UsbDmxConfig::default());

        assert!(plugin.start().is_err());
        assert_eq!(plugin.state(), PluginState::Stopped);
        assert!(adaptor.devices().is_empty());
        assert!(adaptor.timer_periods().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected_on_start() {
        let context = FakeUsbContext::new();
        let config = UsbDmxConfig {
            pump_interval_ms: 0,
            ..UsbDmxConfig::default()
        };
        let (_adaptor, mut plugin) = make_plugin(&context, config);
        assert!(matches!(plugin.start(), Err(Error::Config(_))));
        assert!(!plugin.is_enabled());
    }

    #[test]
    fn test_timers_follow_mode() {
        let context = FakeUsbContext::new();
        let (adaptor, mut plugin) = make_plugin(&context, UsbDmxConfig::default());
        plugin.start().unwrap();
        assert_eq!(adaptor.timer_periods(), vec![Duration::from_secs(2)]);
        plugin.stop().unwrap();
        assert!(adaptor.timer_periods().is_empty());

        let config = UsbDmxConfig {
            mode: TransferMode::Asynchronous,
            ..UsbDmxConfig::default()
        };
        let (adaptor, mut plugin) = make_plugin(&context, config);
        plugin.start().unwrap();
        assert_eq!(
            adaptor.timer_periods(),
            vec![Duration::from_secs(2), Duration::from_millis(10)]
        );
        plugin.stop().unwrap();
    }

    #[test]
    fn test_registration_creates_plugin() {
        let registration = registration(UsbDmxConfig::default());
        assert_eq!(registration.name, PLUGIN_NAME);
        let plugin = registration.create(Arc::new(RecordingAdaptor::new()));
        assert_eq!(plugin.name(), PLUGIN_NAME);
        assert!(!plugin.is_enabled());
    }
}
