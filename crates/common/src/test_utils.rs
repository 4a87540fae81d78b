//! Test utilities for dmxd
//!
//! Provides an instrumented [`PluginAdaptor`] that records every host call in
//! order, so tests can assert on registration ordering across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{Journal, RecordingAdaptor};
//!
//! let journal = Journal::default();
//! let adaptor = RecordingAdaptor::with_journal(journal.clone());
//! assert!(adaptor.devices().is_empty());
//! journal.record("marker");
//! assert_eq!(journal.entries(), vec!["marker".to_string()]);
//! ```

use crate::error::{Error, Result};
use crate::host::{Device, Interest, PluginAdaptor, ReadableTarget, TimerId};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared, ordered log of events
///
/// Cloning a journal shares the underlying log, so fakes in different crates
/// can write into the same timeline.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Index of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e == entry)
    }

    /// Number of entries equal to `entry`
    pub fn count(&self, entry: &str) -> usize {
        lock(&self.0).iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

type TimerCallback = Arc<Mutex<Box<dyn FnMut() + Send>>>;

/// A host adaptor that records calls instead of running a reactor
///
/// Journal entries use the form `register_fd:<fd>`, `unregister_fd:<fd>`,
/// `register_device:<id>`, `unregister_device:<id>`, `schedule_timer:<id>`
/// and `remove_timer:<id>`.
#[derive(Default)]
pub struct RecordingAdaptor {
    journal: Journal,
    fds: Mutex<HashMap<RawFd, Arc<dyn ReadableTarget>>>,
    devices: Mutex<BTreeMap<String, Arc<dyn Device>>>,
    timers: Mutex<BTreeMap<u64, (Duration, TimerCallback)>>,
    next_timer: AtomicU64,
}

impl RecordingAdaptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Ids of currently registered devices, sorted
    pub fn devices(&self) -> Vec<String> {
        lock(&self.devices).keys().cloned().collect()
    }

    pub fn device(&self, id: &str) -> Option<Arc<dyn Device>> {
        lock(&self.devices).get(id).cloned()
    }

    /// Currently registered descriptors, sorted
    pub fn registered_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = lock(&self.fds).keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    /// Periods of the timers currently scheduled
    pub fn timer_periods(&self) -> Vec<Duration> {
        lock(&self.timers).values().map(|(period, _)| *period).collect()
    }

    /// Run every scheduled timer callback once, in scheduling order
    pub fn fire_timers(&self) {
        let callbacks: Vec<TimerCallback> = lock(&self.timers)
            .values()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            let mut callback = lock(&callback);
            (*callback)();
        }
    }

    /// Deliver a readiness callback for `fd`
    ///
    /// Returns false if the descriptor is not registered.
    pub fn fire_readable(&self, fd: RawFd) -> bool {
        let target = lock(&self.fds).get(&fd).cloned();
        match target {
            Some(target) => {
                target.on_readable(fd);
                true
            }
            None => false,
        }
    }
}

impl PluginAdaptor for RecordingAdaptor {
    fn register_fd(
        &self,
        fd: RawFd,
        _interest: Interest,
        target: Arc<dyn ReadableTarget>,
    ) -> Result<()> {
        let mut fds = lock(&self.fds);
        if fds.contains_key(&fd) {
            return Err(Error::DuplicateDescriptor(fd));
        }
        fds.insert(fd, target);
        self.journal.record(format!("register_fd:{}", fd));
        Ok(())
    }

    fn unregister_fd(&self, fd: RawFd, _interest: Interest) -> Result<()> {
        self.journal.record(format!("unregister_fd:{}", fd));
        lock(&self.fds)
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| Error::Other(format!("descriptor {} not registered", fd)))
    }

    fn register_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let id = device.id().to_string();
        let mut devices = lock(&self.devices);
        if devices.contains_key(&id) {
            return Err(Error::DuplicateDevice(id));
        }
        self.journal.record(format!("register_device:{}", id));
        devices.insert(id, device);
        Ok(())
    }

    fn unregister_device(&self, device_id: &str) -> Result<()> {
        self.journal.record(format!("unregister_device:{}", device_id));
        lock(&self.devices)
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))
    }

    fn schedule_repeating(&self, period: Duration, callback: Box<dyn FnMut() + Send>) -> TimerId {
        let id = self.next_timer.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.timers).insert(id, (period, Arc::new(Mutex::new(callback))));
        self.journal.record(format!("schedule_timer:{}", id));
        TimerId(id)
    }

    fn remove_timeout(&self, id: TimerId) {
        lock(&self.timers).remove(&id.0);
        self.journal.record(format!("remove_timer:{}", id.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmx::DmxBuffer;
    use crate::host::{PortDirection, PortInfo};
    use std::sync::atomic::AtomicUsize;

    struct NullDevice(&'static str);

    impl Device for NullDevice {
        fn id(&self) -> &str {
            self.0
        }
        fn name(&self) -> &str {
            "null"
        }
        fn ports(&self) -> Vec<PortInfo> {
            Vec::new()
        }
        fn patch(&self, _: PortDirection, port: u8, _: Option<u8>) -> Result<()> {
            Err(Error::NoSuchPort(port))
        }
        fn write_dmx(&self, port: u8, _: &DmxBuffer) -> Result<()> {
            Err(Error::NoSuchPort(port))
        }
    }

    struct CountingTarget(AtomicUsize);

    impl ReadableTarget for CountingTarget {
        fn on_readable(&self, _fd: RawFd) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_device_registration_is_recorded() {
        let adaptor = RecordingAdaptor::new();
        adaptor.register_device(Arc::new(NullDevice("a"))).unwrap();
        assert!(adaptor.register_device(Arc::new(NullDevice("a"))).is_err());
        assert_eq!(adaptor.devices(), vec!["a".to_string()]);

        adaptor.unregister_device("a").unwrap();
        assert!(adaptor.devices().is_empty());
        assert!(adaptor.unregister_device("a").is_err());
        assert_eq!(adaptor.journal().count("unregister_device:a"), 2);
    }

    #[test]
    fn test_fd_callbacks() {
        let adaptor = RecordingAdaptor::new();
        let target = Arc::new(CountingTarget(AtomicUsize::new(0)));
        adaptor.register_fd(7, Interest::Read, target.clone()).unwrap();
        assert!(adaptor.fire_readable(7));
        assert_eq!(target.0.load(Ordering::SeqCst), 1);

        adaptor.unregister_fd(7, Interest::Read).unwrap();
        assert!(!adaptor.fire_readable(7));
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timers_fire_until_removed() {
        let adaptor = RecordingAdaptor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = adaptor.schedule_repeating(
            Duration::from_secs(1),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        adaptor.fire_timers();
        adaptor.fire_timers();
        adaptor.remove_timeout(id);
        adaptor.fire_timers();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(adaptor.timer_periods().is_empty());
    }
}
