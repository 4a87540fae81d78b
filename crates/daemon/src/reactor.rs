//! Host reactor on top of tokio
//!
//! Descriptor readiness runs through `AsyncFd`, repeating timers through
//! `tokio::time::interval`. Every registration carries a [`Gate`]: callbacks
//! run while holding it, and closing it waits for a running callback, so once
//! `unregister_fd` or `remove_timeout` returns nothing for that registration
//! runs again. Unregistering from inside the registration's own callback
//! would deadlock and is not supported.

use common::{Device, Error, Interest, PluginAdaptor, ReadableTarget, Result, TimerId};
use std::collections::{BTreeMap, HashMap};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Upper bound on waiting for a descriptor task to drop its registration
const FD_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Gate {
    open: Mutex<bool>,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(true),
        })
    }

    /// Run `f` unless the gate is closed; returns whether it ran
    fn run(&self, f: impl FnOnce()) -> bool {
        let open = lock(&self.open);
        if !*open {
            return false;
        }
        f();
        true
    }

    fn close(&self) {
        *lock(&self.open) = false;
    }
}

/// A descriptor owned by a plugin, borrowed for readiness polling
struct Descriptor(RawFd);

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct FdRegistration {
    gate: Arc<Gate>,
    stop: oneshot::Sender<()>,
    /// Disconnects once the task has dropped its `AsyncFd`
    exited: mpsc::Receiver<()>,
}

struct TimerRegistration {
    gate: Arc<Gate>,
    task: JoinHandle<()>,
}

pub struct Reactor {
    handle: Handle,
    fds: Mutex<HashMap<RawFd, FdRegistration>>,
    timers: Mutex<HashMap<TimerId, TimerRegistration>>,
    next_timer: AtomicU64,
    devices: Mutex<BTreeMap<String, Arc<dyn Device>>>,
}

impl Reactor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            fds: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(1),
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Ids of all registered devices, sorted
    pub fn device_ids(&self) -> Vec<String> {
        lock(&self.devices).keys().cloned().collect()
    }

    pub fn device(&self, id: &str) -> Option<Arc<dyn Device>> {
        lock(&self.devices).get(id).cloned()
    }

    pub fn fd_count(&self) -> usize {
        lock(&self.fds).len()
    }

    pub fn timer_count(&self) -> usize {
        lock(&self.timers).len()
    }
}

/// Block until the descriptor task has exited
///
/// A current-thread runtime cannot make progress on the task while we
/// block, so there the closed gate is the only guarantee.
fn wait_for_exit(exited: mpsc::Receiver<()>) {
    let wait = || {
        let _ = exited.recv_timeout(FD_EXIT_TIMEOUT);
    };
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(wait),
        Ok(_) => {}
        Err(_) => wait(),
    }
}

impl PluginAdaptor for Reactor {
    fn register_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        target: Arc<dyn ReadableTarget>,
    ) -> Result<()> {
        let mut fds = lock(&self.fds);
        if fds.contains_key(&fd) {
            return Err(Error::DuplicateDescriptor(fd));
        }

        let async_fd = {
            let _runtime = self.handle.enter();
            AsyncFd::with_interest(Descriptor(fd), tokio::io::Interest::READABLE)?
        };

        let gate = Gate::new();
        let (stop, mut stop_rx) = oneshot::channel();
        let (exited_tx, exited) = mpsc::channel::<()>();
        let task_gate = gate.clone();

        self.handle.spawn(async move {
            let _exited = exited_tx;
            let async_fd = async_fd;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    ready = async_fd.readable() => {
                        let mut guard = match ready {
                            Ok(guard) => guard,
                            Err(e) => {
                                warn!("Readiness polling failed for fd {}: {}", fd, e);
                                break;
                            }
                        };
                        if !task_gate.run(|| target.on_readable(fd)) {
                            break;
                        }
                        guard.clear_ready();
                    }
                }
            }
            trace!("Descriptor task for fd {} exiting", fd);
        });

        fds.insert(fd, FdRegistration { gate, stop, exited });
        debug!("Registered fd {} for {:?}", fd, interest);
        Ok(())
    }

    fn unregister_fd(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let registration = lock(&self.fds)
            .remove(&fd)
            .ok_or_else(|| Error::Other(format!("fd {} is not registered", fd)))?;

        registration.gate.close();
        let _ = registration.stop.send(());
        wait_for_exit(registration.exited);
        debug!("Unregistered fd {} for {:?}", fd, interest);
        Ok(())
    }

    fn register_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let mut devices = lock(&self.devices);
        let id = device.id().to_string();
        if devices.contains_key(&id) {
            return Err(Error::DuplicateDevice(id));
        }
        debug!("Registered device {} ({})", id, device.name());
        devices.insert(id, device);
        Ok(())
    }

    fn unregister_device(&self, device_id: &str) -> Result<()> {
        lock(&self.devices)
            .remove(device_id)
            .map(|_| debug!("Unregistered device {}", device_id))
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))
    }

    fn schedule_repeating(
        &self,
        period: Duration,
        mut callback: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed));
        let gate = Gate::new();
        let task_gate = gate.clone();

        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !task_gate.run(&mut callback) {
                    break;
                }
            }
        });

        lock(&self.timers).insert(id, TimerRegistration { gate, task });
        debug!("Scheduled timer {} every {:?}", id.0, period);
        id
    }

    fn remove_timeout(&self, id: TimerId) {
        let Some(registration) = lock(&self.timers).remove(&id) else {
            warn!("Timer {} is not scheduled", id.0);
            return;
        };
        registration.gate.close();
        registration.task.abort();
        debug!("Removed timer {}", id.0);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for (_, registration) in lock(&self.timers).drain() {
            registration.gate.close();
            registration.task.abort();
        }
        for (fd, registration) in lock(&self.fds).drain() {
            warn!("fd {} still registered at shutdown", fd);
            registration.gate.close();
            let _ = registration.stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DmxBuffer, PortDirection, PortInfo};
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Counter(AtomicUsize);

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(0)))
        }

        fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Drains a socket on every readable callback
    struct Drain {
        socket: UdpSocket,
        reads: Arc<Counter>,
    }

    impl ReadableTarget for Drain {
        fn on_readable(&self, _fd: RawFd) {
            let mut buffer = [0u8; 64];
            while self.socket.recv_from(&mut buffer).is_ok() {
                self.reads.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct Dummy(&'static str);

    impl Device for Dummy {
        fn id(&self) -> &str {
            self.0
        }

        fn name(&self) -> &str {
            "dummy"
        }

        fn ports(&self) -> Vec<PortInfo> {
            Vec::new()
        }

        fn patch(&self, _direction: PortDirection, port: u8, _universe: Option<u8>) -> Result<()> {
            Err(Error::NoSuchPort(port))
        }

        fn write_dmx(&self, port: u8, _buffer: &DmxBuffer) -> Result<()> {
            Err(Error::NoSuchPort(port))
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    fn bound_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readable_callback_fires() {
        let reactor = Reactor::new(Handle::current());
        let reads = Counter::new();
        let socket = bound_socket();
        let address = socket.local_addr().unwrap();
        let fd = socket.as_raw_fd();

        reactor
            .register_fd(
                fd,
                Interest::Read,
                Arc::new(Drain {
                    socket,
                    reads: reads.clone(),
                }),
            )
            .unwrap();
        assert_eq!(reactor.fd_count(), 1);

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"one", address).unwrap();
        sender.send_to(b"two", address).unwrap();
        assert!(eventually(|| reads.get() == 2).await);

        reactor.unregister_fd(fd, Interest::Read).unwrap();
        assert_eq!(reactor.fd_count(), 0);

        sender.send_to(b"three", address).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reads.get(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_and_unknown_fds() {
        let reactor = Reactor::new(Handle::current());
        let socket = bound_socket();
        let fd = socket.as_raw_fd();
        let target = Arc::new(Drain {
            socket,
            reads: Counter::new(),
        });

        reactor
            .register_fd(fd, Interest::Read, target.clone())
            .unwrap();
        assert!(matches!(
            reactor.register_fd(fd, Interest::Read, target),
            Err(Error::DuplicateDescriptor(_))
        ));
        reactor.unregister_fd(fd, Interest::Read).unwrap();
        assert!(reactor.unregister_fd(fd, Interest::Read).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_repeats_until_removed() {
        let reactor = Reactor::new(Handle::current());
        let ticks = Counter::new();
        let counter = ticks.clone();

        let id = reactor.schedule_repeating(
            Duration::from_millis(10),
            Box::new(move || {
                counter.0.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(reactor.timer_count(), 1);
        assert!(eventually(|| ticks.get() >= 3).await);

        reactor.remove_timeout(id);
        let after_remove = ticks.get();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.get(), after_remove);
        assert_eq!(reactor.timer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_waits_for_running_callback() {
        let reactor = Reactor::new(Handle::current());
        let finished = Counter::new();
        let started = Counter::new();
        let (done, running) = (finished.clone(), started.clone());

        let id = reactor.schedule_repeating(
            Duration::from_millis(5),
            Box::new(move || {
                running.0.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                done.0.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(eventually(|| started.get() >= 1).await);

        tokio::task::block_in_place(|| reactor.remove_timeout(id));
        // whatever started has also finished
        assert_eq!(started.get(), finished.get());
        let settled = finished.get();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(finished.get(), settled);
    }

    #[tokio::test]
    async fn test_device_registry() {
        let reactor = Reactor::new(Handle::current());
        reactor.register_device(Arc::new(Dummy("b"))).unwrap();
        reactor.register_device(Arc::new(Dummy("a"))).unwrap();
        assert!(matches!(
            reactor.register_device(Arc::new(Dummy("a"))),
            Err(Error::DuplicateDevice(_))
        ));
        assert_eq!(reactor.device_ids(), vec!["a", "b"]);
        assert_eq!(reactor.device("b").unwrap().name(), "dummy");

        reactor.unregister_device("a").unwrap();
        assert!(matches!(
            reactor.unregister_device("a"),
            Err(Error::UnknownDevice(_))
        ));
        assert_eq!(reactor.device_ids(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_remove_unknown_timer_is_harmless() {
        let reactor = Reactor::new(Handle::current());
        reactor.remove_timeout(TimerId(42));
        assert_eq!(reactor.timer_count(), 0);
    }
}
