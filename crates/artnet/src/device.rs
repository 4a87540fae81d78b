//! Art-Net node device
//!
//! Two UDP sockets while started: a listener on the configured port and a
//! broadcast-enabled sender on an ephemeral port. Both are non-blocking and
//! serviced from the host reactor through [`ReadableTarget`].

use crate::config::ArtNetConfig;
use crate::error::{ArtNetError, Result};
use crate::packet::{self, ArtDmx, ArtPollReply, Packet};
use crate::port::PortTable;
use common::{Device, DmxBuffer, PortDirection, PortInfo, ReadableTarget};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

pub const DEVICE_ID: &str = "artnet";
const DEVICE_NAME: &str = "Art-Net";

const RECV_BUFFER_SIZE: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Sockets {
    listener: UdpSocket,
    sender: UdpSocket,
    destination: SocketAddr,
}

impl Sockets {
    fn bind(config: &ArtNetConfig) -> Result<Self> {
        let listen = config.listen_address()?;
        let destination = config.destination()?;

        let listener = UdpSocket::bind(listen)?;
        listener.set_nonblocking(true)?;

        let sender = UdpSocket::bind(SocketAddr::new(listen.ip(), 0))?;
        sender.set_broadcast(true)?;
        sender.set_nonblocking(true)?;

        Ok(Self {
            listener,
            sender,
            destination,
        })
    }

    fn by_fd(&self, fd: RawFd) -> Option<&UdpSocket> {
        [&self.listener, &self.sender]
            .into_iter()
            .find(|socket| socket.as_raw_fd() == fd)
    }

    fn is_own(&self, source: SocketAddr) -> bool {
        self.sender
            .local_addr()
            .is_ok_and(|local| local.port() == source.port())
    }
}

/// The single device of the Art-Net plugin
pub struct ArtNetDevice {
    config: ArtNetConfig,
    ports: Mutex<PortTable>,
    sockets: Mutex<Option<Sockets>>,
}

impl ArtNetDevice {
    pub fn new(config: ArtNetConfig) -> Self {
        Self {
            config,
            ports: Mutex::new(PortTable::new()),
            sockets: Mutex::new(None),
        }
    }

    /// Bind both sockets
    pub fn start(&self) -> Result<()> {
        let mut sockets = lock(&self.sockets);
        if sockets.is_some() {
            return Err(ArtNetError::AlreadyStarted);
        }
        let bound = Sockets::bind(&self.config)?;
        info!(
            "Art-Net node listening on {}, sending to {}",
            bound.listener.local_addr()?,
            bound.destination
        );
        *sockets = Some(bound);
        Ok(())
    }

    /// Close both sockets
    pub fn stop(&self) -> Result<()> {
        match lock(&self.sockets).take() {
            Some(_) => {
                debug!("Art-Net node sockets closed");
                Ok(())
            }
            None => Err(ArtNetError::NotStarted),
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.sockets).is_some()
    }

    /// Descriptors to register for read readiness
    pub fn fds(&self) -> Vec<RawFd> {
        lock(&self.sockets)
            .as_ref()
            .map(|s| vec![s.listener.as_raw_fd(), s.sender.as_raw_fd()])
            .unwrap_or_default()
    }

    /// Bound listener address, once started
    pub fn listen_address(&self) -> Option<SocketAddr> {
        lock(&self.sockets)
            .as_ref()
            .and_then(|s| s.listener.local_addr().ok())
    }

    fn transmit(&self, port: u8, universe: u8, sequence: u8, buffer: &DmxBuffer) -> Result<()> {
        let datagram = ArtDmx {
            sequence,
            physical: port,
            universe: universe as u16,
            data: buffer.clone(),
        }
        .encode();

        let sockets = lock(&self.sockets);
        let sockets = sockets.as_ref().ok_or(ArtNetError::NotStarted)?;
        match sockets.sender.send_to(&datagram, sockets.destination) {
            Ok(_) => Ok(()),
            // a full send buffer drops the frame, the next one supersedes it
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Send buffer full, dropped frame for universe {}", universe);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn handle_packet(
        &self,
        sockets: &Sockets,
        socket: &UdpSocket,
        datagram: &[u8],
        source: SocketAddr,
    ) {
        match packet::decode(datagram) {
            Ok(Packet::Dmx(dmx)) => {
                let updated = lock(&self.ports).store_input(dmx.universe, &dmx.data);
                trace!(
                    "ArtDmx for universe {} from {} updated {} port(s)",
                    dmx.universe, source, updated
                );
            }
            Ok(Packet::Poll(_)) => {
                debug!("ArtPoll from {}", source);
                let reply = self.poll_reply(sockets).encode();
                if let Err(e) = socket.send_to(&reply, source) {
                    warn!("Failed to answer ArtPoll from {}: {}", source, e);
                }
            }
            Ok(Packet::PollReply(reply)) => {
                trace!("ArtPollReply from {} ({})", source, reply.short_name);
            }
            Err(e) => debug!("Ignoring datagram from {}: {}", source, e),
        }
    }

    fn poll_reply(&self, sockets: &Sockets) -> ArtPollReply {
        let (address, port) = match sockets.listener.local_addr() {
            Ok(SocketAddr::V4(addr)) => (*addr.ip(), addr.port()),
            _ => (Ipv4Addr::UNSPECIFIED, self.config.port),
        };
        let ports = lock(&self.ports);
        ArtPollReply {
            address,
            port,
            short_name: self.config.short_name.clone(),
            long_name: self.config.long_name.clone(),
            node_report: "#0001 [0000] dmxd Art-Net node running".to_string(),
            inputs: ports.input_universes(),
            outputs: ports.output_universes(),
        }
    }
}

impl ReadableTarget for ArtNetDevice {
    fn on_readable(&self, fd: RawFd) {
        let sockets = lock(&self.sockets);
        let Some(sockets) = sockets.as_ref() else {
            return;
        };
        let Some(socket) = sockets.by_fd(fd) else {
            warn!("Readable callback for unknown descriptor {}", fd);
            return;
        };

        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buffer) {
                Ok((len, source)) => {
                    if sockets.is_own(source) {
                        continue;
                    }
                    self.handle_packet(sockets, socket, &buffer[..len], source);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Art-Net receive failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl Device for ArtNetDevice {
    fn id(&self) -> &str {
        DEVICE_ID
    }

    fn name(&self) -> &str {
        DEVICE_NAME
    }

    fn ports(&self) -> Vec<PortInfo> {
        lock(&self.ports).info()
    }

    fn patch(&self, direction: PortDirection, port: u8, universe: Option<u8>) -> common::Result<()> {
        lock(&self.ports).patch(direction, port, universe)?;
        debug!("Patched Art-Net {} port {} to universe {:?}", direction, port, universe);
        Ok(())
    }

    fn write_dmx(&self, port: u8, buffer: &DmxBuffer) -> common::Result<()> {
        let Some((universe, sequence)) = lock(&self.ports).next_output(port)? else {
            trace!("Dropping frame for unpatched output port {}", port);
            return Ok(());
        };
        self.transmit(port, universe, sequence, buffer)
            .map_err(Into::into)
    }

    fn read_dmx(&self, port: u8) -> Option<DmxBuffer> {
        lock(&self.ports).latest_input(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback_config() -> ArtNetConfig {
        ArtNetConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            broadcast_address: "127.0.0.1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_start_stop() {
        let device = ArtNetDevice::new(loopback_config());
        assert!(device.fds().is_empty());

        device.start().unwrap();
        assert!(matches!(device.start(), Err(ArtNetError::AlreadyStarted)));
        let fds = device.fds();
        assert_eq!(fds.len(), 2);
        assert_ne!(fds[0], fds[1]);
        assert!(device.listen_address().is_some());

        device.stop().unwrap();
        assert!(!device.is_started());
        assert!(matches!(device.stop(), Err(ArtNetError::NotStarted)));
    }

    #[test]
    fn test_invalid_bind_address_fails_start() {
        let device = ArtNetDevice::new(ArtNetConfig {
            bind_address: "nowhere".into(),
            ..Default::default()
        });
        assert!(matches!(device.start(), Err(ArtNetError::Address(_))));
        assert!(!device.is_started());
    }

    #[test]
    fn test_write_unpatched_port_is_dropped() {
        let device = ArtNetDevice::new(loopback_config());
        device.start().unwrap();
        device.write_dmx(1, &DmxBuffer::from_slice(&[1])).unwrap();
        assert!(device.write_dmx(4, &DmxBuffer::new()).is_err());
    }

    #[test]
    fn test_write_before_start_fails() {
        let device = ArtNetDevice::new(loopback_config());
        device.patch(PortDirection::Output, 0, Some(1)).unwrap();
        assert!(device.write_dmx(0, &DmxBuffer::from_slice(&[1])).is_err());
    }

    #[test]
    fn test_own_packets_are_ignored() {
        let device = ArtNetDevice::new(loopback_config());
        device.start().unwrap();
        let listen = device.listen_address().unwrap();

        // send our own output back to our own listener
        {
            let sockets = lock(&device.sockets);
            let sockets = sockets.as_ref().unwrap();
            let frame = ArtDmx {
                sequence: 1,
                physical: 0,
                universe: 3,
                data: DmxBuffer::from_slice(&[42]),
            };
            sockets.sender.send_to(&frame.encode(), listen).unwrap();
        }
        device.patch(PortDirection::Input, 0, Some(3)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        for fd in device.fds() {
            device.on_readable(fd);
        }
        assert_eq!(device.read_dmx(0), None);
    }
}
