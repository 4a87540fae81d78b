//! Art-Net plugin integration tests
//!
//! Runs the node on loopback against the recording host adaptor and a plain
//! UDP socket standing in for the rest of the network.
//!
//! Run with: `cargo test -p artnet --test plugin_tests`

use artnet::packet::{self, ArtDmx, ArtPoll, Packet};
use artnet::{ArtNetConfig, ArtNetPlugin, PluginState};
use common::test_utils::{Journal, RecordingAdaptor};
use common::{Device, DmxBuffer, Error, Plugin, PortDirection};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

/// A controller on loopback that receives whatever the node sends
fn controller() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(WAIT)).unwrap();
    socket
}

fn config_for(controller: &UdpSocket) -> ArtNetConfig {
    ArtNetConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        broadcast_address: "127.0.0.1".into(),
        destination_port: controller.local_addr().unwrap().port(),
        ..Default::default()
    }
}

fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buffer = [0u8; 1024];
    let (len, source) = socket.recv_from(&mut buffer).unwrap();
    (packet::decode(&buffer[..len]).unwrap(), source)
}

fn try_recv_packet(socket: &UdpSocket) -> Option<(Packet, SocketAddr)> {
    socket.set_nonblocking(true).unwrap();
    let mut buffer = [0u8; 1024];
    let received = socket.recv_from(&mut buffer).ok();
    socket.set_nonblocking(false).unwrap();
    received.map(|(len, source)| (packet::decode(&buffer[..len]).unwrap(), source))
}

/// Fire readable callbacks until `done` holds
fn pump_until(adaptor: &RecordingAdaptor, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        for fd in adaptor.registered_fds() {
            adaptor.fire_readable(fd);
        }
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_start_registers_one_device_and_two_fds() {
    let socket = controller();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let mut plugin = ArtNetPlugin::new(adaptor.clone(), config_for(&socket));

    plugin.start().unwrap();
    assert!(plugin.is_enabled());
    assert_eq!(adaptor.devices(), vec!["artnet".to_string()]);
    assert_eq!(adaptor.registered_fds().len(), 2);

    let device = adaptor.device("artnet").unwrap();
    assert_eq!(device.ports().len(), 8);

    plugin.stop().unwrap();
}

#[test]
fn test_start_twice_fails() {
    let socket = controller();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let mut plugin = ArtNetPlugin::new(adaptor.clone(), config_for(&socket));

    plugin.start().unwrap();
    assert!(matches!(plugin.start(), Err(Error::AlreadyRunning)));
    assert_eq!(adaptor.devices().len(), 1);
    assert_eq!(adaptor.journal().count("register_device:artnet"), 1);
}

#[test]
fn test_stop_without_start_fails() {
    let mut plugin = ArtNetPlugin::new(Arc::new(RecordingAdaptor::new()), ArtNetConfig::default());
    assert!(matches!(plugin.stop(), Err(Error::NotRunning)));
    assert_eq!(plugin.state(), PluginState::Disabled);
}

#[test]
fn test_stop_unregisters_fds_before_device() {
    let socket = controller();
    let journal = Journal::default();
    let adaptor = Arc::new(RecordingAdaptor::with_journal(journal.clone()));
    let mut plugin = ArtNetPlugin::new(adaptor.clone(), config_for(&socket));

    plugin.start().unwrap();
    let fds = adaptor.registered_fds();
    plugin.stop().unwrap();

    assert!(adaptor.registered_fds().is_empty());
    assert!(adaptor.devices().is_empty());
    let device_gone = journal.position("unregister_device:artnet").unwrap();
    for fd in fds {
        let entry = format!("unregister_fd:{}", fd);
        assert_eq!(journal.count(&entry), 1);
        assert!(journal.position(&entry).unwrap() < device_gone);
    }
    assert!(!plugin.is_enabled());
}

#[test]
fn test_restart_after_stop() {
    let socket = controller();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let mut plugin = ArtNetPlugin::new(adaptor.clone(), config_for(&socket));

    plugin.start().unwrap();
    plugin.stop().unwrap();
    plugin.start().unwrap();
    assert_eq!(adaptor.devices().len(), 1);
    assert_eq!(adaptor.journal().count("register_device:artnet"), 2);
}

#[test]
fn test_destroy_stops_running_plugin() {
    let socket = controller();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let entry = artnet::registration(config_for(&socket));

    let mut plugin = entry.create(adaptor.clone());
    plugin.start().unwrap();
    common::destroy(plugin);

    assert!(adaptor.devices().is_empty());
    assert!(adaptor.registered_fds().is_empty());
}

// ============================================================================
// Data path
// ============================================================================

#[test]
fn test_output_port_sends_artdmx() {
    let socket = controller();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let mut plugin = ArtNetPlugin::new(adaptor.clone(), config_for(&socket));
    plugin.start().unwrap();

    let device = adaptor.device("artnet").unwrap();
    device.patch(PortDirection::Output, 2, Some(10)).unwrap();
    device
        .write_dmx(2, &DmxBuffer::from_slice(&[255, 128, 0]))
        .unwrap();
    device.write_dmx(2, &DmxBuffer::from_slice(&[1])).unwrap();

    let (first, _) = recv_packet(&socket);
    let (second, _) = recv_packet(&socket);
    match (first, second) {
        (Packet::Dmx(first), Packet::Dmx(second)) => {
            assert_eq!(first.universe, 10);
            assert_eq!(first.physical, 2);
            assert_eq!(first.sequence, 1);
            assert_eq!(&first.data.as_slice()[..3], &[255, 128, 0]);
            assert_eq!(second.sequence, 2);
        }
        other => panic!("expected two ArtDmx packets, got {:?}", other),
    }
}

#[test]
fn test_unpatched_output_sends_nothing() {
    let socket = controller();
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let mut plugin = ArtNetPlugin::new(adaptor.clone(), config_for(&socket));
    plugin.start().unwrap();

    let device = adaptor.device("artnet").unwrap();
    device.write_dmx(0, &DmxBuffer::from_slice(&[1])).unwrap();

    let mut buffer = [0u8; 1024];
    assert!(socket.recv_from(&mut buffer).is_err());
}

#[test]
fn test_input_port_keeps_latest_frame() {
    let socket = controller();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let mut plugin = ArtNetPlugin::new(adaptor.clone(), config_for(&socket));
    plugin.start().unwrap();

    let node = plugin.device().unwrap().listen_address().unwrap();
    let device = adaptor.device("artnet").unwrap();
    device.patch(PortDirection::Input, 1, Some(7)).unwrap();

    for (universe, value) in [(7, 10), (8, 99), (7, 20)] {
        let frame = ArtDmx {
            sequence: 1,
            physical: 0,
            universe,
            data: DmxBuffer::from_slice(&[value; 4]),
        };
        socket.send_to(&frame.encode(), node).unwrap();
    }
    // garbage is ignored
    socket.send_to(b"not art-net", node).unwrap();

    assert!(pump_until(&adaptor, || {
        device.read_dmx(1).is_some_and(|frame| frame.get(0) == 20)
    }));
    assert_eq!(device.read_dmx(0), None);
}

#[test]
fn test_poll_is_answered() {
    let socket = controller();
    let adaptor = Arc::new(RecordingAdaptor::new());
    let mut plugin = ArtNetPlugin::new(
        adaptor.clone(),
        ArtNetConfig {
            short_name: "rig-a".into(),
            ..config_for(&socket)
        },
    );
    plugin.start().unwrap();

    let node = plugin.device().unwrap().listen_address().unwrap();
    let device = adaptor.device("artnet").unwrap();
    device.patch(PortDirection::Output, 0, Some(3)).unwrap();

    socket
        .send_to(&ArtPoll::default().encode(), node)
        .unwrap();
    let mut received = None;
    assert!(pump_until(&adaptor, || {
        received = try_recv_packet(&socket);
        received.is_some()
    }));

    let (reply, source) = received.unwrap();
    assert_eq!(source, node);
    match reply {
        Packet::PollReply(reply) => {
            assert_eq!(reply.short_name, "rig-a");
            assert_eq!(reply.port, node.port());
            assert_eq!(reply.outputs, [Some(3), None, None, None]);
            assert_eq!(reply.inputs, [None; 4]);
        }
        other => panic!("expected ArtPollReply, got {:?}", other),
    }
}
