//! Art-Net packet codec
//!
//! Only the packets a simple node needs: ArtDmx in both directions, ArtPoll
//! in and ArtPollReply out.

use crate::error::PacketError;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use common::{DMX_UNIVERSE_SIZE, DmxBuffer};
use std::io::{Cursor, Read};
use std::net::Ipv4Addr;

pub const ARTNET_PORT: u16 = 6454;
pub const ARTNET_ID: &[u8; 8] = b"Art-Net\0";
pub const PROTOCOL_VERSION: u16 = 14;

pub const OP_POLL: u16 = 0x2000;
pub const OP_POLL_REPLY: u16 = 0x2100;
pub const OP_DMX: u16 = 0x5000;

/// Fixed size of an ArtPollReply
pub const POLL_REPLY_SIZE: usize = 239;

const HEADER_SIZE: usize = 10;
const DMX_HEADER_SIZE: usize = 18;
const SHORT_NAME_SIZE: usize = 18;
const LONG_NAME_SIZE: usize = 64;
const NODE_REPORT_SIZE: usize = 64;

/// Ports described in one poll reply
pub const PORTS_PER_REPLY: usize = 4;

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Dmx(ArtDmx),
    Poll(ArtPoll),
    PollReply(Box<ArtPollReply>),
}

/// OpDmx: one universe of DMX data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtDmx {
    /// 1..=255, 0 disables sequencing
    pub sequence: u8,
    /// Physical input port the data came from
    pub physical: u8,
    /// 15-bit port address
    pub universe: u16,
    pub data: DmxBuffer,
}

impl ArtDmx {
    pub fn encode(&self) -> Vec<u8> {
        // Length must be even and at least 2
        let mut length = self.data.len().max(2);
        if length % 2 == 1 {
            length += 1;
        }
        let length = length.min(DMX_UNIVERSE_SIZE);

        let mut packet = Vec::with_capacity(DMX_HEADER_SIZE + length);
        write_header(&mut packet, OP_DMX);
        packet.push(self.sequence);
        packet.push(self.physical);
        // Writing to a Vec cannot fail
        let _ = packet.write_u16::<LittleEndian>(self.universe);
        let _ = packet.write_u16::<BigEndian>(length as u16);

        let start = packet.len();
        packet.resize(start + length, 0);
        self.data.copy_padded(&mut packet[start..]);
        packet
    }
}

/// OpPoll: a controller looking for nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtPoll {
    pub talk_to_me: u8,
    pub priority: u8,
}

impl ArtPoll {
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(14);
        write_header(&mut packet, OP_POLL);
        packet.push(self.talk_to_me);
        packet.push(self.priority);
        packet
    }
}

/// OpPollReply: a node describing itself
///
/// A reply has a single sub-net for all eight ports. It is taken from the
/// first patched port, inputs before outputs, so a port patched to a universe
/// in another sub-net is reported with the wrong high nibble. Such a port
/// still sends and receives ArtDmx on its own universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtPollReply {
    pub address: Ipv4Addr,
    pub port: u16,
    pub short_name: String,
    pub long_name: String,
    pub node_report: String,
    /// Universe of each input port, if patched
    pub inputs: [Option<u8>; PORTS_PER_REPLY],
    /// Universe of each output port, if patched
    pub outputs: [Option<u8>; PORTS_PER_REPLY],
}

impl ArtPollReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(POLL_REPLY_SIZE);
        packet.extend_from_slice(ARTNET_ID);
        let _ = packet.write_u16::<LittleEndian>(OP_POLL_REPLY);
        packet.extend_from_slice(&self.address.octets());
        let _ = packet.write_u16::<LittleEndian>(self.port);
        let _ = packet.write_u16::<BigEndian>(1); // firmware version

        // Universes are 8 bit: the sub-net carries the high nibble of the
        // first patched port, each SwIn/SwOut the low nibble.
        let subnet = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .flatten()
            .next()
            .map_or(0, |universe| universe >> 4);
        packet.push(0); // net switch
        packet.push(subnet);
        let _ = packet.write_u16::<BigEndian>(0); // OEM
        packet.push(0); // UBEA version
        packet.push(0); // status 1
        let _ = packet.write_u16::<LittleEndian>(0); // ESTA manufacturer

        write_fixed_str(&mut packet, &self.short_name, SHORT_NAME_SIZE);
        write_fixed_str(&mut packet, &self.long_name, LONG_NAME_SIZE);
        write_fixed_str(&mut packet, &self.node_report, NODE_REPORT_SIZE);

        let _ = packet.write_u16::<BigEndian>(PORTS_PER_REPLY as u16);
        // port types: DMX512, can input and output
        packet.extend_from_slice(&[0xC0; PORTS_PER_REPLY]);
        // good input / good output: data received / transmitted
        packet.extend(self.inputs.iter().map(|u| if u.is_some() { 0x80u8 } else { 0 }));
        packet.extend(self.outputs.iter().map(|u| if u.is_some() { 0x80u8 } else { 0 }));
        packet.extend(self.inputs.iter().map(|u| u.unwrap_or(0) & 0x0F));
        packet.extend(self.outputs.iter().map(|u| u.unwrap_or(0) & 0x0F));

        packet.push(0); // video
        packet.push(0); // macro
        packet.push(0); // remote
        packet.extend_from_slice(&[0; 3]); // spare
        packet.push(0); // style: StNode
        packet.extend_from_slice(&[0; 6]); // MAC
        packet.extend_from_slice(&self.address.octets()); // bind IP
        packet.push(0); // bind index
        packet.push(0); // status 2

        packet.resize(POLL_REPLY_SIZE, 0);
        packet
    }

    fn decode(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let mut ip = [0u8; 4];
        cursor.read_exact(&mut ip)?;
        let port = cursor.read_u16::<LittleEndian>()?;
        let _version = cursor.read_u16::<BigEndian>()?;
        let _net = cursor.read_u8()?;
        let subnet = cursor.read_u8()?;
        let mut skip = [0u8; 6];
        cursor.read_exact(&mut skip)?;

        let short_name = read_fixed_str(cursor, SHORT_NAME_SIZE)?;
        let long_name = read_fixed_str(cursor, LONG_NAME_SIZE)?;
        let node_report = read_fixed_str(cursor, NODE_REPORT_SIZE)?;

        let _num_ports = cursor.read_u16::<BigEndian>()?;
        let mut port_types = [0u8; PORTS_PER_REPLY];
        let mut good_input = [0u8; PORTS_PER_REPLY];
        let mut good_output = [0u8; PORTS_PER_REPLY];
        let mut sw_in = [0u8; PORTS_PER_REPLY];
        let mut sw_out = [0u8; PORTS_PER_REPLY];
        cursor.read_exact(&mut port_types)?;
        cursor.read_exact(&mut good_input)?;
        cursor.read_exact(&mut good_output)?;
        cursor.read_exact(&mut sw_in)?;
        cursor.read_exact(&mut sw_out)?;

        let universe = |good: u8, sw: u8| (good & 0x80 != 0).then_some((subnet << 4) | (sw & 0x0F));
        Ok(Self {
            address: Ipv4Addr::from(ip),
            port,
            short_name,
            long_name,
            node_report,
            inputs: std::array::from_fn(|i| universe(good_input[i], sw_in[i])),
            outputs: std::array::from_fn(|i| universe(good_output[i], sw_out[i])),
        })
    }
}

fn write_header(packet: &mut Vec<u8>, opcode: u16) {
    packet.extend_from_slice(ARTNET_ID);
    let _ = packet.write_u16::<LittleEndian>(opcode);
    let _ = packet.write_u16::<BigEndian>(PROTOCOL_VERSION);
}

/// Null-padded ASCII field; the last byte is always a terminator
fn write_fixed_str(packet: &mut Vec<u8>, value: &str, size: usize) {
    let bytes: Vec<u8> = value
        .bytes()
        .filter(u8::is_ascii)
        .take(size - 1)
        .collect();
    let start = packet.len();
    packet.extend_from_slice(&bytes);
    packet.resize(start + size, 0);
}

fn read_fixed_str(cursor: &mut Cursor<&[u8]>, size: usize) -> std::io::Result<String> {
    let mut field = vec![0u8; size];
    cursor.read_exact(&mut field)?;
    let end = field.iter().position(|b| *b == 0).unwrap_or(size);
    Ok(String::from_utf8_lossy(&field[..end]).into_owned())
}

/// Decode one datagram
pub fn decode(datagram: &[u8]) -> Result<Packet, PacketError> {
    if datagram.len() < HEADER_SIZE {
        return Err(PacketError::TooShort(datagram.len()));
    }
    if &datagram[..8] != ARTNET_ID {
        return Err(PacketError::BadHeader);
    }

    let mut cursor = Cursor::new(datagram);
    cursor.set_position(8);
    let too_short = |_| PacketError::TooShort(datagram.len());
    let opcode = cursor.read_u16::<LittleEndian>().map_err(too_short)?;

    match opcode {
        OP_POLL => {
            check_version(&mut cursor, datagram.len())?;
            // Art-Net 1 polls stop at the version field
            let talk_to_me = cursor.read_u8().unwrap_or(0);
            let priority = cursor.read_u8().unwrap_or(0);
            Ok(Packet::Poll(ArtPoll {
                talk_to_me,
                priority,
            }))
        }
        OP_DMX => {
            check_version(&mut cursor, datagram.len())?;
            let sequence = cursor.read_u8().map_err(too_short)?;
            let physical = cursor.read_u8().map_err(too_short)?;
            let universe = cursor.read_u16::<LittleEndian>().map_err(too_short)?;
            let length = cursor.read_u16::<BigEndian>().map_err(too_short)?;
            if length == 0 || length as usize > DMX_UNIVERSE_SIZE {
                return Err(PacketError::BadLength(length));
            }
            let start = DMX_HEADER_SIZE;
            let end = start + length as usize;
            if datagram.len() < end {
                return Err(PacketError::TooShort(datagram.len()));
            }
            Ok(Packet::Dmx(ArtDmx {
                sequence,
                physical,
                universe: universe & 0x7FFF,
                data: DmxBuffer::from_slice(&datagram[start..end]),
            }))
        }
        OP_POLL_REPLY => {
            // no protocol version field in a poll reply
            let reply = ArtPollReply::decode(&mut cursor).map_err(too_short)?;
            Ok(Packet::PollReply(Box::new(reply)))
        }
        other => Err(PacketError::UnsupportedOpCode(other)),
    }
}

fn check_version(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<(), PacketError> {
    let version = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| PacketError::TooShort(len))?;
    if version < PROTOCOL_VERSION {
        return Err(PacketError::OldProtocol(version));
    }
    Ok(())
}
