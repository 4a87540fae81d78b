//! Supported widget models and their wire encodings

use crate::transport::{DeviceDescriptor, WireFrame};
use common::{DMX_UNIVERSE_SIZE, DmxBuffer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Static description of one widget model
#[derive(Debug)]
pub struct ModelSpec {
    pub kind: WidgetKind,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Expected manufacturer string, checked where several vendors share IDs
    pub manufacturer: Option<&'static str>,
    pub product: Option<&'static str>,
    pub interface: u8,
    pub timeout: Duration,
}

pub static ANYMA: ModelSpec = ModelSpec {
    kind: WidgetKind::Anyma,
    vendor_id: 0x16C0,
    product_id: 0x05DC,
    manufacturer: Some("www.anyma.ch"),
    product: Some("uDMX"),
    interface: 0,
    timeout: Duration::from_millis(500),
};

pub static EUROLITE_PRO: ModelSpec = ModelSpec {
    kind: WidgetKind::EurolitePro,
    vendor_id: 0x04D8,
    product_id: 0xFA63,
    manufacturer: Some("Eurolite"),
    product: Some("Eurolite DMX512 Pro"),
    interface: 0,
    timeout: Duration::from_millis(50),
};

pub static FADECANDY: ModelSpec = ModelSpec {
    kind: WidgetKind::Fadecandy,
    vendor_id: 0x1D50,
    product_id: 0x607A,
    manufacturer: Some("scanlime"),
    product: Some("Fadecandy"),
    interface: 0,
    timeout: Duration::from_millis(50),
};

pub static SUNLITE: ModelSpec = ModelSpec {
    kind: WidgetKind::Sunlite,
    vendor_id: 0x0962,
    product_id: 0x2001,
    manufacturer: None,
    product: None,
    interface: 0,
    timeout: Duration::from_millis(50),
};

pub static VELLEMAN: ModelSpec = ModelSpec {
    kind: WidgetKind::Velleman,
    vendor_id: 0x10CF,
    product_id: 0x8062,
    manufacturer: None,
    product: None,
    interface: 0,
    timeout: Duration::from_millis(50),
};

const ANYMA_SET_CHANNEL_RANGE: u8 = 0x02;
const ANYMA_REQUEST_TYPE: u8 = 0x40; // vendor, host-to-device, device recipient

const EUROLITE_ENDPOINT: u8 = 0x02;
const EUROLITE_START: u8 = 0x7E;
const EUROLITE_LABEL_SEND_DMX: u8 = 0x06;
const EUROLITE_END: u8 = 0xE7;

const FADECANDY_ENDPOINT: u8 = 0x01;
const FADECANDY_PACKET_SIZE: usize = 64;
const FADECANDY_PACKET_COUNT: usize = 25;
const FADECANDY_FRAMEBUFFER: u8 = 0x00;
const FADECANDY_LUT: u8 = 0x40;
const FADECANDY_CONFIG: u8 = 0x80;
const FADECANDY_FINAL: u8 = 0x20;
const FADECANDY_LUT_ENTRIES: usize = 257 * 3;
const FADECANDY_LUT_PER_PACKET: usize = 31;

const SUNLITE_ENDPOINT: u8 = 0x01;
const SUNLITE_PACKET_SIZE: usize = 0x340;
const SUNLITE_CHUNK_SIZE: usize = 32;
const SUNLITE_CHUNK_COUNT: usize = 26;
const SUNLITE_CHANNELS_PER_CHUNK: usize = 20;
const SUNLITE_CHANNELS_PER_GROUP: usize = 4;
const SUNLITE_GROUP_SIZE: usize = 6;

const VELLEMAN_ENDPOINT: u8 = 0x01;
const VELLEMAN_CHUNK_SIZE: usize = 8;
/// Longest run of zero channels skipped by one packet
const VELLEMAN_MAX_SKIP: usize = 100;
const VELLEMAN_START: u8 = 4;
const VELLEMAN_SKIP: u8 = 5;
const VELLEMAN_CHANNELS: u8 = 2;
const VELLEMAN_SINGLE: u8 = 3;

/// The closed set of supported models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetKind {
    Anyma,
    EurolitePro,
    Fadecandy,
    Sunlite,
    Velleman,
}

impl WidgetKind {
    pub const ALL: [WidgetKind; 5] = [
        WidgetKind::Anyma,
        WidgetKind::EurolitePro,
        WidgetKind::Fadecandy,
        WidgetKind::Sunlite,
        WidgetKind::Velleman,
    ];

    pub fn spec(self) -> &'static ModelSpec {
        match self {
            WidgetKind::Anyma => &ANYMA,
            WidgetKind::EurolitePro => &EUROLITE_PRO,
            WidgetKind::Fadecandy => &FADECANDY,
            WidgetKind::Sunlite => &SUNLITE,
            WidgetKind::Velleman => &VELLEMAN,
        }
    }

    /// Short identifier used in device ids and config
    pub fn id(self) -> &'static str {
        match self {
            WidgetKind::Anyma => "anyma",
            WidgetKind::EurolitePro => "eurolite-pro",
            WidgetKind::Fadecandy => "fadecandy",
            WidgetKind::Sunlite => "sunlite",
            WidgetKind::Velleman => "velleman",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            WidgetKind::Anyma => "Anyma USB Device",
            WidgetKind::EurolitePro => "EurolitePro USB Device",
            WidgetKind::Fadecandy => "Fadecandy USB Device",
            WidgetKind::Sunlite => "Sunlite USBDMX2 Device",
            WidgetKind::Velleman => "Velleman K8062 Device",
        }
    }

    /// VID/PID match, no I/O
    pub fn matches(self, descriptor: &DeviceDescriptor) -> bool {
        let spec = self.spec();
        descriptor.vendor_id == spec.vendor_id && descriptor.product_id == spec.product_id
    }

    /// The model whose IDs match `descriptor`, if any
    pub fn identify(descriptor: &DeviceDescriptor) -> Option<WidgetKind> {
        Self::ALL.into_iter().find(|kind| kind.matches(descriptor))
    }

    /// Frames sent once after the interface is claimed
    pub fn setup_frames(self) -> Vec<WireFrame> {
        match self {
            WidgetKind::Fadecandy => {
                let mut frames = vec![fadecandy_config_packet()];
                frames.extend(fadecandy_lut_packets());
                frames
            }
            WidgetKind::Anyma
            | WidgetKind::EurolitePro
            | WidgetKind::Sunlite
            | WidgetKind::Velleman => Vec::new(),
        }
    }

    /// Encode one DMX frame as the transfers that carry it
    pub fn encode(self, buffer: &DmxBuffer) -> Vec<WireFrame> {
        match self {
            WidgetKind::Anyma => vec![anyma_frame(buffer)],
            WidgetKind::EurolitePro => vec![eurolite_frame(buffer)],
            WidgetKind::Fadecandy => vec![fadecandy_frame(buffer)],
            WidgetKind::Sunlite => vec![sunlite_frame(buffer)],
            WidgetKind::Velleman => velleman_frames(buffer),
        }
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

fn anyma_frame(buffer: &DmxBuffer) -> WireFrame {
    WireFrame::Control {
        request_type: ANYMA_REQUEST_TYPE,
        request: ANYMA_SET_CHANNEL_RANGE,
        value: buffer.len() as u16,
        index: 0,
        data: buffer.as_slice().to_vec(),
    }
}

fn eurolite_frame(buffer: &DmxBuffer) -> WireFrame {
    let payload = DMX_UNIVERSE_SIZE + 1;
    let mut data = Vec::with_capacity(payload + 5);
    data.push(EUROLITE_START);
    data.push(EUROLITE_LABEL_SEND_DMX);
    data.extend_from_slice(&(payload as u16).to_le_bytes());
    data.push(0x00); // start code
    let mut channels = [0u8; DMX_UNIVERSE_SIZE];
    buffer.copy_padded(&mut channels);
    data.extend_from_slice(&channels);
    data.push(EUROLITE_END);

    WireFrame::Bulk {
        endpoint: EUROLITE_ENDPOINT,
        data,
    }
}

/// All 25 framebuffer packets as a single bulk transfer
fn fadecandy_frame(buffer: &DmxBuffer) -> WireFrame {
    let mut data = vec![0u8; FADECANDY_PACKET_SIZE * FADECANDY_PACKET_COUNT];
    let channels = buffer.as_slice();

    for (i, packet) in data.chunks_mut(FADECANDY_PACKET_SIZE).enumerate() {
        packet[0] = FADECANDY_FRAMEBUFFER | i as u8;
        if i == FADECANDY_PACKET_COUNT - 1 {
            packet[0] |= FADECANDY_FINAL;
        }
        let start = i * (FADECANDY_PACKET_SIZE - 1);
        if start < channels.len() {
            let end = (start + FADECANDY_PACKET_SIZE - 1).min(channels.len());
            packet[1..1 + end - start].copy_from_slice(&channels[start..end]);
        }
    }

    WireFrame::Bulk {
        endpoint: FADECANDY_ENDPOINT,
        data,
    }
}

fn fadecandy_config_packet() -> WireFrame {
    let mut data = vec![0u8; FADECANDY_PACKET_SIZE];
    data[0] = FADECANDY_CONFIG;
    // Byte 1 carries the option flags; all off keeps dithering and
    // interpolation enabled.
    data[1] = 0;

    WireFrame::Bulk {
        endpoint: FADECANDY_ENDPOINT,
        data,
    }
}

/// Linear colour lookup table, 257 entries per channel
fn fadecandy_lut_packets() -> Vec<WireFrame> {
    let entries: Vec<u16> = (0..FADECANDY_LUT_ENTRIES)
        .map(|j| ((j % 257) * 257).min(u16::MAX as usize) as u16)
        .collect();

    let mut data = vec![0u8; FADECANDY_PACKET_SIZE * FADECANDY_PACKET_COUNT];
    for (i, packet) in data.chunks_mut(FADECANDY_PACKET_SIZE).enumerate() {
        packet[0] = FADECANDY_LUT | i as u8;
        if i == FADECANDY_PACKET_COUNT - 1 {
            packet[0] |= FADECANDY_FINAL;
        }
        let first = i * FADECANDY_LUT_PER_PACKET;
        for (slot, entry) in entries
            .iter()
            .skip(first)
            .take(FADECANDY_LUT_PER_PACKET)
            .enumerate()
        {
            let offset = 2 + slot * 2;
            packet[offset..offset + 2].copy_from_slice(&entry.to_le_bytes());
        }
    }

    vec![WireFrame::Bulk {
        endpoint: FADECANDY_ENDPOINT,
        data,
    }]
}

/// The whole universe as one bulk packet of 26 chunks
///
/// Each chunk holds five groups of four channels behind a two byte group
/// header (channel address / 2, then 0x84, or 0x04 on the chunk's last group).
/// The final chunk is short and carries three groups.
fn sunlite_frame(buffer: &DmxBuffer) -> WireFrame {
    let mut data = vec![0u8; SUNLITE_PACKET_SIZE];
    let groups_per_chunk = SUNLITE_CHANNELS_PER_CHUNK / SUNLITE_CHANNELS_PER_GROUP;

    for (chunk_index, chunk) in data.chunks_mut(SUNLITE_CHUNK_SIZE).enumerate() {
        let first_channel = chunk_index * SUNLITE_CHANNELS_PER_CHUNK;
        let groups = if chunk_index == SUNLITE_CHUNK_COUNT - 1 {
            (DMX_UNIVERSE_SIZE - first_channel) / SUNLITE_CHANNELS_PER_GROUP
        } else {
            groups_per_chunk
        };

        chunk[0] = 0x80;
        for group in 0..groups {
            let header = group * SUNLITE_GROUP_SIZE;
            chunk[header + 1] = ((first_channel + group * SUNLITE_CHANNELS_PER_GROUP) / 2) as u8;
            chunk[header + 2] = if group + 1 == groups { 0x04 } else { 0x84 };
        }
    }

    for (channel, value) in buffer.as_slice().iter().enumerate() {
        let offset = (channel / SUNLITE_CHANNELS_PER_CHUNK) * SUNLITE_CHUNK_SIZE
            + ((channel / SUNLITE_CHANNELS_PER_GROUP) % groups_per_chunk) * SUNLITE_GROUP_SIZE
            + 3
            + channel % SUNLITE_CHANNELS_PER_GROUP;
        data[offset] = *value;
    }

    WireFrame::Bulk {
        endpoint: SUNLITE_ENDPOINT,
        data,
    }
}

fn velleman_packet(bytes: &[u8]) -> WireFrame {
    let mut data = vec![0u8; VELLEMAN_CHUNK_SIZE];
    data[..bytes.len()].copy_from_slice(bytes);
    WireFrame::Interrupt {
        endpoint: VELLEMAN_ENDPOINT,
        data,
    }
}

/// Run-length compressed 8-byte interrupt packets
///
/// A start packet skips leading zero channels and carries six values, then
/// each packet either skips another run of zeros and carries six values or
/// carries seven values as-is. Channels left over at the end go out one per
/// packet.
fn velleman_frames(buffer: &DmxBuffer) -> Vec<WireFrame> {
    let compressed = VELLEMAN_CHUNK_SIZE - 2;
    let plain = VELLEMAN_CHUNK_SIZE - 1;

    let mut channels = buffer.as_slice().to_vec();
    if channels.len() < plain {
        channels.resize(plain, 0);
    }
    let size = channels.len();

    let zero_run = |from: usize| {
        let mut n = 0;
        while n < VELLEMAN_MAX_SKIP && from + n < size - compressed && channels[from + n] == 0 {
            n += 1;
        }
        n
    };

    let mut frames = Vec::new();

    let skip = zero_run(0);
    let mut packet = vec![VELLEMAN_START, (skip + 1) as u8]; // includes the start code
    packet.extend_from_slice(&channels[skip..skip + compressed]);
    frames.push(velleman_packet(&packet));
    let mut i = skip + compressed;

    while i + plain < size {
        let skip = zero_run(i);
        if skip > 0 {
            let mut packet = vec![VELLEMAN_SKIP, skip as u8];
            packet.extend_from_slice(&channels[i + skip..i + skip + compressed]);
            frames.push(velleman_packet(&packet));
            i += skip + compressed;
        } else {
            let mut packet = vec![VELLEMAN_CHANNELS];
            packet.extend_from_slice(&channels[i..i + plain]);
            frames.push(velleman_packet(&packet));
            i += plain;
        }
    }

    frames.extend(
        channels[i..]
            .iter()
            .map(|value| velleman_packet(&[VELLEMAN_SINGLE, *value])),
    );
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(vendor_id: u16, product_id: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id,
            product_id,
            manufacturer_index: Some(1),
            product_index: Some(2),
            serial_number_index: Some(3),
        }
    }

    #[test]
    fn test_identify() {
        assert_eq!(
            WidgetKind::identify(&descriptor(0x0962, 0x2001)),
            Some(WidgetKind::Sunlite)
        );
        assert_eq!(
            WidgetKind::identify(&descriptor(0x10CF, 0x8062)),
            Some(WidgetKind::Velleman)
        );
        assert_eq!(
            WidgetKind::identify(&descriptor(0x1D50, 0x607A)),
            Some(WidgetKind::Fadecandy)
        );
        assert_eq!(
            WidgetKind::identify(&descriptor(0x16C0, 0x05DC)),
            Some(WidgetKind::Anyma)
        );
        assert_eq!(WidgetKind::identify(&descriptor(0x1234, 0x5678)), None);
    }

    #[test]
    fn test_anyma_encoding() {
        let buffer = DmxBuffer::from_slice(&[1, 2, 3]);
        let frames = WidgetKind::Anyma.encode(&buffer);
        assert_eq!(
            frames,
            vec![WireFrame::Control {
                request_type: 0x40,
                request: 0x02,
                value: 3,
                index: 0,
                data: vec![1, 2, 3],
            }]
        );
    }

    #[test]
    fn test_eurolite_encoding() {
        let buffer = DmxBuffer::from_slice(&[10, 20]);
        let frames = WidgetKind::EurolitePro.encode(&buffer);
        assert_eq!(frames.len(), 1);
        let WireFrame::Bulk { endpoint, data } = &frames[0] else {
            panic!("expected bulk frame");
        };
        assert_eq!(*endpoint, 0x02);
        assert_eq!(data.len(), 518);
        assert_eq!(&data[..7], &[0x7E, 0x06, 0x01, 0x02, 0x00, 10, 20]);
        assert!(data[7..517].iter().all(|b| *b == 0));
        assert_eq!(data[517], 0xE7);
    }

    #[test]
    fn test_fadecandy_framebuffer_packets() {
        let channels: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        let buffer = DmxBuffer::from_slice(&channels);
        let frames = WidgetKind::Fadecandy.encode(&buffer);
        let WireFrame::Bulk { endpoint, data } = &frames[0] else {
            panic!("expected bulk frame");
        };
        assert_eq!(*endpoint, 0x01);
        assert_eq!(data.len(), 25 * 64);

        let packets: Vec<&[u8]> = data.chunks(64).collect();
        assert_eq!(packets[0][0], 0x00);
        assert_eq!(packets[1][0], 0x01);
        assert_eq!(packets[24][0], 0x20 | 24);
        assert_eq!(&packets[0][1..64], &channels[0..63]);
        assert_eq!(&packets[1][1..64], &channels[63..126]);
        // 512 channels end inside packet 8
        assert_eq!(&packets[8][1..9], &channels[504..512]);
        assert!(packets[8][9..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_fadecandy_setup_frames() {
        let frames = WidgetKind::Fadecandy.setup_frames();
        assert_eq!(frames.len(), 2);

        let config = frames[0].data();
        assert_eq!(config.len(), 64);
        assert_eq!(config[0], 0x80);
        assert_eq!(config[1], 0);

        let lut = frames[1].data();
        assert_eq!(lut.len(), 25 * 64);
        let packets: Vec<&[u8]> = lut.chunks(64).collect();
        assert_eq!(packets[0][0], 0x40);
        assert_eq!(packets[24][0], 0x40 | 0x20 | 24);
        // entry 1 = 257, entry 256 = 0xFFFF, entry 257 restarts the green table
        assert_eq!(u16::from_le_bytes([packets[0][4], packets[0][5]]), 257);
        let entry = |j: usize| {
            let packet = packets[j / 31];
            let offset = 2 + (j % 31) * 2;
            u16::from_le_bytes([packet[offset], packet[offset + 1]])
        };
        assert_eq!(entry(256), 0xFFFF);
        assert_eq!(entry(257), 0);
        assert_eq!(entry(770), 0xFFFF);
    }

    #[test]
    fn test_other_models_need_no_setup() {
        assert!(WidgetKind::Anyma.setup_frames().is_empty());
        assert!(WidgetKind::EurolitePro.setup_frames().is_empty());
        assert!(WidgetKind::Sunlite.setup_frames().is_empty());
        assert!(WidgetKind::Velleman.setup_frames().is_empty());
    }

    #[test]
    fn test_sunlite_packet_layout() {
        let channels: Vec<u8> = (0..512).map(|i| (i % 200 + 1) as u8).collect();
        let frames = WidgetKind::Sunlite.encode(&DmxBuffer::from_slice(&channels));
        assert_eq!(frames.len(), 1);
        let WireFrame::Bulk { endpoint, data } = &frames[0] else {
            panic!("expected bulk frame");
        };
        assert_eq!(*endpoint, 0x01);
        assert_eq!(data.len(), 0x340);

        // first chunk: five group headers, the last one flagged 0x04
        assert_eq!(data[0], 0x80);
        assert_eq!(&data[1..3], &[0, 0x84]);
        assert_eq!(&data[7..9], &[2, 0x84]);
        assert_eq!(&data[25..27], &[8, 0x04]);
        assert_eq!(&data[3..7], &channels[0..4]);
        assert_eq!(&data[9..13], &channels[4..8]);
        assert_eq!(&data[27..31], &channels[16..20]);
        assert_eq!(data[31], 0);

        // second chunk starts at channel 20
        assert_eq!(&data[32..35], &[0x80, 10, 0x84]);
        assert_eq!(&data[35..39], &channels[20..24]);

        // the last chunk carries three groups
        assert_eq!(data[800], 0x80);
        assert_eq!(&data[801..803], &[250, 0x84]);
        assert_eq!(&data[813..815], &[254, 0x04]);
        assert_eq!(&data[815..819], &channels[508..512]);
        assert!(data[819..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_sunlite_short_frame_leaves_channels_zero() {
        let frames = WidgetKind::Sunlite.encode(&DmxBuffer::from_slice(&[9, 8]));
        let data = frames[0].data();
        assert_eq!(&data[..7], &[0x80, 0, 0x84, 9, 8, 0, 0]);
        assert_eq!(&data[32..35], &[0x80, 10, 0x84]);
        assert!(data[35..39].iter().all(|b| *b == 0));
    }

    fn velleman_packets(buffer: &DmxBuffer) -> Vec<Vec<u8>> {
        WidgetKind::Velleman
            .encode(buffer)
            .into_iter()
            .map(|frame| {
                let WireFrame::Interrupt { endpoint, data } = frame else {
                    panic!("expected interrupt frame");
                };
                assert_eq!(endpoint, 0x01);
                assert_eq!(data.len(), 8);
                data
            })
            .collect()
    }

    #[test]
    fn test_velleman_skips_leading_zeros() {
        let buffer = DmxBuffer::from_slice(&[0, 0, 0, 5, 6, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(
            velleman_packets(&buffer),
            vec![
                vec![4, 4, 5, 6, 7, 8, 9, 10],
                vec![3, 11, 0, 0, 0, 0, 0, 0],
                vec![3, 12, 0, 0, 0, 0, 0, 0],
                vec![3, 13, 0, 0, 0, 0, 0, 0],
            ]
        );
    }

    #[test]
    fn test_velleman_compresses_inner_zero_runs() {
        let mut channels: Vec<u8> = (1..=13).collect();
        channels.extend_from_slice(&[0, 0, 0]);
        channels.extend(20..=25);
        channels.extend(30..=33);
        let buffer = DmxBuffer::from_slice(&channels);

        assert_eq!(
            velleman_packets(&buffer),
            vec![
                vec![4, 1, 1, 2, 3, 4, 5, 6],
                vec![2, 7, 8, 9, 10, 11, 12, 13],
                vec![5, 3, 20, 21, 22, 23, 24, 25],
                vec![3, 30, 0, 0, 0, 0, 0, 0],
                vec![3, 31, 0, 0, 0, 0, 0, 0],
                vec![3, 32, 0, 0, 0, 0, 0, 0],
                vec![3, 33, 0, 0, 0, 0, 0, 0],
            ]
        );
    }

    #[test]
    fn test_velleman_empty_frame() {
        assert_eq!(
            velleman_packets(&DmxBuffer::new()),
            vec![vec![4, 2, 0, 0, 0, 0, 0, 0]]
        );
    }

    #[test]
    fn test_velleman_full_universe_covers_every_channel() {
        let channels: Vec<u8> = (0..512).map(|i| (i % 255 + 1) as u8).collect();
        let packets = velleman_packets(&DmxBuffer::from_slice(&channels));

        let mut decoded = Vec::new();
        for packet in &packets {
            match packet[0] {
                4 => decoded.extend_from_slice(&packet[2..8]),
                2 => decoded.extend_from_slice(&packet[1..8]),
                3 => decoded.push(packet[1]),
                other => panic!("unexpected packet type {}", other),
            }
        }
        assert_eq!(decoded, channels);
        assert_eq!(&packets[0][..2], &[4, 1]);
    }

    #[test]
    fn test_kind_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            models: Vec<WidgetKind>,
        }
        let parsed: Wrapper =
            toml::from_str(
            r#"models = ["anyma", "eurolite-pro", "fadecandy", "sunlite", "velleman"]"#,
        )
        .unwrap();
        assert_eq!(parsed.models, WidgetKind::ALL.to_vec());
    }
}
