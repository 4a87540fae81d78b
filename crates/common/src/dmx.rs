//! DMX512 frame container

use std::fmt;

/// Number of channel slots in one DMX512 universe
pub const DMX_UNIVERSE_SIZE: usize = 512;

/// A single DMX512 frame
///
/// Holds up to 512 channel values. The buffer tracks how many channels are
/// in use, so a frame built from 24 bytes stays 24 channels long on the wire
/// for protocols that send variable-length frames.
#[derive(Clone, PartialEq, Eq)]
pub struct DmxBuffer {
    data: [u8; DMX_UNIVERSE_SIZE],
    size: usize,
}

impl DmxBuffer {
    /// Create an empty buffer (zero channels in use)
    pub fn new() -> Self {
        Self {
            data: [0; DMX_UNIVERSE_SIZE],
            size: 0,
        }
    }

    /// Create a buffer from raw channel data
    ///
    /// Data beyond 512 bytes is truncated.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buffer = Self::new();
        buffer.set(data);
        buffer
    }

    /// A full 512 channel buffer with every channel at zero
    pub fn blackout() -> Self {
        Self {
            data: [0; DMX_UNIVERSE_SIZE],
            size: DMX_UNIVERSE_SIZE,
        }
    }

    /// Replace the contents of the buffer
    pub fn set(&mut self, data: &[u8]) {
        let len = data.len().min(DMX_UNIVERSE_SIZE);
        self.data[..len].copy_from_slice(&data[..len]);
        self.data[len..].fill(0);
        self.size = len;
    }

    /// Set a single channel (0-based), growing the buffer if needed
    ///
    /// Returns false if the channel is out of range.
    pub fn set_channel(&mut self, channel: usize, value: u8) -> bool {
        if channel >= DMX_UNIVERSE_SIZE {
            return false;
        }
        self.data[channel] = value;
        if channel >= self.size {
            self.size = channel + 1;
        }
        true
    }

    /// Get a channel value (0-based), zero for channels not in use
    pub fn get(&self, channel: usize) -> u8 {
        if channel < self.size {
            self.data[channel]
        } else {
            0
        }
    }

    /// Number of channels in use
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Channels in use
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Copy channel data into `dest`, zero-padding past the used size
    ///
    /// Returns the number of bytes taken from the buffer.
    pub fn copy_padded(&self, dest: &mut [u8]) -> usize {
        let len = dest.len().min(self.size);
        dest[..len].copy_from_slice(&self.data[..len]);
        dest[len..].fill(0);
        len
    }
}

impl Default for DmxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DmxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = &self.as_slice()[..self.size.min(8)];
        f.debug_struct("DmxBuffer")
            .field("size", &self.size)
            .field("head", &preview)
            .finish()
    }
}
