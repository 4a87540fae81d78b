//! Art-Net plugin
//!
//! A single Art-Net node with four input and four output ports. Output
//! frames are broadcast as ArtDmx on the universe each port is patched to;
//! ArtDmx received for a patched input universe is kept as that port's
//! latest frame, and ArtPoll is answered with an ArtPollReply.

pub mod config;
pub mod device;
pub mod error;
pub mod packet;
pub mod plugin;
pub mod port;

pub use config::ArtNetConfig;
pub use device::ArtNetDevice;
pub use error::{ArtNetError, PacketError, Result};
pub use packet::{ArtDmx, ArtPoll, ArtPollReply, Packet};
pub use plugin::{ArtNetPlugin, PLUGIN_NAME, PluginState, registration};
