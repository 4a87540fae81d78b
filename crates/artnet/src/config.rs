//! Art-Net plugin configuration

use crate::error::{ArtNetError, Result};
use crate::packet::ARTNET_PORT;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

const SHORT_NAME_MAX: usize = 17;
const LONG_NAME_MAX: usize = 63;

/// The `[artnet]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtNetConfig {
    #[serde(default = "ArtNetConfig::default_enabled")]
    pub enabled: bool,
    /// Interface address the listener binds to
    #[serde(default = "ArtNetConfig::default_bind_address")]
    pub bind_address: String,
    /// Listener port
    #[serde(default = "ArtNetConfig::default_port")]
    pub port: u16,
    /// Where output frames are sent
    #[serde(default = "ArtNetConfig::default_broadcast_address")]
    pub broadcast_address: String,
    /// Port output frames are sent to
    #[serde(default = "ArtNetConfig::default_port")]
    pub destination_port: u16,
    #[serde(default = "ArtNetConfig::default_short_name")]
    pub short_name: String,
    #[serde(default = "ArtNetConfig::default_long_name")]
    pub long_name: String,
}

impl Default for ArtNetConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            bind_address: Self::default_bind_address(),
            port: Self::default_port(),
            broadcast_address: Self::default_broadcast_address(),
            destination_port: Self::default_port(),
            short_name: Self::default_short_name(),
            long_name: Self::default_long_name(),
        }
    }
}

impl ArtNetConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_bind_address() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        ARTNET_PORT
    }

    fn default_broadcast_address() -> String {
        "255.255.255.255".to_string()
    }

    fn default_short_name() -> String {
        "dmxd".to_string()
    }

    fn default_long_name() -> String {
        "dmxd Art-Net node".to_string()
    }

    /// Listener address
    pub fn listen_address(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ArtNetError::Address(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Destination of output frames
    pub fn destination(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .broadcast_address
            .parse()
            .map_err(|_| ArtNetError::Address(self.broadcast_address.clone()))?;
        Ok(SocketAddr::new(ip, self.destination_port))
    }

    pub fn validate(&self) -> Result<()> {
        let listen = self.listen_address()?;
        let destination = self.destination()?;
        if !listen.is_ipv4() || !destination.is_ipv4() {
            return Err(ArtNetError::Config(
                "Art-Net only runs over IPv4".into(),
            ));
        }
        if self.destination_port == 0 {
            return Err(ArtNetError::Config(
                "destination_port must be greater than 0".into(),
            ));
        }
        if self.short_name.is_empty() || !self.short_name.is_ascii() {
            return Err(ArtNetError::Config(
                "short_name must be non-empty ASCII".into(),
            ));
        }
        if self.short_name.len() > SHORT_NAME_MAX {
            return Err(ArtNetError::Config(format!(
                "short_name is limited to {} characters",
                SHORT_NAME_MAX
            )));
        }
        if !self.long_name.is_ascii() || self.long_name.len() > LONG_NAME_MAX {
            return Err(ArtNetError::Config(format!(
                "long_name must be ASCII and at most {} characters",
                LONG_NAME_MAX
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArtNetConfig::default();
        assert!(config.enabled);
        assert_eq!(config.port, 6454);
        assert_eq!(
            config.listen_address().unwrap(),
            "0.0.0.0:6454".parse().unwrap()
        );
        assert_eq!(
            config.destination().unwrap(),
            "255.255.255.255:6454".parse().unwrap()
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_section_parses() {
        let config: ArtNetConfig = toml::from_str(
            r#"
            bind_address = "127.0.0.1"
            short_name = "stage-left"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.short_name, "stage-left");
        assert_eq!(config.long_name, "dmxd Art-Net node");
        assert_eq!(config.destination_port, 6454);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ArtNetConfig {
            bind_address: "not an address".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ArtNetError::Address(_))));

        config.bind_address = "::1".into();
        assert!(matches!(config.validate(), Err(ArtNetError::Config(_))));

        config = ArtNetConfig {
            short_name: "x".repeat(18),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ArtNetError::Config(_))));

        config = ArtNetConfig {
            short_name: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config = ArtNetConfig {
            destination_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
