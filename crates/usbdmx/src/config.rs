//! USB DMX plugin configuration

use crate::error::{Result, UsbDmxError};
use crate::widget::{TransferMode, WidgetKind, WidgetSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The `[usbdmx]` config section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDmxConfig {
    #[serde(default = "UsbDmxConfig::default_enabled")]
    pub enabled: bool,
    /// Transmission strategy for every widget
    #[serde(default)]
    pub mode: TransferMode,
    /// How often the bus is rescanned for added or removed widgets
    #[serde(default = "UsbDmxConfig::default_rescan_interval")]
    pub rescan_interval_ms: u64,
    /// How often asynchronous completions are processed
    #[serde(default = "UsbDmxConfig::default_pump_interval")]
    pub pump_interval_ms: u64,
    /// Failed transfers in a row before a widget is given up on
    #[serde(default = "UsbDmxConfig::default_max_failures")]
    pub max_consecutive_failures: u32,
    /// libusb log verbosity, 0 (none) to 4 (debug)
    #[serde(default)]
    pub libusb_debug_level: u8,
    /// Models to look for, in matching order
    #[serde(default = "UsbDmxConfig::default_models")]
    pub models: Vec<WidgetKind>,
}

impl Default for UsbDmxConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            mode: TransferMode::default(),
            rescan_interval_ms: Self::default_rescan_interval(),
            pump_interval_ms: Self::default_pump_interval(),
            max_consecutive_failures: Self::default_max_failures(),
            libusb_debug_level: 0,
            models: Self::default_models(),
        }
    }
}

impl UsbDmxConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_rescan_interval() -> u64 {
        2000
    }

    fn default_pump_interval() -> u64 {
        10
    }

    fn default_max_failures() -> u32 {
        3
    }

    fn default_models() -> Vec<WidgetKind> {
        WidgetKind::ALL.to_vec()
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    pub fn widget_settings(&self) -> WidgetSettings {
        WidgetSettings {
            mode: self.mode,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.rescan_interval_ms == 0 {
            return Err(UsbDmxError::Config(
                "rescan_interval_ms must be greater than 0".into(),
            ));
        }
        if self.pump_interval_ms == 0 {
            return Err(UsbDmxError::Config(
                "pump_interval_ms must be greater than 0".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(UsbDmxError::Config(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.libusb_debug_level > 4 {
            return Err(UsbDmxError::Config(format!(
                "libusb_debug_level must be 0-4, got {}",
                self.libusb_debug_level
            )));
        }
        for (i, model) in self.models.iter().enumerate() {
            if self.models[..i].contains(model) {
                return Err(UsbDmxError::Config(format!(
                    "model {} listed more than once",
                    model
                )));
            }
        }
        Ok(())
    }
}
