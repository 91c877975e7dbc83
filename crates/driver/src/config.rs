//! Driver configuration management

use crate::lifecycle::DriverSettings;
use crate::usb::DeviceTable;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub usb: UsbSection,
    /// Transfer buffer sizing and teardown timing
    #[serde(default)]
    pub buffers: BufferSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSection {
    #[serde(default = "DriverSection::default_log_level")]
    pub log_level: String,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl DriverSection {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSection {
    /// Configuration value to select on the device
    #[serde(default = "UsbSection::default_configuration")]
    pub configuration: u8,
    /// Interface number to claim
    #[serde(default)]
    pub interface: u8,
    /// Additional VID:PID pairs to accept, e.g. "0x0bda:0x8813"
    #[serde(default)]
    pub extra_devices: Vec<String>,
}

impl Default for UsbSection {
    fn default() -> Self {
        Self {
            configuration: Self::default_configuration(),
            interface: 0,
            extra_devices: Vec::new(),
        }
    }
}

impl UsbSection {
    fn default_configuration() -> u8 {
        1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSection {
    /// Receive buffers kept posted while the interface is up
    #[serde(default = "BufferSection::default_count")]
    pub rx_buffers: usize,
    #[serde(default = "BufferSection::default_count")]
    pub tx_buffers: usize,
    /// Size of each buffer in bytes
    #[serde(default = "BufferSection::default_buffer_size")]
    pub buffer_size: usize,
    /// How long teardown waits for cancelled transfers
    #[serde(default = "BufferSection::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            rx_buffers: Self::default_count(),
            tx_buffers: Self::default_count(),
            buffer_size: Self::default_buffer_size(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
        }
    }
}

impl BufferSection {
    fn default_count() -> usize {
        8
    }

    fn default_buffer_size() -> usize {
        2048
    }

    fn default_drain_timeout_ms() -> u64 {
        1000
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/rtl88xxau/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rtl88xxau").join("driver.toml")
        } else {
            PathBuf::from(".config/rtl88xxau/driver.toml")
        }
    }

    /// Settings for the driver core
    pub fn driver_settings(&self) -> Result<DriverSettings> {
        let extra = self
            .usb
            .extra_devices
            .iter()
            .map(|entry| parse_device_id(entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(DriverSettings {
            configuration: self.usb.configuration,
            interface: self.usb.interface,
            rx_buffers: self.buffers.rx_buffers,
            tx_buffers: self.buffers.tx_buffers,
            buffer_size: self.buffers.buffer_size,
            drain_timeout: Duration::from_millis(self.buffers.drain_timeout_ms),
            devices: DeviceTable::with_extra(extra),
        })
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        for entry in &self.usb.extra_devices {
            parse_device_id(entry)?;
        }

        if self.buffers.rx_buffers == 0 || self.buffers.tx_buffers == 0 {
            return Err(anyhow!("Buffer pools need at least one buffer each"));
        }

        // One full-speed packet at minimum; an RX aggregate never exceeds 32 KiB.
        if !(64..=32 * 1024).contains(&self.buffers.buffer_size) {
            return Err(anyhow!(
                "Invalid buffer_size {}, must be between 64 and 32768",
                self.buffers.buffer_size
            ));
        }

        Ok(())
    }
}

/// Parse "0xVVVV:0xPPPP"
pub fn parse_device_id(entry: &str) -> Result<(u16, u16)> {
    let parts: Vec<&str> = entry.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid device '{}', expected VID:PID (e.g., '0x0bda:0x8812')",
            entry
        ));
    }

    let vid = parse_hex_id(parts[0], "VID")?;
    let pid = parse_hex_id(parts[1], "PID")?;
    Ok((vid, pid))
}

/// Parse a hex ID (VID or PID)
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load from a path that may start with `~`
pub fn load_config(path: &str) -> Result<DriverConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DriverConfig::load(Some(path_buf))
}
