//! Configuration management for the i2c_boardd daemon.
//!
//! Handles loading, parsing, and validation of YAML configuration files
//! that select buses, chips and the keypad color mapping.

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use crate::{
    bus::ChipAddress,
    device::ChipKind,
    drivers::{ht16k33::keypad::Key, pca9685::registers},
};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "I2C_BOARDD_CONFIG";

/// Main configuration structure for the i2c_boardd daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// tick_millis: 100
///
/// bus:
///   path_prefix: /dev/i2c-
///   first: 0
///   last: 9
///   force: false
///
/// devices:
///   - kind: led-pwm
///   - kind: fan-pwm
///     address: 0x64
///     frequency_hz: 200
///   - kind: tube
///   - kind: keypad
///
/// fan_level: 60
/// key_colors:
///   - key: 1
///     rgb: [100, 0, 0]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Keypad polling interval in milliseconds.
    #[serde(default = "defaults::tick_millis")]
    pub tick_millis: u64,

    /// Which `/dev/i2c-N` nodes are opened.
    #[serde(default)]
    pub bus: BusCfg,

    /// Address window for diagnostic scans.
    #[serde(default)]
    pub scan: ScanCfg,

    /// Chips probed on every bus; every kind when omitted.
    #[serde(default = "defaults::devices")]
    pub devices: Vec<DeviceCfg>,

    /// Fan level (0-100 %) applied at start-up.
    #[serde(default = "defaults::fan_level")]
    pub fan_level: i32,

    /// LED color shown while a key is held.
    #[serde(default)]
    pub key_colors: Vec<KeyColorCfg>,
}

/// Bus node selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusCfg {
    #[serde(default = "defaults::path_prefix")]
    pub path_prefix: String,

    /// First bus number, inclusive.
    #[serde(default)]
    pub first: u8,

    /// Last bus number, inclusive.
    #[serde(default = "defaults::last_bus")]
    pub last: u8,

    /// Select targets with `I2C_SLAVE_FORCE`, reaching chips a kernel
    /// driver has claimed.
    #[serde(default)]
    pub force: bool,
}

/// Address window for `--scan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCfg {
    #[serde(default = "defaults::scan_start")]
    pub start: ChipAddress,

    #[serde(default = "defaults::scan_end")]
    pub end: ChipAddress,
}

/// One chip to look for on each bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCfg {
    pub kind: ChipKind,

    /// Pins detection to this address instead of the kind's candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<ChipAddress>,

    /// PWM output frequency applied after initialization (PWM kinds only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_hz: Option<u32>,
}

impl DeviceCfg {
    pub fn new(kind: ChipKind) -> Self {
        Self {
            kind,
            address: None,
            frequency_hz: None,
        }
    }
}

/// LED levels (0-100 % per component) for one keypad key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColorCfg {
    /// Key number, 1-12.
    pub key: u8,

    /// Red, green and blue levels.
    pub rgb: [u8; 3],
}

impl Default for BusCfg {
    fn default() -> Self {
        Self {
            path_prefix: defaults::path_prefix(),
            first: 0,
            last: defaults::last_bus(),
            force: false,
        }
    }
}

impl Default for ScanCfg {
    fn default() -> Self {
        Self {
            start: defaults::scan_start(),
            end: defaults::scan_end(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            tick_millis: defaults::tick_millis(),
            bus: BusCfg::default(),
            scan: ScanCfg::default(),
            devices: defaults::devices(),
            fan_level: defaults::fan_level(),
            key_colors: Vec::new(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    ///
    /// # Example
    ///
    /// ```
    /// use i2c_boardd::config::Config;
    ///
    /// let config = Config::default();
    /// config.validate()?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.tick_millis == 0 {
            bail!("tick_millis must be greater than zero");
        }
        if self.bus.first > self.bus.last {
            bail!(
                "Bus range {}..={} is empty",
                self.bus.first,
                self.bus.last
            );
        }
        if self.scan.start > self.scan.end {
            bail!("Scan range {}..={} is empty", self.scan.start, self.scan.end);
        }
        if !(0..=100).contains(&self.fan_level) {
            bail!("fan_level {} outside 0..=100", self.fan_level);
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert((device.kind, device.address)) {
                bail!("Device '{}' is listed twice", device.kind);
            }
            if let Some(address) = device.address {
                if !device.kind.candidates().contains(&address) {
                    bail!(
                        "Address {address} is not a {} address (expected one of {})",
                        device.kind,
                        format_addresses(device.kind.candidates())
                    );
                }
            }
            if let Some(hz) = device.frequency_hz {
                if !matches!(device.kind, ChipKind::LedPwm | ChipKind::FanPwm) {
                    bail!("Device '{}' has no PWM frequency", device.kind);
                }
                if !(registers::MIN_FREQUENCY_HZ..=registers::MAX_FREQUENCY_HZ).contains(&hz) {
                    bail!(
                        "Device '{}' frequency {hz} Hz outside {}..={}",
                        device.kind,
                        registers::MIN_FREQUENCY_HZ,
                        registers::MAX_FREQUENCY_HZ
                    );
                }
            }
        }

        let mut keys = HashSet::new();
        for color in &self.key_colors {
            if Key::from_number(color.key).is_none() {
                bail!("Key color references non-existent key {}", color.key);
            }
            if !keys.insert(color.key) {
                bail!("Key {} has more than one color", color.key);
            }
            if color.rgb.iter().any(|&level| level > 100) {
                bail!(
                    "Key {} color {:?} has a level above 100",
                    color.key,
                    color.rgb
                );
            }
        }

        Ok(())
    }

    /// LED levels for `key`: the configured color, or red, green and blue
    /// in turn.
    pub fn color_for(&self, key: Key) -> [i32; 3] {
        let rgb = self
            .key_colors
            .iter()
            .find(|color| color.key == key.number())
            .map(|color| color.rgb)
            .unwrap_or_else(|| defaults::key_color(key));
        rgb.map(i32::from)
    }
}

fn format_addresses(addresses: &[ChipAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

mod defaults {
    use crate::{
        bus::ChipAddress, device::ChipKind, drivers::ht16k33::keypad::Key,
    };

    use super::DeviceCfg;

    pub fn tick_millis() -> u64 {
        100
    }

    pub fn path_prefix() -> String {
        String::from("/dev/i2c-")
    }

    pub fn last_bus() -> u8 {
        9
    }

    pub fn scan_start() -> ChipAddress {
        ChipAddress::FIRST
    }

    pub fn scan_end() -> ChipAddress {
        ChipAddress::LAST
    }

    pub fn devices() -> Vec<DeviceCfg> {
        ChipKind::ALL.into_iter().map(DeviceCfg::new).collect()
    }

    pub fn fan_level() -> i32 {
        50
    }

    pub fn key_color(key: Key) -> [u8; 3] {
        match (key.number() - 1) % 3 {
            0 => [100, 0, 0],
            1 => [0, 100, 0],
            _ => [0, 0, 100],
        }
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("i2c_boardd/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/i2c_boardd/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    bail!("Configuration file not found in any standard location")
}

/// Configuration manager that handles both config data and file operations.
///
/// # Example
///
/// ```no_run
/// use i2c_boardd::config::ConfigManager;
/// use std::path::PathBuf;
///
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.yml")))?;
/// let tick = config_manager.get().tick_millis;
/// config_manager.reload()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. `I2C_BOARDD_CONFIG` environment variable
    /// 3. `$XDG_CONFIG_HOME/i2c_boardd/config.yml` or `~/.config/i2c_boardd/config.yml`
    /// 4. `/etc/i2c_boardd/config.yml`
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, config_path))
    }

    /// Like [`load`](Self::load) but falls back to built-in defaults when
    /// no file exists anywhere. An explicit path must exist.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self> {
        if path.is_some() {
            return Self::load(path);
        }
        match locate_config() {
            Ok(found) => Self::load(Some(found)),
            Err(_) => {
                info!("No configuration file found, using defaults");
                Ok(Self::new(
                    Config::default(),
                    PathBuf::from("/etc/i2c_boardd/config.yml"),
                ))
            }
        }
    }

    /// Gets a read-only view of the current configuration.
    pub fn get(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads configuration from the same file.
    pub fn reload(&self) -> Result<()> {
        info!("Reloading config from: {}", self.path.display());
        let new_config = Self::load_config_from_path(&self.path)?;

        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Saves the current configuration to file.
    pub fn save(&self) -> Result<()> {
        let config = self.get().clone();
        self.save_to_path(&config, &self.path)
    }

    /// Saves configuration to a specific path through a temporary file.
    pub fn save_to_path(&self, config: &Config, path: &Path) -> Result<()> {
        let config_yaml =
            serde_yaml::to_string(config).context("Failed to serialize configuration")?;

        let tmp_path = path.with_extension("yml.tmp");
        fs::write(&tmp_path, config_yaml).with_context(|| {
            format!("Failed to write temporary config to {}", tmp_path.display())
        })?;

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move config to {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.get().validate()
    }

    /// Replaces the configuration after validating the new one.
    pub fn update_config(&self, new_config: Config) -> Result<()> {
        new_config
            .validate()
            .context("New configuration is invalid")?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        info!("Configuration updated in memory");
        Ok(())
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
