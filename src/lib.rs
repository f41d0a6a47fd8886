//! # i2c_boardd
//!
//! Hardware abstraction for I2C peripheral boards built around the PCA9685
//! PWM controller and the HT16K33 LED/key-scan controller, plus a small
//! daemon that drives them.
//!
//! ## Layers
//!
//! - [`bus`]: byte-level [`BusTransport`](bus::BusTransport) over
//!   `/dev/i2c-N`, and an in-memory [`SimulatedBus`](bus::sim::SimulatedBus)
//! - [`device`]: the [`DeviceProtocol`](device::DeviceProtocol) detect /
//!   initialize contract and the supported [`ChipKind`](device::ChipKind)s
//! - [`drivers`]: register protocols for each chip
//! - [`manager`]: [`DeviceManager`](manager::DeviceManager) owns buses and
//!   drivers and exposes the board-level API
//!
//! ## Example
//!
//! ```no_run
//! use i2c_boardd::{config::ConfigManager, manager::DeviceManager};
//!
//! let config = ConfigManager::load_or_default(None)?.get().clone();
//! let mut manager = DeviceManager::from_config(&config);
//! manager.scan_buses(config.bus.first..=config.bus.last);
//! manager.scan_devices();
//! manager.set_led_color(None, 100, 0, 0)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod bus;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod device;
pub mod drivers;
pub mod error;
pub mod manager;
