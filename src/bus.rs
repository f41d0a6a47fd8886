//! Byte-level I2C transport.
//!
//! [`BusTransport`] is the seam between chip drivers and the physical bus.
//! [`linux::LinuxI2cBus`] talks to `/dev/i2c-N` device nodes;
//! [`sim::SimulatedBus`] keeps an in-memory register model of the board.

pub mod linux;
pub mod sim;

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{HalError, HalResult};

/// Validated 7-bit I2C target address within the scannable range
/// (`0x03..=0x77`).
///
/// # Example
///
/// ```
/// use i2c_boardd::bus::ChipAddress;
///
/// let tube = ChipAddress::new(0x70)?;
/// assert_eq!(tube.to_string(), "0x70");
/// assert!(ChipAddress::new(0x78).is_err());
/// # Ok::<(), i2c_boardd::error::HalError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChipAddress(u8);

impl ChipAddress {
    /// Lowest address probed by a bus scan.
    pub const FIRST: ChipAddress = ChipAddress(0x03);

    /// Highest address probed by a bus scan.
    pub const LAST: ChipAddress = ChipAddress(0x77);

    /// Builds an address, rejecting reserved and 10-bit values.
    pub fn new(raw: u8) -> HalResult<Self> {
        if (Self::FIRST.0..=Self::LAST.0).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(HalError::InvalidParameter(format!(
                "address 0x{raw:02X} outside 0x{:02X}..=0x{:02X}",
                Self::FIRST.0,
                Self::LAST.0
            )))
        }
    }

    /// For compile-time candidate tables; callers guarantee the range.
    pub(crate) const fn fixed(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ChipAddress {
    type Error = HalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChipAddress> for u8 {
    fn from(value: ChipAddress) -> Self {
        value.0
    }
}

impl fmt::Display for ChipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Numeric bus identifier; bus `N` lives at `<prefix>N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusId(pub u8);

impl BusId {
    pub fn path(self, prefix: &str) -> PathBuf {
        PathBuf::from(format!("{prefix}{}", self.0))
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i2c-{}", self.0)
    }
}

/// Blocking I2C primitives over one exclusively held bus.
///
/// Every read or write goes to the target chosen by the last successful
/// [`set_address`](BusTransport::set_address). No operation retries; a
/// failure is reported once and the caller decides what happens next.
#[cfg_attr(test, mockall::automock)]
pub trait BusTransport: Send {
    /// Whether the handle is still held.
    fn is_open(&self) -> bool;

    /// Target selected for subsequent transfers, if any.
    fn address(&self) -> Option<ChipAddress>;

    /// Selects the target chip for subsequent transfers.
    fn set_address(&mut self, address: ChipAddress) -> HalResult<()>;

    /// Reads one byte without a register prefix.
    fn read_byte(&mut self) -> HalResult<u8>;

    /// Writes one byte without a register prefix (chip commands).
    fn write_byte(&mut self, value: u8) -> HalResult<()>;

    fn read_byte_data(&mut self, register: u8) -> HalResult<u8>;

    fn write_byte_data(&mut self, register: u8, value: u8) -> HalResult<()>;

    /// Reads `len` bytes starting at `register`.
    fn read_block_data(&mut self, register: u8, len: usize) -> HalResult<Vec<u8>>;

    /// Writes `data` to consecutive registers starting at `register` in a
    /// single transfer.
    fn write_block_data(&mut self, register: u8, data: &[u8]) -> HalResult<()>;

    /// Releases the handle. Closing a closed bus does nothing.
    fn close(&mut self);

    /// Probes every address in `start..=end` with a plain byte read and
    /// returns the ones that acknowledged, in ascending order.
    ///
    /// Says nothing about what kind of chip answered.
    fn scan(&mut self, start: ChipAddress, end: ChipAddress) -> Vec<ChipAddress> {
        (start.get()..=end.get())
            .filter_map(|raw| ChipAddress::new(raw).ok())
            .filter(|&address| self.set_address(address).is_ok() && self.read_byte().is_ok())
            .collect()
    }
}

pub(crate) fn display_path(path: &Path) -> String {
    path.display().to_string()
}
