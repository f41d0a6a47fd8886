use std::{
    fmt,
    path::{Path, PathBuf},
};

use i2cdev::{
    core::I2CDevice,
    linux::{LinuxI2CDevice, LinuxI2CError},
};
use log::debug;

use super::{BusTransport, ChipAddress, display_path};
use crate::error::{HalError, HalResult};

/// `/dev/i2c-N` character device driven through the kernel i2c-dev
/// interface.
///
/// The handle is released on [`close`](BusTransport::close) or drop,
/// whichever comes first, and never twice.
pub struct LinuxI2cBus {
    path: PathBuf,
    device: Option<LinuxI2CDevice>,
    address: Option<ChipAddress>,
    force: bool,
}

impl LinuxI2cBus {
    /// Opens the bus node at `path`.
    ///
    /// Exclusive use is only tracked per
    /// [`DeviceManager`](crate::manager::DeviceManager): no lock is taken on
    /// the node, so another process or manager may open it as well.
    ///
    /// # Errors
    ///
    /// [`HalError::BusUnavailable`] if the node does not exist or cannot be
    /// opened read-write.
    pub fn open(path: impl AsRef<Path>) -> HalResult<Self> {
        Self::open_with(path.as_ref(), false)
    }

    /// Like [`open`](Self::open), but targets are selected with
    /// `I2C_SLAVE_FORCE`, so chips claimed by a kernel driver can still be
    /// reached. Transfers then race with that driver.
    pub fn open_forced(path: impl AsRef<Path>) -> HalResult<Self> {
        Self::open_with(path.as_ref(), true)
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }

    fn open_with(path: &Path, force: bool) -> HalResult<Self> {
        if !path.exists() {
            return Err(HalError::bus_unavailable(
                display_path(path),
                "no such device node",
            ));
        }

        // i2c-dev wants a target on open; 0x03 is reserved and never claimed
        // by a kernel driver.
        let device = LinuxI2CDevice::new(path, u16::from(ChipAddress::FIRST.get()))
            .map_err(|e| HalError::bus_unavailable(display_path(path), e))?;

        debug!(
            "Opened I2C bus {}{}",
            path.display(),
            if force { " (forced select)" } else { "" }
        );
        Ok(Self {
            path: path.to_path_buf(),
            device: Some(device),
            address: None,
            force,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn selected(&mut self) -> HalResult<&mut LinuxI2CDevice> {
        match (self.device.as_mut(), self.address) {
            (None, _) => Err(HalError::bus_unavailable(
                display_path(&self.path),
                "bus is closed",
            )),
            (Some(_), None) => Err(HalError::bus_unavailable(
                display_path(&self.path),
                "no target address selected",
            )),
            (Some(device), Some(_)) => Ok(device),
        }
    }
}

impl fmt::Debug for LinuxI2cBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinuxI2cBus")
            .field("path", &self.path)
            .field("open", &self.device.is_some())
            .field("address", &self.address)
            .field("force", &self.force)
            .finish()
    }
}

impl BusTransport for LinuxI2cBus {
    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn address(&self) -> Option<ChipAddress> {
        self.address
    }

    fn set_address(&mut self, address: ChipAddress) -> HalResult<()> {
        let cannot_select = |e: LinuxI2CError| {
            HalError::bus_unavailable(
                display_path(&self.path),
                format!("cannot select {address}: {e}"),
            )
        };
        let device = self.device.as_mut().ok_or_else(|| {
            HalError::bus_unavailable(display_path(&self.path), "bus is closed")
        })?;

        if self.force {
            // SAFETY: the caller opted into forced selection with
            // `open_forced` and accepts sharing the chip with a bound
            // kernel driver.
            *device =
                unsafe { LinuxI2CDevice::force_new(&self.path, u16::from(address.get())) }
                    .map_err(cannot_select)?;
        } else {
            device
                .set_slave_address(u16::from(address.get()))
                .map_err(cannot_select)?;
        }
        self.address = Some(address);
        Ok(())
    }

    fn read_byte(&mut self) -> HalResult<u8> {
        let address = self.address;
        self.selected()?
            .smbus_read_byte()
            .map_err(|e| HalError::transport(address, e))
    }

    fn write_byte(&mut self, value: u8) -> HalResult<()> {
        let address = self.address;
        self.selected()?
            .smbus_write_byte(value)
            .map_err(|e| HalError::transport(address, e))
    }

    fn read_byte_data(&mut self, register: u8) -> HalResult<u8> {
        let address = self.address;
        self.selected()?
            .smbus_read_byte_data(register)
            .map_err(|e| HalError::transport(address, e))
    }

    fn write_byte_data(&mut self, register: u8, value: u8) -> HalResult<()> {
        let address = self.address;
        self.selected()?
            .smbus_write_byte_data(register, value)
            .map_err(|e| HalError::transport(address, e))
    }

    fn read_block_data(&mut self, register: u8, len: usize) -> HalResult<Vec<u8>> {
        let address = self.address;
        let device = self.selected()?;
        device
            .write(&[register])
            .map_err(|e| HalError::transport(address, e))?;

        let mut buf = vec![0u8; len];
        device
            .read(&mut buf)
            .map_err(|e| HalError::transport(address, e))?;
        Ok(buf)
    }

    fn write_block_data(&mut self, register: u8, data: &[u8]) -> HalResult<()> {
        let address = self.address;
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(register);
        frame.extend_from_slice(data);

        self.selected()?
            .write(&frame)
            .map_err(|e| HalError::transport(address, e))
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!("Closed I2C bus {}", self.path.display());
        }
        self.address = None;
    }
}

impl Drop for LinuxI2cBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_node_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("i2c-42");

        let err = LinuxI2cBus::open(&missing).unwrap_err();
        match err {
            HalError::BusUnavailable { path, .. } => {
                assert!(path.ends_with("i2c-42"));
            }
            other => panic!("expected BusUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn open_forced_missing_node_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("i2c-7");

        assert!(matches!(
            LinuxI2cBus::open_forced(&missing),
            Err(HalError::BusUnavailable { .. })
        ));
    }
}
