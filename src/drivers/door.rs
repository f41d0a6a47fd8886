//! Door / curtain motor board.

use log::debug;

use crate::{
    bus::{BusTransport, ChipAddress},
    device::{self, ChipKind, DeviceProtocol},
    error::{HalError, HalResult},
};

pub const ADDRESSES: [ChipAddress; 4] = [
    ChipAddress::fixed(0x1C),
    ChipAddress::fixed(0x1D),
    ChipAddress::fixed(0x1E),
    ChipAddress::fixed(0x1F),
];

/// Target position, 0 (closed) to 100 (open).
pub const POSITION_REG: u8 = 0x03;

#[derive(Debug)]
pub struct DoorController {
    preset: Option<ChipAddress>,
    address: Option<ChipAddress>,
    initialized: bool,
}

impl DoorController {
    pub fn new(preset: Option<ChipAddress>) -> Self {
        Self {
            preset,
            address: None,
            initialized: false,
        }
    }

    /// Moves to `percent` open, clamped to 0-100.
    pub fn set_position(&self, bus: &mut dyn BusTransport, percent: i32) -> HalResult<()> {
        device::select_initialized(bus, ChipKind::Door, self.address, self.initialized)?;
        let position = percent.clamp(0, 100) as u8;
        debug!("door -> {position}%");
        bus.write_byte_data(POSITION_REG, position)
    }
}

impl DeviceProtocol for DoorController {
    fn kind(&self) -> ChipKind {
        ChipKind::Door
    }

    fn address(&self) -> Option<ChipAddress> {
        self.address
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// A configured address is taken as-is once it can be selected, even
    /// when the read gets no acknowledge; some door boards never answer.
    fn detect(&mut self, bus: &mut dyn BusTransport) -> HalResult<ChipAddress> {
        let found = device::detect_first(bus, ChipKind::Door, self.preset, |bus| {
            bus.read_byte().map(|_| ())
        });
        let address = match (found, self.preset) {
            (Ok(address), _) => address,
            (Err(HalError::DeviceNotFound { .. }), Some(preset)) => {
                bus.set_address(preset)?;
                debug!("door at {preset} does not answer reads, using it as configured");
                preset
            }
            (Err(e), _) => return Err(e),
        };
        self.address = Some(address);
        self.initialized = false;
        Ok(address)
    }

    /// Homes the motor to the closed position.
    fn initialize(&mut self, bus: &mut dyn BusTransport) -> HalResult<()> {
        let address = device::detected(ChipKind::Door, self.address)?;
        self.initialized = false;

        bus.set_address(address)?;
        bus.write_byte_data(POSITION_REG, 0)?;

        self.initialized = true;
        Ok(())
    }
}
