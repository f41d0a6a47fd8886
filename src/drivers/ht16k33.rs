//! HT16K33 LED controller / key-scan driver.
//!
//! One chip model serves two boards: the 4-digit tube (display RAM) and the
//! 3x4 keypad (key RAM). Both use the same start-up sequence.

pub mod keypad;
pub mod segments;

use log::debug;

use crate::{
    bus::{BusTransport, ChipAddress},
    device::{self, ChipKind, DeviceProtocol},
    error::{HalError, HalResult},
};

use keypad::{KEY_RAM, KEY_RAM_LEN, Key};
use segments::{DIGITS, DISPLAY_RAM, DisplayBuffer, digit_register, segments_for};

pub const CMD_STANDBY_ENABLE: u8 = 0x20;
/// Turns the system oscillator on.
pub const CMD_STANDBY_DISABLE: u8 = 0x21;
pub const CMD_DISPLAY_OFF: u8 = 0x80;
pub const CMD_DISPLAY_ON: u8 = 0x81;
/// ROW/INT pin as row driver output.
pub const CMD_ROW_OUTPUT: u8 = 0xA0;

/// Addresses of the tube board.
pub const TUBE_ADDRESSES: [ChipAddress; 4] = [
    ChipAddress::fixed(0x70),
    ChipAddress::fixed(0x71),
    ChipAddress::fixed(0x72),
    ChipAddress::fixed(0x73),
];

/// Addresses of the keypad board.
pub const KEYPAD_ADDRESSES: [ChipAddress; 4] = [
    ChipAddress::fixed(0x74),
    ChipAddress::fixed(0x75),
    ChipAddress::fixed(0x76),
    ChipAddress::fixed(0x77),
];

#[derive(Debug)]
pub struct DisplayController {
    kind: ChipKind,
    preset: Option<ChipAddress>,
    address: Option<ChipAddress>,
    initialized: bool,
    buffer: DisplayBuffer,
}

impl DisplayController {
    /// `kind` is [`ChipKind::Tube`] or [`ChipKind::Keypad`].
    pub fn new(kind: ChipKind, preset: Option<ChipAddress>) -> Self {
        Self {
            kind,
            preset,
            address: None,
            initialized: false,
            buffer: DisplayBuffer::blank(),
        }
    }

    pub fn tube(preset: Option<ChipAddress>) -> Self {
        Self::new(ChipKind::Tube, preset)
    }

    pub fn keypad(preset: Option<ChipAddress>) -> Self {
        Self::new(ChipKind::Keypad, preset)
    }

    /// Shadow copy of what was last written to display RAM.
    pub fn buffer(&self) -> &DisplayBuffer {
        &self.buffer
    }

    fn ready(&self, bus: &mut dyn BusTransport) -> HalResult<()> {
        device::select_initialized(bus, self.kind, self.address, self.initialized)
    }

    fn flush(&mut self, bus: &mut dyn BusTransport, buffer: DisplayBuffer) -> HalResult<()> {
        bus.write_block_data(DISPLAY_RAM, &buffer.to_ram())?;
        self.buffer = buffer;
        Ok(())
    }

    /// Blanks every digit.
    pub fn clear(&mut self, bus: &mut dyn BusTransport) -> HalResult<()> {
        self.ready(bus)?;
        self.flush(bus, DisplayBuffer::blank())
    }

    /// Writes `ch` to the digit `index` positions from the left end.
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidParameter`] for an index above 3, before any bus
    /// traffic.
    pub fn display_char_left(
        &mut self,
        bus: &mut dyn BusTransport,
        index: usize,
        ch: char,
    ) -> HalResult<()> {
        if index >= DIGITS {
            return Err(HalError::InvalidParameter(format!(
                "digit index {index} outside 0..{DIGITS}"
            )));
        }
        self.ready(bus)?;

        let mask = segments_for(ch);
        bus.write_block_data(digit_register(index), &mask.to_le_bytes())?;
        self.buffer.set(index, mask);
        Ok(())
    }

    /// Writes `ch` to the digit `index` positions from the right end.
    pub fn display_char_right(
        &mut self,
        bus: &mut dyn BusTransport,
        index: usize,
        ch: char,
    ) -> HalResult<()> {
        match (DIGITS - 1).checked_sub(index) {
            Some(left) => self.display_char_left(bus, left, ch),
            None => Err(HalError::InvalidParameter(format!(
                "digit index {index} outside 0..{DIGITS}"
            ))),
        }
    }

    /// Shows `text` on the whole tube in one burst.
    ///
    /// See [`DisplayBuffer::from_text`] for padding and truncation.
    pub fn display_string(
        &mut self,
        bus: &mut dyn BusTransport,
        text: &str,
        align_right: bool,
    ) -> HalResult<()> {
        self.ready(bus)?;
        debug!("{} shows {text:?} (align_right={align_right})", self.kind);
        self.flush(bus, DisplayBuffer::from_text(text, align_right))
    }

    /// Reads the key RAM and returns the held key, if any.
    ///
    /// # Errors
    ///
    /// [`HalError::TransportError`] when the chip returns fewer than six
    /// bytes.
    pub fn read_key(&self, bus: &mut dyn BusTransport) -> HalResult<Option<Key>> {
        self.ready(bus)?;
        let ram = bus.read_block_data(KEY_RAM, KEY_RAM_LEN)?;
        if ram.len() < KEY_RAM_LEN {
            return Err(HalError::transport(
                self.address,
                format!("short key RAM read: {} of {KEY_RAM_LEN} bytes", ram.len()),
            ));
        }
        Ok(keypad::decode(&ram))
    }

    pub fn set_display_enabled(&self, bus: &mut dyn BusTransport, on: bool) -> HalResult<()> {
        self.ready(bus)?;
        bus.write_byte(if on { CMD_DISPLAY_ON } else { CMD_DISPLAY_OFF })
    }

    /// Stops the oscillator. The chip needs `initialize` again afterwards.
    pub fn standby(&mut self, bus: &mut dyn BusTransport) -> HalResult<()> {
        self.ready(bus)?;
        self.initialized = false;
        bus.write_byte(CMD_STANDBY_ENABLE)
    }
}

impl DeviceProtocol for DisplayController {
    fn kind(&self) -> ChipKind {
        self.kind
    }

    fn address(&self) -> Option<ChipAddress> {
        self.address
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn detect(&mut self, bus: &mut dyn BusTransport) -> HalResult<ChipAddress> {
        let address =
            device::detect_first(bus, self.kind, self.preset, |bus| bus.read_byte().map(|_| ()))?;
        self.address = Some(address);
        self.initialized = false;
        Ok(address)
    }

    fn initialize(&mut self, bus: &mut dyn BusTransport) -> HalResult<()> {
        let address = device::detected(self.kind, self.address)?;
        self.initialized = false;

        bus.set_address(address)?;
        bus.write_byte(CMD_STANDBY_DISABLE)?;
        bus.write_byte(CMD_ROW_OUTPUT)?;
        self.flush(bus, DisplayBuffer::blank())?;
        bus.write_byte(CMD_DISPLAY_ON)?;

        self.initialized = true;
        debug!("{} at {address} initialized", self.kind);
        Ok(())
    }
}
