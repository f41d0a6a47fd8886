//! Chip driver capability contract and the closed set of supported chips.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    bus::{BusId, BusTransport, ChipAddress},
    drivers::{
        door::{self, DoorController},
        ht16k33::{self, DisplayController},
        pca9685::{self, PwmController},
    },
    error::{HalError, HalResult},
};

/// Peripheral roles found on the board family.
///
/// Two roles can share a chip model (PCA9685 for LEDs and fans, HT16K33 for
/// the tube and the keypad board); they are told apart by address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChipKind {
    /// PCA9685 driving the RGB LED on channels 0-2.
    LedPwm,
    /// PCA9685 driving the fan on channel 0.
    FanPwm,
    /// HT16K33 driving the 4-digit tube.
    Tube,
    /// HT16K33 scanning the 3x4 keypad.
    Keypad,
    /// Motor driver holding a door/curtain position.
    Door,
}

impl ChipKind {
    pub const ALL: [ChipKind; 5] = [
        ChipKind::LedPwm,
        ChipKind::FanPwm,
        ChipKind::Tube,
        ChipKind::Keypad,
        ChipKind::Door,
    ];

    /// Addresses probed, in order, when no address is configured.
    pub fn candidates(self) -> &'static [ChipAddress] {
        match self {
            ChipKind::LedPwm => &pca9685::LED_ADDRESSES,
            ChipKind::FanPwm => &pca9685::FAN_ADDRESSES,
            ChipKind::Tube => &ht16k33::TUBE_ADDRESSES,
            ChipKind::Keypad => &ht16k33::KEYPAD_ADDRESSES,
            ChipKind::Door => &door::ADDRESSES,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChipKind::LedPwm => "led-pwm",
            ChipKind::FanPwm => "fan-pwm",
            ChipKind::Tube => "tube",
            ChipKind::Keypad => "keypad",
            ChipKind::Door => "door",
        }
    }
}

impl fmt::Display for ChipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Two-phase bring-up shared by every chip driver.
///
/// `detect` only confirms presence with a benign probe; `initialize` puts
/// the chip in a known state. Drivers refuse register traffic with
/// [`HalError::NotInitialized`] until `initialize` has succeeded.
pub trait DeviceProtocol {
    fn kind(&self) -> ChipKind;

    /// Address resolved by the last successful `detect`.
    fn address(&self) -> Option<ChipAddress>;

    fn is_initialized(&self) -> bool;

    /// Probes the candidate addresses and keeps the first that answers.
    ///
    /// # Errors
    ///
    /// [`HalError::DeviceNotFound`] once every candidate has been tried.
    fn detect(&mut self, bus: &mut dyn BusTransport) -> HalResult<ChipAddress>;

    /// Sends the chip's start-up sequence to the detected address.
    fn initialize(&mut self, bus: &mut dyn BusTransport) -> HalResult<()>;
}

/// Selects each candidate in turn and returns the first one `probe` accepts.
pub(crate) fn detect_first<F>(
    bus: &mut dyn BusTransport,
    kind: ChipKind,
    preset: Option<ChipAddress>,
    mut probe: F,
) -> HalResult<ChipAddress>
where
    F: FnMut(&mut dyn BusTransport) -> HalResult<()>,
{
    let candidates = match preset {
        Some(address) => vec![address],
        None => kind.candidates().to_vec(),
    };

    for address in candidates {
        if let Err(e) = bus.set_address(address) {
            debug!("Cannot select {address} for {kind}: {e}");
            continue;
        }
        match probe(&mut *bus) {
            Ok(()) => {
                debug!("{kind} answered at {address}");
                return Ok(address);
            }
            Err(e) => debug!("No {kind} at {address}: {e}"),
        }
    }

    Err(HalError::DeviceNotFound { kind })
}

/// Address of a driver that must have been detected; used by `initialize`.
pub(crate) fn detected(kind: ChipKind, address: Option<ChipAddress>) -> HalResult<ChipAddress> {
    address.ok_or(HalError::DeviceNotFound { kind })
}

/// Common guard in front of every register operation: the driver must be
/// initialized, and its address becomes the bus target.
pub(crate) fn select_initialized(
    bus: &mut dyn BusTransport,
    kind: ChipKind,
    address: Option<ChipAddress>,
    initialized: bool,
) -> HalResult<()> {
    match address {
        Some(address) if initialized => bus.set_address(address),
        _ => Err(HalError::NotInitialized { kind }),
    }
}

/// Any supported chip driver.
#[derive(Debug)]
pub enum Device {
    Pwm(PwmController),
    Display(DisplayController),
    Door(DoorController),
}

impl Device {
    /// Fresh, undetected driver for `kind`, optionally pinned to one address.
    pub fn for_kind(kind: ChipKind, preset: Option<ChipAddress>) -> Self {
        match kind {
            ChipKind::LedPwm | ChipKind::FanPwm => Device::Pwm(PwmController::new(kind, preset)),
            ChipKind::Tube | ChipKind::Keypad => {
                Device::Display(DisplayController::new(kind, preset))
            }
            ChipKind::Door => Device::Door(DoorController::new(preset)),
        }
    }

    pub fn as_pwm(&self) -> Option<&PwmController> {
        match self {
            Device::Pwm(pwm) => Some(pwm),
            _ => None,
        }
    }

    pub fn as_display(&self) -> Option<&DisplayController> {
        match self {
            Device::Display(display) => Some(display),
            _ => None,
        }
    }

    pub fn as_display_mut(&mut self) -> Option<&mut DisplayController> {
        match self {
            Device::Display(display) => Some(display),
            _ => None,
        }
    }

    pub fn as_door(&self) -> Option<&DoorController> {
        match self {
            Device::Door(door) => Some(door),
            _ => None,
        }
    }

    fn protocol(&self) -> &dyn DeviceProtocol {
        match self {
            Device::Pwm(pwm) => pwm,
            Device::Display(display) => display,
            Device::Door(door) => door,
        }
    }

    fn protocol_mut(&mut self) -> &mut dyn DeviceProtocol {
        match self {
            Device::Pwm(pwm) => pwm,
            Device::Display(display) => display,
            Device::Door(door) => door,
        }
    }
}

impl DeviceProtocol for Device {
    fn kind(&self) -> ChipKind {
        self.protocol().kind()
    }

    fn address(&self) -> Option<ChipAddress> {
        self.protocol().address()
    }

    fn is_initialized(&self) -> bool {
        self.protocol().is_initialized()
    }

    fn detect(&mut self, bus: &mut dyn BusTransport) -> HalResult<ChipAddress> {
        self.protocol_mut().detect(bus)
    }

    fn initialize(&mut self, bus: &mut dyn BusTransport) -> HalResult<()> {
        self.protocol_mut().initialize(bus)
    }
}

/// Registry entry describing one discovered chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub bus: BusId,
    pub address: ChipAddress,
    pub kind: ChipKind,
    pub initialized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::SimulatedBus;
    use pretty_assertions::assert_eq;

    #[test]
    fn candidate_ranges_do_not_overlap() {
        let mut seen = std::collections::HashSet::new();
        for kind in ChipKind::ALL {
            for address in kind.candidates() {
                assert!(seen.insert(*address), "{address} listed twice");
            }
            assert_eq!(kind.candidates().len(), 4);
        }
    }

    #[test]
    fn kind_names_match_config_spelling() {
        for kind in ChipKind::ALL {
            let yaml = serde_yaml::to_string(&kind).unwrap();
            assert_eq!(yaml.trim(), kind.name());
        }
    }

    #[test]
    fn detect_first_skips_silent_candidates() {
        let mut bus = SimulatedBus::new("sim").with_chip(ChipAddress::fixed(0x72));
        let found = detect_first(&mut bus, ChipKind::Tube, None, |bus| bus.read_byte().map(|_| ()));
        assert_eq!(found.unwrap(), ChipAddress::fixed(0x72));
    }

    #[test]
    fn detect_first_with_preset_probes_only_that_address() {
        let mut bus = SimulatedBus::new("sim")
            .with_chip(ChipAddress::fixed(0x70))
            .with_chip(ChipAddress::fixed(0x71));
        let found = detect_first(
            &mut bus,
            ChipKind::Tube,
            Some(ChipAddress::fixed(0x71)),
            |bus| bus.read_byte().map(|_| ()),
        );
        assert_eq!(found.unwrap(), ChipAddress::fixed(0x71));
        assert_eq!(
            bus.ops()
                .iter()
                .filter(|op| matches!(op, crate::bus::sim::BusOp::Select(_)))
                .count(),
            1
        );
    }

    #[test]
    fn detect_first_exhausted_is_device_not_found() {
        let mut bus = SimulatedBus::new("sim");
        let err = detect_first(&mut bus, ChipKind::Door, None, |bus| bus.read_byte().map(|_| ()))
            .unwrap_err();
        assert!(matches!(
            err,
            HalError::DeviceNotFound {
                kind: ChipKind::Door
            }
        ));
    }

    #[test]
    fn device_for_kind_picks_matching_driver() {
        assert!(Device::for_kind(ChipKind::FanPwm, None).as_pwm().is_some());
        assert!(Device::for_kind(ChipKind::Keypad, None).as_display().is_some());
        assert!(Device::for_kind(ChipKind::Door, None).as_door().is_some());
        assert_eq!(Device::for_kind(ChipKind::Tube, None).kind(), ChipKind::Tube);
        assert!(!Device::for_kind(ChipKind::Tube, None).is_initialized());
    }
}
