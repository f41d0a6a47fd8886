//! PCA9685 16-channel, 12-bit PWM driver.
//!
//! The same chip drives the RGB LED (channels 0-2) and the fan (channel 0)
//! on different boards; the [`ChipKind`] only decides which addresses are
//! probed.

pub mod registers;

use std::{thread, time::Duration};

use log::{debug, warn};

use crate::{
    bus::{BusTransport, ChipAddress},
    device::{self, ChipKind, DeviceProtocol},
    error::{HalError, HalResult},
};

use registers::{
    ALL_LED_ON_L, MODE1, MODE1_AUTO_INCREMENT, MODE1_RESTART, MODE1_SLEEP, PRE_SCALE,
    channel_base, duty_off_ticks, encode_duty, prescale_for,
};

/// Addresses of the LED board PWM chip.
pub const LED_ADDRESSES: [ChipAddress; 4] = [
    ChipAddress::fixed(0x60),
    ChipAddress::fixed(0x61),
    ChipAddress::fixed(0x62),
    ChipAddress::fixed(0x63),
];

/// Addresses of the fan board PWM chip.
pub const FAN_ADDRESSES: [ChipAddress; 4] = [
    ChipAddress::fixed(0x64),
    ChipAddress::fixed(0x65),
    ChipAddress::fixed(0x66),
    ChipAddress::fixed(0x67),
];

pub const FAN_CHANNEL: u8 = 0;

/// Red, green and blue LED channels.
pub const RGB_CHANNELS: [u8; 3] = [0, 1, 2];

/// Oscillator start-up time after leaving sleep.
const OSCILLATOR_SETTLE: Duration = Duration::from_micros(500);

/// Output selector for duty writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmChannel {
    /// One output, `0..=15`.
    Index(u8),
    /// Every output through the broadcast registers.
    All,
}

#[derive(Debug)]
pub struct PwmController {
    kind: ChipKind,
    preset: Option<ChipAddress>,
    address: Option<ChipAddress>,
    initialized: bool,
}

impl PwmController {
    /// `kind` is [`ChipKind::LedPwm`] or [`ChipKind::FanPwm`]; `preset`
    /// restricts detection to a single address.
    pub fn new(kind: ChipKind, preset: Option<ChipAddress>) -> Self {
        Self {
            kind,
            preset,
            address: None,
            initialized: false,
        }
    }

    pub fn led(preset: Option<ChipAddress>) -> Self {
        Self::new(ChipKind::LedPwm, preset)
    }

    pub fn fan(preset: Option<ChipAddress>) -> Self {
        Self::new(ChipKind::FanPwm, preset)
    }

    fn ready(&self, bus: &mut dyn BusTransport) -> HalResult<()> {
        device::select_initialized(bus, self.kind, self.address, self.initialized)
    }

    /// Writes one channel's ON and OFF tick counts (clamped to 0-4095).
    ///
    /// # Errors
    ///
    /// [`HalError::InvalidParameter`] for a channel above 15, before any bus
    /// traffic; [`HalError::NotInitialized`] before `initialize`.
    pub fn set_pwm(
        &self,
        bus: &mut dyn BusTransport,
        channel: PwmChannel,
        on: u16,
        off: u16,
    ) -> HalResult<()> {
        let base = match channel {
            PwmChannel::All => return self.set_all_pwm(bus, on, off),
            PwmChannel::Index(index) => channel_base(index)?,
        };
        self.ready(bus)?;

        encode_duty(on, off)
            .iter()
            .zip(base..)
            .try_for_each(|(&value, register)| bus.write_byte_data(register, value))
    }

    /// Writes the broadcast block in a single burst.
    pub fn set_all_pwm(&self, bus: &mut dyn BusTransport, on: u16, off: u16) -> HalResult<()> {
        self.ready(bus)?;
        bus.write_block_data(ALL_LED_ON_L, &encode_duty(on, off))
    }

    /// Drives `channel` at `level` percent, clamped to 0-100.
    pub fn set_level(
        &self,
        bus: &mut dyn BusTransport,
        channel: PwmChannel,
        level: i32,
    ) -> HalResult<()> {
        let off = duty_off_ticks(level);
        debug!("{} {channel:?}: level {level}% -> off tick {off}", self.kind);
        self.set_pwm(bus, channel, 0, off)
    }

    pub fn set_fan_speed(&self, bus: &mut dyn BusTransport, level: i32) -> HalResult<()> {
        self.set_level(bus, PwmChannel::Index(FAN_CHANNEL), level)
    }

    /// Sets the three LED channels; each component is a 0-100 level.
    pub fn set_rgb(
        &self,
        bus: &mut dyn BusTransport,
        red: i32,
        green: i32,
        blue: i32,
    ) -> HalResult<()> {
        RGB_CHANNELS
            .iter()
            .zip([red, green, blue])
            .try_for_each(|(&channel, level)| {
                self.set_level(&mut *bus, PwmChannel::Index(channel), level)
            })
    }

    /// Reprograms the output frequency. The prescaler only latches while the
    /// oscillator sleeps, so outputs pause for roughly half a millisecond.
    ///
    /// If the prescaler write fails, the oscillator is woken again before
    /// the error is returned.
    pub fn set_frequency(&self, bus: &mut dyn BusTransport, hz: u32) -> HalResult<()> {
        let prescale = prescale_for(hz)?;
        self.ready(bus)?;

        let mode = bus.read_byte_data(MODE1)? & !MODE1_RESTART;
        let awake = mode & !MODE1_SLEEP;
        bus.write_byte_data(MODE1, mode | MODE1_SLEEP)?;

        let latched = bus
            .write_byte_data(PRE_SCALE, prescale)
            .and_then(|()| bus.write_byte_data(MODE1, awake));
        if let Err(e) = latched {
            if let Err(wake) = bus.write_byte_data(MODE1, awake) {
                warn!("{} left asleep after failed frequency change: {wake}", self.kind);
            }
            return Err(e);
        }
        thread::sleep(OSCILLATOR_SETTLE);
        bus.write_byte_data(MODE1, awake | MODE1_RESTART)?;

        debug!("{} frequency set to {hz} Hz (prescale {prescale})", self.kind);
        Ok(())
    }
}

impl DeviceProtocol for PwmController {
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
        let address = device::detect_first(bus, self.kind, self.preset, |bus| {
            bus.read_byte_data(MODE1).map(|_| ())
        })?;
        self.address = Some(address);
        self.initialized = false;
        Ok(address)
    }

    /// Wakes the oscillator with register auto-increment enabled, then
    /// switches every output off.
    fn initialize(&mut self, bus: &mut dyn BusTransport) -> HalResult<()> {
        let address = device::detected(self.kind, self.address)?;
        self.initialized = false;

        bus.set_address(address)?;
        bus.write_byte_data(MODE1, MODE1_AUTO_INCREMENT)?;
        thread::sleep(OSCILLATOR_SETTLE);
        bus.write_block_data(ALL_LED_ON_L, &encode_duty(0, 0))?;

        self.initialized = true;
        debug!("{} at {address} initialized", self.kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MockBusTransport, sim::BusOp, sim::SimulatedBus};
    use pretty_assertions::assert_eq;

    const LED: ChipAddress = ChipAddress::fixed(0x60);
    const FAN: ChipAddress = ChipAddress::fixed(0x65);

    fn ready_led() -> (PwmController, SimulatedBus) {
        let mut bus = SimulatedBus::new("sim").with_chip(LED);
        let mut pwm = PwmController::led(None);
        pwm.detect(&mut bus).unwrap();
        pwm.initialize(&mut bus).unwrap();
        bus.clear_log();
        (pwm, bus)
    }

    #[test]
    fn detect_reads_mode1_and_resolves_first_answer() {
        let mut bus = SimulatedBus::new("sim").with_chip(FAN);
        let mut pwm = PwmController::fan(None);

        assert_eq!(pwm.detect(&mut bus).unwrap(), FAN);
        assert_eq!(pwm.address(), Some(FAN));
        assert!(bus.ops().contains(&BusOp::ReadByteData(FAN, MODE1)));
        assert!(!pwm.is_initialized());
    }

    #[test]
    fn detect_without_chip_is_not_found() {
        let mut bus = SimulatedBus::new("sim").with_chip(FAN);
        let mut pwm = PwmController::led(None);
        assert!(matches!(
            pwm.detect(&mut bus),
            Err(HalError::DeviceNotFound {
                kind: ChipKind::LedPwm
            })
        ));
        assert_eq!(pwm.address(), None);
    }

    #[test]
    fn initialize_wakes_chip_and_turns_outputs_off() {
        let mut bus = SimulatedBus::new("sim").with_chip(LED);
        let mut pwm = PwmController::led(None);
        pwm.detect(&mut bus).unwrap();
        bus.clear_log();

        pwm.initialize(&mut bus).unwrap();

        assert!(pwm.is_initialized());
        assert_eq!(
            bus.writes(),
            vec![
                BusOp::WriteByteData(LED, MODE1, MODE1_AUTO_INCREMENT),
                BusOp::WriteBlock(LED, ALL_LED_ON_L, vec![0, 0, 0, 0]),
            ]
        );
    }

    #[test]
    fn initialize_failure_leaves_driver_unusable() {
        let mut bus = SimulatedBus::new("sim")
            .with_chip(LED)
            .with_failing_writes(LED);
        let mut pwm = PwmController::led(None);
        pwm.detect(&mut bus).unwrap();

        assert!(pwm.initialize(&mut bus).is_err());
        assert!(!pwm.is_initialized());
        assert!(matches!(
            pwm.set_pwm(&mut bus, PwmChannel::Index(0), 0, 100),
            Err(HalError::NotInitialized { .. })
        ));
    }

    #[test]
    fn initialize_before_detect_is_rejected() {
        let mut bus = SimulatedBus::new("sim").with_chip(LED);
        let mut pwm = PwmController::led(None);
        assert!(pwm.initialize(&mut bus).is_err());
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn set_pwm_writes_four_registers_low_then_high() {
        let (pwm, mut bus) = ready_led();
        pwm.set_pwm(&mut bus, PwmChannel::Index(2), 0x0010, 0x0ABC)
            .unwrap();

        assert_eq!(
            bus.writes(),
            vec![
                BusOp::WriteByteData(LED, 0x0E, 0x10),
                BusOp::WriteByteData(LED, 0x0F, 0x00),
                BusOp::WriteByteData(LED, 0x10, 0xBC),
                BusOp::WriteByteData(LED, 0x11, 0x0A),
            ]
        );
    }

    #[test]
    fn set_pwm_rejects_bad_channel_without_touching_the_bus() {
        let mut bus = MockBusTransport::new();
        bus.expect_set_address().times(0);
        bus.expect_write_byte_data().times(0);
        bus.expect_write_block_data().times(0);

        let pwm = PwmController::led(None);
        let err = pwm
            .set_pwm(&mut bus, PwmChannel::Index(16), 0, 4095)
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));
    }

    #[test]
    fn set_pwm_rejects_bad_channel_on_initialized_chip() {
        let (pwm, mut bus) = ready_led();
        assert!(matches!(
            pwm.set_pwm(&mut bus, PwmChannel::Index(200), 0, 1),
            Err(HalError::InvalidParameter(_))
        ));
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn set_pwm_before_initialize_is_refused() {
        let mut bus = MockBusTransport::new();
        bus.expect_write_byte_data().times(0);

        let pwm = PwmController::fan(None);
        assert!(matches!(
            pwm.set_pwm(&mut bus, PwmChannel::Index(0), 0, 10),
            Err(HalError::NotInitialized {
                kind: ChipKind::FanPwm
            })
        ));
    }

    #[test]
    fn all_channels_use_single_burst() {
        let (pwm, mut bus) = ready_led();
        pwm.set_pwm(&mut bus, PwmChannel::All, 0, 4095).unwrap();

        assert_eq!(
            bus.writes(),
            vec![BusOp::WriteBlock(LED, ALL_LED_ON_L, vec![0, 0, 0xFF, 0x0F])]
        );
    }

    #[test]
    fn fan_speed_levels_map_to_off_ticks() {
        let (pwm, mut bus) = ready_led();

        for (level, off) in [(0, 0u16), (100, 4095), (-5, 0), (150, 4095), (25, 1024)] {
            pwm.set_fan_speed(&mut bus, level).unwrap();
            let ticks = u16::from(bus.register(LED, 0x08).unwrap())
                | u16::from(bus.register(LED, 0x09).unwrap()) << 8;
            assert_eq!(ticks, off, "level {level}");
            assert_eq!(bus.register(LED, 0x06), Some(0));
            assert_eq!(bus.register(LED, 0x07), Some(0));
        }
    }

    #[test]
    fn rgb_drives_first_three_channels() {
        let (pwm, mut bus) = ready_led();
        pwm.set_rgb(&mut bus, 100, 0, 50).unwrap();

        let off = |channel: u8| {
            let base = channel_base(channel).unwrap();
            u16::from(bus.register(LED, base + 2).unwrap())
                | u16::from(bus.register(LED, base + 3).unwrap()) << 8
        };
        assert_eq!(off(0), 4095);
        assert_eq!(off(1), 0);
        assert_eq!(off(2), 2048);
    }

    #[test]
    fn frequency_latches_prescale_while_sleeping() {
        let (pwm, mut bus) = ready_led();
        pwm.set_frequency(&mut bus, 200).unwrap();

        assert_eq!(
            bus.writes(),
            vec![
                BusOp::WriteByteData(LED, MODE1, MODE1_AUTO_INCREMENT | MODE1_SLEEP),
                BusOp::WriteByteData(LED, PRE_SCALE, 30),
                BusOp::WriteByteData(LED, MODE1, MODE1_AUTO_INCREMENT),
                BusOp::WriteByteData(LED, MODE1, MODE1_AUTO_INCREMENT | MODE1_RESTART),
            ]
        );
    }

    #[test]
    fn failed_prescale_write_wakes_the_oscillator() {
        let mut bus = SimulatedBus::new("sim")
            .with_chip(LED)
            .with_failing_register(LED, PRE_SCALE);
        let mut pwm = PwmController::led(None);
        pwm.detect(&mut bus).unwrap();
        pwm.initialize(&mut bus).unwrap();
        bus.clear_log();

        assert!(matches!(
            pwm.set_frequency(&mut bus, 200),
            Err(HalError::TransportError { .. })
        ));
        assert_eq!(bus.register(LED, MODE1), Some(MODE1_AUTO_INCREMENT));
        assert_eq!(
            bus.writes().last(),
            Some(&BusOp::WriteByteData(LED, MODE1, MODE1_AUTO_INCREMENT))
        );
    }

    #[test]
    fn frequency_out_of_range_is_rejected_before_traffic() {
        let (pwm, mut bus) = ready_led();
        assert!(matches!(
            pwm.set_frequency(&mut bus, 5),
            Err(HalError::InvalidParameter(_))
        ));
        assert!(bus.ops().is_empty());
    }
}
