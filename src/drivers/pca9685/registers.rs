use crate::error::{HalError, HalResult};

pub const MODE1: u8 = 0x00;

/// First of four registers (ON_L, ON_H, OFF_L, OFF_H) for channel 0; each
/// following channel is 4 registers further.
pub const LED0_ON_L: u8 = 0x06;

/// Broadcast block that drives every channel at once.
pub const ALL_LED_ON_L: u8 = 0xFA;

pub const PRE_SCALE: u8 = 0xFE;

pub const MODE1_RESTART: u8 = 0x80;
pub const MODE1_AUTO_INCREMENT: u8 = 0x20;
pub const MODE1_SLEEP: u8 = 0x10;

pub const CHANNEL_COUNT: u8 = 16;

/// Highest tick count of the 4096-tick PWM period.
pub const MAX_TICKS: u16 = 4095;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
pub const MIN_FREQUENCY_HZ: u32 = 24;
pub const MAX_FREQUENCY_HZ: u32 = 1526;

/// ON_L register of `channel`.
pub fn channel_base(channel: u8) -> HalResult<u8> {
    if channel < CHANNEL_COUNT {
        Ok(LED0_ON_L + 4 * channel)
    } else {
        Err(HalError::InvalidParameter(format!(
            "PWM channel {channel} outside 0..{CHANNEL_COUNT}"
        )))
    }
}

/// ON_L, ON_H, OFF_L, OFF_H for a duty window; ticks above 4095 are clamped.
pub fn encode_duty(on: u16, off: u16) -> [u8; 4] {
    let on = on.min(MAX_TICKS);
    let off = off.min(MAX_TICKS);
    [
        (on & 0xFF) as u8,
        (on >> 8) as u8,
        (off & 0xFF) as u8,
        (off >> 8) as u8,
    ]
}

/// OFF tick for a 0-100 % level with the period starting at tick 0.
///
/// Levels outside 0-100 are clamped first: `-5` behaves as `0`, `150` as
/// `100`.
pub fn duty_off_ticks(level: i32) -> u16 {
    let level = f64::from(level.clamp(0, 100));
    (level / 100.0 * f64::from(MAX_TICKS)).round() as u16
}

/// PRE_SCALE value for an output frequency in Hz.
pub fn prescale_for(hz: u32) -> HalResult<u8> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
        return Err(HalError::InvalidParameter(format!(
            "PWM frequency {hz} Hz outside {MIN_FREQUENCY_HZ}..={MAX_FREQUENCY_HZ}"
        )));
    }
    let prescale = (OSCILLATOR_HZ / (4096.0 * f64::from(hz))).round() - 1.0;
    Ok(prescale as u8)
}
