//! Outer loop of the board daemon.
//!
//! The keypad is polled every `tick_millis`; a held key is echoed as its
//! number on the tube and as its configured color on the LED, and
//! releasing it clears both.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::{
    signal::unix::{SignalKind, signal},
    time::{MissedTickBehavior, interval},
};

use crate::{
    config::Config,
    drivers::ht16k33::keypad::Key,
    error::{HalError, HalResult},
    manager::DeviceManager,
};

/// Tracks the last key seen and mirrors changes to the outputs.
#[derive(Debug, Default)]
pub struct KeyMirror {
    last: Option<Key>,
}

impl KeyMirror {
    pub fn last(&self) -> Option<Key> {
        self.last
    }

    /// Polls once. Outputs are only written when the key changes; output
    /// failures are logged and do not stop the poll.
    pub fn tick(&mut self, manager: &mut DeviceManager, config: &Config) -> HalResult<Option<Key>> {
        let key = manager.read_key(None)?;
        if key == self.last {
            return Ok(key);
        }
        self.last = key;

        match key {
            Some(key) => {
                info!("Key {key} pressed");
                let [red, green, blue] = config.color_for(key);
                report("tube", manager.display_tube_string(None, &key.to_string(), true));
                report("LED", manager.set_led_color(None, red, green, blue));
            }
            None => {
                debug!("Key released");
                report("tube", manager.clear_tube(None));
                report("LED", manager.set_led_color(None, 0, 0, 0));
            }
        }
        Ok(key)
    }
}

fn report(output: &str, result: HalResult<()>) {
    match result {
        Ok(()) => {}
        Err(HalError::DeviceNotFound { .. }) => debug!("No {output} to update"),
        Err(e) => warn!("Updating {output} failed: {e}"),
    }
}

/// Runs until Ctrl+C or SIGTERM, then closes the manager.
pub async fn run(mut manager: DeviceManager, config: Config) -> Result<()> {
    match manager.set_fan_speed(None, config.fan_level) {
        Ok(()) => info!("Fan set to {}%", config.fan_level),
        Err(e) => warn!("Cannot set fan level: {e}"),
    }

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut poll = interval(Duration::from_millis(config.tick_millis));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut mirror = KeyMirror::default();

    info!("Polling keypad every {} ms", config.tick_millis);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _instant = poll.tick() => {
                match mirror.tick(&mut manager, &config) {
                    Ok(_) => {}
                    Err(HalError::DeviceNotFound { .. }) => debug!("No keypad to poll"),
                    Err(e) => error!("Keypad poll failed: {e}"),
                }
            }
        }
    }

    manager.close();
    Ok(())
}
