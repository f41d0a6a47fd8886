//! Bus ownership, device discovery and the high-level board API.

use std::{collections::BTreeMap, fmt, ops::RangeInclusive, path::Path};

use log::{debug, info, warn};

use crate::{
    bus::{BusId, BusTransport, ChipAddress, linux::LinuxI2cBus},
    config::{Config, DeviceCfg},
    device::{ChipKind, Device, DeviceProtocol, DeviceRecord},
    drivers::{
        ht16k33::{DisplayController, keypad::Key, segments::DisplayBuffer},
        pca9685::PwmController,
    },
    error::{HalError, HalResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeviceKey {
    bus: BusId,
    address: ChipAddress,
}

/// Owns every open bus and every initialized chip driver.
///
/// Drivers are keyed by `(bus, address)` and iterated in that order, so
/// "the first device of a kind" is the one on the lowest bus at the lowest
/// address. All buses are closed on [`close`](Self::close) or drop.
///
/// # Example
///
/// ```
/// use i2c_boardd::{bus::{BusId, sim::SimulatedBus}, manager::DeviceManager};
///
/// let mut manager = DeviceManager::default();
/// manager.attach_bus(BusId(5), SimulatedBus::board("i2c-5"))?;
/// manager.scan_devices();
/// manager.display_tube_string(None, "42", true)?;
/// manager.set_fan_speed(None, 75)?;
/// # Ok::<(), i2c_boardd::error::HalError>(())
/// ```
pub struct DeviceManager {
    path_prefix: String,
    force: bool,
    devices_cfg: Vec<DeviceCfg>,
    buses: BTreeMap<BusId, Box<dyn BusTransport>>,
    registry: BTreeMap<DeviceKey, Device>,
}

impl DeviceManager {
    /// `devices_cfg` lists the chips probed on every bus by
    /// [`scan_devices`](Self::scan_devices).
    pub fn new(path_prefix: impl Into<String>, devices_cfg: Vec<DeviceCfg>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            force: false,
            devices_cfg,
            buses: BTreeMap::new(),
            registry: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.bus.path_prefix.clone(), config.devices.clone())
            .with_forced_select(config.bus.force)
    }

    /// Buses opened by [`scan_buses`](Self::scan_buses) select targets even
    /// when a kernel driver holds the address. See
    /// [`LinuxI2cBus::open_forced`].
    pub fn with_forced_select(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Opens `<prefix>N` for every `N` in `range`. Nodes that cannot be
    /// opened are logged and skipped. Returns how many buses were added.
    ///
    /// Ids already held by this manager are skipped without touching the
    /// node.
    pub fn scan_buses(&mut self, range: RangeInclusive<u8>) -> usize {
        if self.force {
            self.scan_buses_with(range, |path| LinuxI2cBus::open_forced(path))
        } else {
            self.scan_buses_with(range, |path| LinuxI2cBus::open(path))
        }
    }

    /// [`scan_buses`](Self::scan_buses) with a custom opener.
    pub fn scan_buses_with<B, F>(&mut self, range: RangeInclusive<u8>, mut opener: F) -> usize
    where
        B: BusTransport + 'static,
        F: FnMut(&Path) -> HalResult<B>,
    {
        let mut opened = 0;
        for id in range.map(BusId) {
            if self.buses.contains_key(&id) {
                debug!("Bus {id} already open");
                continue;
            }
            let path = id.path(&self.path_prefix);
            match opener(&path) {
                Ok(bus) => {
                    info!("Opened bus {id} ({})", path.display());
                    self.buses.insert(id, Box::new(bus));
                    opened += 1;
                }
                Err(e) => warn!("Skipping bus {id}: {e}"),
            }
        }
        opened
    }

    /// Hands an already opened bus to the manager.
    ///
    /// # Errors
    ///
    /// [`HalError::BusUnavailable`] if `id` is already held; the new bus is
    /// closed and dropped.
    pub fn attach_bus<B>(&mut self, id: BusId, mut bus: B) -> HalResult<()>
    where
        B: BusTransport + 'static,
    {
        if self.buses.contains_key(&id) {
            bus.close();
            return Err(HalError::bus_unavailable(id.to_string(), "already held"));
        }
        self.buses.insert(id, Box::new(bus));
        Ok(())
    }

    pub fn bus_ids(&self) -> Vec<BusId> {
        self.buses.keys().copied().collect()
    }

    /// Acknowledging addresses in `start..=end` on every open bus.
    pub fn scan_addresses(
        &mut self,
        start: ChipAddress,
        end: ChipAddress,
    ) -> Vec<(BusId, Vec<ChipAddress>)> {
        self.buses
            .iter_mut()
            .map(|(&id, bus)| (id, bus.scan(start, end)))
            .collect()
    }

    /// Detects and initializes every configured chip kind on every open bus.
    ///
    /// A chip that is absent or fails to initialize is logged and skipped;
    /// discovery always continues. Kinds already registered on a bus are not
    /// probed again. Returns how many devices were added.
    pub fn scan_devices(&mut self) -> usize {
        let mut added = 0;

        for (&bus_id, bus) in self.buses.iter_mut() {
            for cfg in &self.devices_cfg {
                let known = self.registry.iter().any(|(key, device)| {
                    key.bus == bus_id
                        && device.kind() == cfg.kind
                        && cfg.address.is_none_or(|address| address == key.address)
                });
                if known {
                    debug!("{} already registered on {bus_id}", cfg.kind);
                    continue;
                }

                let mut device = Device::for_kind(cfg.kind, cfg.address);
                let address = match device.detect(bus.as_mut()) {
                    Ok(address) => address,
                    Err(HalError::DeviceNotFound { .. }) => {
                        debug!("No {} on {bus_id}", cfg.kind);
                        continue;
                    }
                    Err(e) => {
                        warn!("Probing {} on {bus_id} failed: {e}", cfg.kind);
                        continue;
                    }
                };

                let key = DeviceKey {
                    bus: bus_id,
                    address,
                };
                if self.registry.contains_key(&key) {
                    debug!("{address} on {bus_id} already claimed");
                    continue;
                }

                if let Err(e) = device.initialize(bus.as_mut()) {
                    warn!("Initializing {} at {address} on {bus_id} failed: {e}", cfg.kind);
                    continue;
                }

                if let (Some(hz), Some(pwm)) = (cfg.frequency_hz, device.as_pwm()) {
                    if let Err(e) = pwm.set_frequency(bus.as_mut(), hz) {
                        warn!("Setting {} at {address} to {hz} Hz failed: {e}", cfg.kind);
                        continue;
                    }
                }

                info!("Found {} at {address} on {bus_id}", cfg.kind);
                self.registry.insert(key, device);
                added += 1;
            }
        }

        info!(
            "{} device(s) registered on {} bus(es)",
            self.registry.len(),
            self.buses.len()
        );
        added
    }

    /// Snapshot of the registry, ordered by bus then address.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry
            .iter()
            .map(|(key, device)| DeviceRecord {
                bus: key.bus,
                address: key.address,
                kind: device.kind(),
                initialized: device.is_initialized(),
            })
            .collect()
    }

    fn find(&self, kind: ChipKind, at: Option<ChipAddress>) -> HalResult<DeviceKey> {
        self.registry
            .iter()
            .find(|(key, device)| {
                device.kind() == kind && at.is_none_or(|address| address == key.address)
            })
            .map(|(key, _)| *key)
            .ok_or(HalError::DeviceNotFound { kind })
    }

    /// Runs `f` on the device of `kind` (at `at`, or the first one) with its
    /// bus.
    fn with_device<T, F>(&mut self, kind: ChipKind, at: Option<ChipAddress>, f: F) -> HalResult<T>
    where
        F: FnOnce(&mut Device, &mut dyn BusTransport) -> HalResult<T>,
    {
        let key = self.find(kind, at)?;
        let bus = self
            .buses
            .get_mut(&key.bus)
            .ok_or_else(|| HalError::bus_unavailable(key.bus.to_string(), "bus is not open"))?;
        let device = self
            .registry
            .get_mut(&key)
            .ok_or(HalError::DeviceNotFound { kind })?;
        f(device, bus.as_mut())
    }

    /// LED color as three 0-100 levels.
    pub fn set_led_color(
        &mut self,
        at: Option<ChipAddress>,
        red: i32,
        green: i32,
        blue: i32,
    ) -> HalResult<()> {
        self.with_device(ChipKind::LedPwm, at, |device, bus| {
            pwm_of(device, ChipKind::LedPwm)?.set_rgb(bus, red, green, blue)
        })
    }

    pub fn set_fan_speed(&mut self, at: Option<ChipAddress>, level: i32) -> HalResult<()> {
        self.with_device(ChipKind::FanPwm, at, |device, bus| {
            pwm_of(device, ChipKind::FanPwm)?.set_fan_speed(bus, level)
        })
    }

    pub fn display_tube_string(
        &mut self,
        at: Option<ChipAddress>,
        text: &str,
        align_right: bool,
    ) -> HalResult<()> {
        self.with_device(ChipKind::Tube, at, |device, bus| {
            display_of(device, ChipKind::Tube)?.display_string(bus, text, align_right)
        })
    }

    /// Writes one digit counted from the left.
    pub fn display_tube_char(
        &mut self,
        at: Option<ChipAddress>,
        index: usize,
        ch: char,
    ) -> HalResult<()> {
        self.with_device(ChipKind::Tube, at, |device, bus| {
            display_of(device, ChipKind::Tube)?.display_char_left(bus, index, ch)
        })
    }

    pub fn clear_tube(&mut self, at: Option<ChipAddress>) -> HalResult<()> {
        self.with_device(ChipKind::Tube, at, |device, bus| {
            display_of(device, ChipKind::Tube)?.clear(bus)
        })
    }

    pub fn tube_buffer(&self, at: Option<ChipAddress>) -> HalResult<DisplayBuffer> {
        let key = self.find(ChipKind::Tube, at)?;
        self.registry
            .get(&key)
            .and_then(Device::as_display)
            .map(|display| *display.buffer())
            .ok_or(HalError::DeviceNotFound {
                kind: ChipKind::Tube,
            })
    }

    /// Polls the keypad board, or the tube chip's key RAM when no keypad
    /// board was found.
    pub fn read_key(&mut self, at: Option<ChipAddress>) -> HalResult<Option<Key>> {
        match self.with_device(ChipKind::Keypad, at, read_display_key) {
            Err(HalError::DeviceNotFound { .. }) => self
                .with_device(ChipKind::Tube, at, read_display_key)
                .map_err(|e| match e {
                    HalError::DeviceNotFound { .. } => HalError::DeviceNotFound {
                        kind: ChipKind::Keypad,
                    },
                    other => other,
                }),
            result => result,
        }
    }

    pub fn set_door_position(&mut self, at: Option<ChipAddress>, percent: i32) -> HalResult<()> {
        self.with_device(ChipKind::Door, at, |device, bus| {
            device
                .as_door()
                .ok_or(HalError::DeviceNotFound {
                    kind: ChipKind::Door,
                })?
                .set_position(bus, percent)
        })
    }

    /// Closes every bus and forgets every device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.buses.is_empty() && self.registry.is_empty() {
            return;
        }
        self.registry.clear();
        for (id, bus) in self.buses.iter_mut() {
            debug!("Closing bus {id}");
            bus.close();
        }
        self.buses.clear();
        info!("Device manager closed");
    }
}

fn pwm_of(device: &Device, kind: ChipKind) -> HalResult<&PwmController> {
    device.as_pwm().ok_or(HalError::DeviceNotFound { kind })
}

fn display_of(device: &mut Device, kind: ChipKind) -> HalResult<&mut DisplayController> {
    device
        .as_display_mut()
        .ok_or(HalError::DeviceNotFound { kind })
}

fn read_display_key(device: &mut Device, bus: &mut dyn BusTransport) -> HalResult<Option<Key>> {
    let kind = device.kind();
    device
        .as_display()
        .ok_or(HalError::DeviceNotFound { kind })?
        .read_key(bus)
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("path_prefix", &self.path_prefix)
            .field("force", &self.force)
            .field("buses", &self.bus_ids())
            .field("devices", &self.devices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::sim::{LOG_CAPACITY, SimulatedBus},
        drivers::{
            door::POSITION_REG,
            ht16k33::keypad::KEY_RAM,
            pca9685::registers::{MODE1, MODE1_SLEEP, PRE_SCALE},
        },
    };
    use std::path::PathBuf;
    use pretty_assertions::assert_eq;

    fn addr(raw: u8) -> ChipAddress {
        ChipAddress::new(raw).unwrap()
    }

    fn board_manager() -> (DeviceManager, SimulatedBus) {
        let bus = SimulatedBus::board("i2c-5");
        let mut manager = DeviceManager::default();
        manager.attach_bus(BusId(5), bus.clone()).unwrap();
        manager.scan_devices();
        (manager, bus)
    }

    #[test]
    fn discovers_every_chip_on_reference_board() {
        let (manager, _bus) = board_manager();
        let found: Vec<(ChipKind, u8)> = manager
            .devices()
            .iter()
            .map(|record| (record.kind, record.address.get()))
            .collect();

        assert_eq!(
            found,
            vec![
                (ChipKind::LedPwm, 0x60),
                (ChipKind::FanPwm, 0x64),
                (ChipKind::Tube, 0x70),
                (ChipKind::Keypad, 0x74),
            ]
        );
        assert!(manager.devices().iter().all(|record| record.initialized));
        assert!(manager.devices().iter().all(|record| record.bus == BusId(5)));
    }

    #[test]
    fn rescan_does_not_duplicate_devices() {
        let (mut manager, _bus) = board_manager();
        assert_eq!(manager.scan_devices(), 0);
        assert_eq!(manager.devices().len(), 4);
    }

    #[test]
    fn unopenable_buses_are_skipped() {
        let mut manager = DeviceManager::default();
        let opened = manager.scan_buses_with(0..=2, |path| {
            if path == Path::new("/dev/i2c-1") {
                Ok(SimulatedBus::new("i2c-1"))
            } else {
                Err(HalError::bus_unavailable(path.display().to_string(), "missing"))
            }
        });

        assert_eq!(opened, 1);
        assert_eq!(manager.bus_ids(), vec![BusId(1)]);
    }

    #[test]
    fn missing_bus_nodes_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let prefix = format!("{}/i2c-", dir.path().display());
        let mut manager = DeviceManager::new(prefix, Vec::new());

        assert_eq!(manager.scan_buses(0..=3), 0);
        assert!(manager.bus_ids().is_empty());
    }

    #[test]
    fn bus_id_cannot_be_attached_twice() {
        let first = SimulatedBus::new("a");
        let second = SimulatedBus::new("b");
        let mut manager = DeviceManager::default();

        manager.attach_bus(BusId(0), first.clone()).unwrap();
        assert!(matches!(
            manager.attach_bus(BusId(0), second.clone()),
            Err(HalError::BusUnavailable { .. })
        ));
        assert_eq!(second.releases(), 1);
        assert!(first.is_open());
    }

    #[test]
    fn held_bus_ids_are_not_reopened() {
        let mut manager = DeviceManager::default();
        manager
            .attach_bus(BusId(1), SimulatedBus::new("held"))
            .unwrap();

        let mut opened_paths = Vec::new();
        let opened = manager.scan_buses_with(0..=2, |path| {
            opened_paths.push(path.to_path_buf());
            Ok(SimulatedBus::new(path.display().to_string()))
        });

        assert_eq!(opened, 2);
        assert_eq!(
            opened_paths,
            vec![PathBuf::from("/dev/i2c-0"), PathBuf::from("/dev/i2c-2")]
        );
        assert_eq!(manager.bus_ids(), vec![BusId(0), BusId(1), BusId(2)]);
    }

    #[test]
    fn forced_select_follows_config() {
        let mut config = Config::default();
        assert!(!DeviceManager::from_config(&config).force);

        config.bus.force = true;
        assert!(DeviceManager::from_config(&config).force);
    }

    #[test]
    fn failing_device_does_not_stop_discovery() {
        let bus = SimulatedBus::board("i2c-0").with_failing_writes(addr(0x60));
        let mut manager = DeviceManager::default();
        manager.attach_bus(BusId(0), bus).unwrap();

        assert_eq!(manager.scan_devices(), 3);
        let kinds: Vec<ChipKind> = manager.devices().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ChipKind::FanPwm, ChipKind::Tube, ChipKind::Keypad]);
        assert!(matches!(
            manager.set_led_color(None, 100, 0, 0),
            Err(HalError::DeviceNotFound {
                kind: ChipKind::LedPwm
            })
        ));
    }

    #[test]
    fn forwarding_without_devices_is_not_found() {
        let mut manager = DeviceManager::default();
        assert!(matches!(
            manager.set_fan_speed(None, 50),
            Err(HalError::DeviceNotFound {
                kind: ChipKind::FanPwm
            })
        ));
        assert!(matches!(
            manager.set_door_position(None, 50),
            Err(HalError::DeviceNotFound {
                kind: ChipKind::Door
            })
        ));
        assert!(matches!(
            manager.read_key(None),
            Err(HalError::DeviceNotFound {
                kind: ChipKind::Keypad
            })
        ));
    }

    #[test]
    fn tube_forwarding_updates_buffer() {
        let (mut manager, _bus) = board_manager();
        manager.display_tube_string(None, "12", true).unwrap();

        let buffer = manager.tube_buffer(None).unwrap();
        assert_eq!(buffer, DisplayBuffer::from_text("12", true));

        manager.display_tube_char(None, 0, '9').unwrap();
        assert_eq!(
            manager.tube_buffer(None).unwrap(),
            DisplayBuffer::from_text("9 12", false)
        );

        manager.clear_tube(None).unwrap();
        assert!(manager.tube_buffer(None).unwrap().is_blank());
    }

    #[test]
    fn explicit_address_selects_among_same_kind() {
        let bus = SimulatedBus::new("i2c-0")
            .with_chip(addr(0x70))
            .with_chip(addr(0x71));
        let devices = vec![
            DeviceCfg {
                address: Some(addr(0x70)),
                ..DeviceCfg::new(ChipKind::Tube)
            },
            DeviceCfg {
                address: Some(addr(0x71)),
                ..DeviceCfg::new(ChipKind::Tube)
            },
        ];
        let mut manager = DeviceManager::new("/dev/i2c-", devices);
        manager.attach_bus(BusId(0), bus).unwrap();
        assert_eq!(manager.scan_devices(), 2);

        manager
            .display_tube_string(Some(addr(0x71)), "8", true)
            .unwrap();
        assert!(manager.tube_buffer(Some(addr(0x70))).unwrap().is_blank());
        assert!(!manager.tube_buffer(Some(addr(0x71))).unwrap().is_blank());
        assert!(manager.tube_buffer(None).unwrap().is_blank());
        assert!(manager.tube_buffer(Some(addr(0x72))).is_err());
    }

    #[test]
    fn read_key_prefers_keypad_board() {
        let (mut manager, bus) = board_manager();
        assert_eq!(manager.read_key(None).unwrap(), None);

        bus.set_register(addr(0x74), KEY_RAM + 4, 0x01);
        assert_eq!(manager.read_key(None).unwrap(), Some(Key::K3));
    }

    #[test]
    fn read_key_falls_back_to_tube_chip() {
        let bus = SimulatedBus::new("i2c-0").with_chip(addr(0x70));
        let mut manager = DeviceManager::default();
        manager.attach_bus(BusId(0), bus.clone()).unwrap();
        manager.scan_devices();

        bus.set_register(addr(0x70), KEY_RAM, 0x02);
        assert_eq!(manager.read_key(None).unwrap(), Some(Key::K4));
    }

    #[test]
    fn configured_frequency_is_applied() {
        let bus = SimulatedBus::board("i2c-0");
        let devices = vec![DeviceCfg {
            frequency_hz: Some(200),
            ..DeviceCfg::new(ChipKind::FanPwm)
        }];
        let mut manager = DeviceManager::new("/dev/i2c-", devices);
        manager.attach_bus(BusId(0), bus.clone()).unwrap();
        manager.scan_devices();

        assert_eq!(bus.register(addr(0x64), PRE_SCALE), Some(30));
        manager.set_fan_speed(None, 100).unwrap();
    }

    #[test]
    fn failed_frequency_leaves_device_unregistered() {
        let bus = SimulatedBus::board("i2c-0").with_failing_register(addr(0x64), PRE_SCALE);
        let devices = vec![
            DeviceCfg {
                frequency_hz: Some(200),
                ..DeviceCfg::new(ChipKind::FanPwm)
            },
            DeviceCfg::new(ChipKind::Tube),
        ];
        let mut manager = DeviceManager::new("/dev/i2c-", devices);
        manager.attach_bus(BusId(0), bus.clone()).unwrap();

        assert_eq!(manager.scan_devices(), 1);
        assert!(matches!(
            manager.set_fan_speed(None, 100),
            Err(HalError::DeviceNotFound {
                kind: ChipKind::FanPwm
            })
        ));
        assert_eq!(bus.register(addr(0x64), MODE1).map(|mode| mode & MODE1_SLEEP), Some(0));
    }

    #[test]
    fn log_stays_bounded_while_polling_keys() {
        let (mut manager, bus) = board_manager();
        for _ in 0..10_000 {
            manager.read_key(None).unwrap();
        }
        assert_eq!(bus.ops().len(), LOG_CAPACITY);
    }

    #[test]
    fn door_position_is_forwarded() {
        let bus = SimulatedBus::new("i2c-0").with_chip(addr(0x1C));
        let mut manager = DeviceManager::default();
        manager.attach_bus(BusId(0), bus.clone()).unwrap();
        manager.scan_devices();

        manager.set_door_position(None, 65).unwrap();
        assert_eq!(
            bus.register(addr(0x1C), POSITION_REG),
            Some(65)
        );
    }

    #[test]
    fn address_scan_lists_responders() {
        let (mut manager, _bus) = board_manager();
        let found = manager.scan_addresses(ChipAddress::FIRST, ChipAddress::LAST);
        assert_eq!(
            found,
            vec![(
                BusId(5),
                vec![addr(0x60), addr(0x64), addr(0x70), addr(0x74)]
            )]
        );
    }

    #[test]
    fn close_is_idempotent_and_releases_once() {
        let (mut manager, bus) = board_manager();
        manager.close();
        manager.close();

        assert_eq!(bus.releases(), 1);
        assert!(!bus.is_open());
        assert!(manager.devices().is_empty());
        assert!(manager.bus_ids().is_empty());
        assert!(matches!(
            manager.set_fan_speed(None, 10),
            Err(HalError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn drop_closes_buses() {
        let (manager, bus) = board_manager();
        drop(manager);
        assert_eq!(bus.releases(), 1);
    }
}
