use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::trace;

use super::{BusTransport, ChipAddress};
use crate::error::{HalError, HalResult};

const REGISTER_SPACE: usize = 256;

/// Transfers kept in the operation log; older entries are dropped.
pub const LOG_CAPACITY: usize = 4096;

/// One transfer observed by a [`SimulatedBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Select(ChipAddress),
    ReadByte(ChipAddress),
    WriteByte(ChipAddress, u8),
    ReadByteData(ChipAddress, u8),
    WriteByteData(ChipAddress, u8, u8),
    ReadBlock(ChipAddress, u8, usize),
    WriteBlock(ChipAddress, u8, Vec<u8>),
}

impl BusOp {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            BusOp::WriteByte(..) | BusOp::WriteByteData(..) | BusOp::WriteBlock(..)
        )
    }
}

#[derive(Debug)]
struct SimChip {
    registers: [u8; REGISTER_SPACE],
}

impl Default for SimChip {
    fn default() -> Self {
        Self {
            registers: [0; REGISTER_SPACE],
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    open: bool,
    releases: usize,
    selected: Option<ChipAddress>,
    chips: BTreeMap<ChipAddress, SimChip>,
    failing_writes: BTreeSet<ChipAddress>,
    failing_registers: BTreeSet<(ChipAddress, u8)>,
    log: VecDeque<BusOp>,
}

impl SimState {
    fn record(&mut self, op: BusOp) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(op);
    }

    fn rejects(&self, op: &BusOp) -> bool {
        match op {
            BusOp::WriteByte(address, _) => self.failing_writes.contains(address),
            BusOp::WriteByteData(address, register, _)
            | BusOp::WriteBlock(address, register, _) => {
                self.failing_writes.contains(address)
                    || self.failing_registers.contains(&(*address, *register))
            }
            _ => false,
        }
    }
}

/// In-memory bus with a 256-register model per attached chip.
///
/// Clones share state, so a test can keep a handle while the
/// [`DeviceManager`](crate::manager::DeviceManager) owns the bus. Absent
/// chips do not acknowledge: any transfer to them is a
/// [`HalError::TransportError`].
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SimState {
                open: true,
                ..SimState::default()
            })),
        }
    }

    /// Bus populated like the reference board: RGB LED PWM at 0x60, fan PWM
    /// at 0x64, tube display at 0x70 and keypad at 0x74.
    pub fn board(name: impl Into<String>) -> Self {
        [0x60, 0x64, 0x70, 0x74]
            .into_iter()
            .fold(Self::new(name), |bus, raw| {
                bus.with_chip(ChipAddress::fixed(raw))
            })
    }

    pub fn with_chip(self, address: ChipAddress) -> Self {
        self.lock().chips.entry(address).or_default();
        self
    }

    /// Chip acknowledges reads but every write to it fails.
    pub fn with_failing_writes(self, address: ChipAddress) -> Self {
        self.lock().failing_writes.insert(address);
        self
    }

    /// Writes addressed to `register` of the chip fail; everything else
    /// goes through.
    pub fn with_failing_register(self, address: ChipAddress, register: u8) -> Self {
        self.lock().failing_registers.insert((address, register));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_register(&self, address: ChipAddress, register: u8, value: u8) {
        if let Some(chip) = self.lock().chips.get_mut(&address) {
            chip.registers[register as usize] = value;
        }
    }

    pub fn register(&self, address: ChipAddress, register: u8) -> Option<u8> {
        self.lock()
            .chips
            .get(&address)
            .map(|chip| chip.registers[register as usize])
    }

    /// The last [`LOG_CAPACITY`] transfers since creation or the last
    /// [`clear_log`](Self::clear_log), oldest first.
    pub fn ops(&self) -> Vec<BusOp> {
        self.lock().log.iter().cloned().collect()
    }

    pub fn writes(&self) -> Vec<BusOp> {
        self.lock()
            .log
            .iter()
            .filter(|op| op.is_write())
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// How many times the handle was actually released.
    pub fn releases(&self) -> usize {
        self.lock().releases
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_target<T>(
        &self,
        write: bool,
        op: impl FnOnce(ChipAddress) -> BusOp,
        access: impl FnOnce(&mut SimChip) -> T,
    ) -> HalResult<T> {
        let mut state = self.lock();
        if !state.open {
            return Err(HalError::bus_unavailable(&self.name, "bus is closed"));
        }
        let address = state.selected.ok_or_else(|| {
            HalError::bus_unavailable(&self.name, "no target address selected")
        })?;

        let op = op(address);
        trace!("{}: {op:?}", self.name);
        let rejected = write && state.rejects(&op);
        state.record(op);

        if rejected {
            return Err(HalError::transport(Some(address), "write rejected"));
        }
        state
            .chips
            .get_mut(&address)
            .map(access)
            .ok_or_else(|| HalError::transport(Some(address), "no acknowledge"))
    }
}

impl BusTransport for SimulatedBus {
    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn address(&self) -> Option<ChipAddress> {
        self.lock().selected
    }

    fn set_address(&mut self, address: ChipAddress) -> HalResult<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(HalError::bus_unavailable(&self.name, "bus is closed"));
        }
        state.selected = Some(address);
        state.record(BusOp::Select(address));
        Ok(())
    }

    fn read_byte(&mut self) -> HalResult<u8> {
        self.with_target(false, BusOp::ReadByte, |chip| chip.registers[0])
    }

    fn write_byte(&mut self, value: u8) -> HalResult<()> {
        self.with_target(true, |a| BusOp::WriteByte(a, value), |_| ())
    }

    fn read_byte_data(&mut self, register: u8) -> HalResult<u8> {
        self.with_target(
            false,
            |a| BusOp::ReadByteData(a, register),
            |chip| chip.registers[register as usize],
        )
    }

    fn write_byte_data(&mut self, register: u8, value: u8) -> HalResult<()> {
        self.with_target(
            true,
            |a| BusOp::WriteByteData(a, register, value),
            |chip| chip.registers[register as usize] = value,
        )
    }

    fn read_block_data(&mut self, register: u8, len: usize) -> HalResult<Vec<u8>> {
        self.with_target(
            false,
            |a| BusOp::ReadBlock(a, register, len),
            |chip| {
                (0..len)
                    .map(|offset| chip.registers[(register as usize + offset) % REGISTER_SPACE])
                    .collect()
            },
        )
    }

    fn write_block_data(&mut self, register: u8, data: &[u8]) -> HalResult<()> {
        self.with_target(
            true,
            |a| BusOp::WriteBlock(a, register, data.to_vec()),
            |chip| {
                for (offset, value) in data.iter().enumerate() {
                    chip.registers[(register as usize + offset) % REGISTER_SPACE] = *value;
                }
            },
        )
    }

    fn close(&mut self) {
        let mut state = self.lock();
        if state.open {
            state.open = false;
            state.selected = None;
            state.releases += 1;
        }
    }
}
