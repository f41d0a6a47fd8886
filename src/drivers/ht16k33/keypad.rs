//! Key-scan decoding for the 3x4 keypad matrix.

use std::fmt;

/// First key RAM register.
pub const KEY_RAM: u8 = 0x40;

/// Key RAM bytes read per scan.
pub const KEY_RAM_LEN: usize = 6;

/// Key RAM bytes holding the three wired rows.
const ROW_BYTES: [usize; 3] = [0, 2, 4];

/// Column bits within a row byte.
const COLUMNS: u8 = 4;

/// One of the twelve keypad keys, numbered 1-12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    K1,
    K2,
    K3,
    K4,
    K5,
    K6,
    K7,
    K8,
    K9,
    K10,
    K11,
    K12,
}

impl Key {
    pub const ALL: [Key; 12] = [
        Key::K1,
        Key::K2,
        Key::K3,
        Key::K4,
        Key::K5,
        Key::K6,
        Key::K7,
        Key::K8,
        Key::K9,
        Key::K10,
        Key::K11,
        Key::K12,
    ];

    pub fn number(self) -> u8 {
        self as u8 + 1
    }

    pub fn from_number(number: u8) -> Option<Self> {
        number
            .checked_sub(1)
            .and_then(|idx| Self::ALL.get(idx as usize).copied())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Decodes a key RAM snapshot.
///
/// Columns are scanned from bit 0 upwards and rows in wiring order, so with
/// several keys held the lowest-numbered column wins. Returns `None` when
/// nothing is pressed or the snapshot is too short.
pub fn decode(ram: &[u8]) -> Option<Key> {
    (0..COLUMNS)
        .flat_map(|column| {
            ROW_BYTES
                .iter()
                .enumerate()
                .map(move |(row, &byte)| (column, row as u8, byte))
        })
        .find(|&(column, _, byte)| {
            ram.get(byte)
                .is_some_and(|&bits| bits & (1u8 << column) != 0)
        })
        .and_then(|(column, row, _)| Key::from_number(column * 3 + row + 1))
}
