//! Character map and digit buffer of the 4-digit tube.
//!
//! Each digit owns two consecutive display RAM registers; a segment mask
//! keeps the first register in its low byte and the second in its high
//! byte.

/// Number of digits on the tube.
pub const DIGITS: usize = 4;

/// Display RAM register of the leftmost digit's low byte.
pub const DISPLAY_RAM: u8 = 0x02;

pub const BLANK: u16 = 0x0000;

/// Segment mask for `ch`.
///
/// Covers `0-9`, `A-F` (either case), `-`, `_` and space; every other
/// character renders blank.
pub fn segments_for(ch: char) -> u16 {
    match ch.to_ascii_uppercase() {
        '0' => 0x01F8,
        '1' => 0x0030,
        '2' => 0x02D8,
        '3' => 0x0278,
        '4' => 0x0330,
        '5' => 0x0368,
        '6' => 0x03E8,
        '7' => 0x0038,
        '8' => 0x03F8,
        '9' => 0x0378,
        'A' => 0x03B8,
        'B' => 0x03E0,
        'C' => 0x01C8,
        'D' => 0x02F0,
        'E' => 0x03C8,
        'F' => 0x0388,
        '-' => 0x0200,
        _ => BLANK,
    }
}

/// Low-byte register of the digit `index` positions from the left.
pub fn digit_register(index: usize) -> u8 {
    DISPLAY_RAM + 2 * index as u8
}

/// Shadow copy of the tube contents, leftmost digit first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayBuffer([u16; DIGITS]);

impl DisplayBuffer {
    pub fn blank() -> Self {
        Self([BLANK; DIGITS])
    }

    /// Lays `text` out on the tube.
    ///
    /// Short text is padded with blanks on the left when `align_right`,
    /// on the right otherwise. Text longer than the tube keeps its last
    /// [`DIGITS`] characters when right-aligned and its first [`DIGITS`]
    /// when left-aligned; nothing wraps around.
    ///
    /// ```
    /// use i2c_boardd::drivers::ht16k33::segments::{DisplayBuffer, BLANK, segments_for};
    ///
    /// let buf = DisplayBuffer::from_text("12", true);
    /// assert_eq!(buf.slots(), &[BLANK, BLANK, segments_for('1'), segments_for('2')]);
    /// ```
    pub fn from_text(text: &str, align_right: bool) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let shown = match (chars.len() > DIGITS, align_right) {
            (true, true) => &chars[chars.len() - DIGITS..],
            (true, false) => &chars[..DIGITS],
            (false, _) => &chars[..],
        };
        let offset = if align_right { DIGITS - shown.len() } else { 0 };

        let mut buffer = Self::blank();
        for (index, &ch) in shown.iter().enumerate() {
            buffer.0[offset + index] = segments_for(ch);
        }
        buffer
    }

    pub fn slots(&self) -> &[u16; DIGITS] {
        &self.0
    }

    pub fn slot(&self, index: usize) -> Option<u16> {
        self.0.get(index).copied()
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|&mask| mask == BLANK)
    }

    pub(crate) fn set(&mut self, index: usize, mask: u16) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = mask;
        }
    }

    /// Display RAM image starting at [`DISPLAY_RAM`].
    pub fn to_ram(&self) -> [u8; DIGITS * 2] {
        let mut ram = [0u8; DIGITS * 2];
        for (bytes, mask) in ram.chunks_exact_mut(2).zip(self.0) {
            bytes.copy_from_slice(&mask.to_le_bytes());
        }
        ram
    }
}
