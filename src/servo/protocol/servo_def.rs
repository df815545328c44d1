use std::fmt;

pub const HEADER_BYTE: u8 = 0xFF;
pub const BROADCAST_ID: u8 = 0xFE;
pub const MAX_ID: u8 = 0xFD;
pub const RESET_ID: u8 = 1;

pub const INST_PING: u8 = 0x01;
pub const INST_READ: u8 = 0x02;
pub const INST_WRITE: u8 = 0x03;
pub const INST_REG_WRITE: u8 = 0x04;
pub const INST_ACTION: u8 = 0x05;
pub const INST_RESET: u8 = 0x06;
pub const INST_SYNC_WRITE: u8 = 0x83;

// length byte is u8 and counts the instruction and checksum bytes
pub const MAX_PARAM_LEN: usize = 0xFF - 2;

pub const PKT_HEADER0: usize = 0;
pub const PKT_HEADER1: usize = 1;
pub const PKT_ID: usize = 2;
pub const PKT_LENGTH: usize = 3;
pub const PKT_INSTRUCTION: usize = 4;
pub const PKT_PARAMETER0: usize = 5;

pub const ERRBIT_VOLTAGE: u8 = 1;
pub const ERRBIT_ANGLE: u8 = 2;
pub const ERRBIT_OVERHEAT: u8 = 4;
pub const ERRBIT_RANGE: u8 = 8;
pub const ERRBIT_CHECKSUM: u8 = 16;
pub const ERRBIT_OVERLOAD: u8 = 32;
pub const ERRBIT_INSTRUCTION: u8 = 64;

const ERROR_NAMES: [(u8, &str); 7] = [
    (ERRBIT_VOLTAGE, "input voltage"),
    (ERRBIT_ANGLE, "angle limit"),
    (ERRBIT_OVERHEAT, "overheating"),
    (ERRBIT_RANGE, "range"),
    (ERRBIT_CHECKSUM, "checksum"),
    (ERRBIT_OVERLOAD, "overload"),
    (ERRBIT_INSTRUCTION, "instruction"),
];

/// Error bits reported by a servo in the status packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    pub const NONE: ErrorFlags = ErrorFlags(0);
    pub const INPUT_VOLTAGE: ErrorFlags = ErrorFlags(ERRBIT_VOLTAGE);
    pub const ANGLE_LIMIT: ErrorFlags = ErrorFlags(ERRBIT_ANGLE);
    pub const OVERHEATING: ErrorFlags = ErrorFlags(ERRBIT_OVERHEAT);
    pub const RANGE: ErrorFlags = ErrorFlags(ERRBIT_RANGE);
    pub const CHECKSUM: ErrorFlags = ErrorFlags(ERRBIT_CHECKSUM);
    pub const OVERLOAD: ErrorFlags = ErrorFlags(ERRBIT_OVERLOAD);
    pub const INSTRUCTION: ErrorFlags = ErrorFlags(ERRBIT_INSTRUCTION);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: ErrorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        ERROR_NAMES
            .iter()
            .filter(move |(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
    }
}

impl std::ops::BitOr for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut names: Vec<&str> = self.names().collect();
        if self.0 & 0x80 != 0 {
            names.push("0x80");
        }
        f.write_str(&names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_flags_display_lists_set_bits() {
        let flags = ErrorFlags::OVERHEATING | ErrorFlags::OVERLOAD;
        assert_eq!(flags.to_string(), "overheating, overload");
        assert!(flags.contains(ErrorFlags::OVERLOAD));
        assert!(!flags.contains(ErrorFlags::RANGE));
        assert_eq!(ErrorFlags::NONE.to_string(), "none");
    }

    #[test]
    fn error_flags_display_keeps_undefined_bit() {
        assert_eq!(ErrorFlags::from_bits(0x80).to_string(), "0x80");
        assert_eq!(ErrorFlags::from_bits(0xA0).to_string(), "overload, 0x80");
    }
}
