// AX-series control table. Offsets are byte addresses in the servo's
// register space; two-byte registers are little-endian.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Register {
    ModelNumber = 0,
    FirmwareVersion = 2,
    Id = 3,
    BaudRate = 4,
    ReturnDelayTime = 5,
    CwAngleLimit = 6,
    CcwAngleLimit = 8,
    HighestLimitTemperature = 11,
    LowestLimitVoltage = 12,
    HighestLimitVoltage = 13,
    MaxTorque = 14,
    StatusReturnLevel = 16,
    AlarmLed = 17,
    AlarmShutdown = 18,
    DownCalibration = 20,
    UpCalibration = 22,
    TorqueEnable = 24,
    Led = 25,
    CwComplianceMargin = 26,
    CcwComplianceMargin = 27,
    CwComplianceSlope = 28,
    CcwComplianceSlope = 29,
    GoalPosition = 30,
    MovingSpeed = 32,
    TorqueLimit = 34,
    PresentPosition = 36,
    PresentSpeed = 38,
    PresentLoad = 40,
    PresentVoltage = 42,
    PresentTemperature = 43,
    RegisteredInstruction = 44,
    Moving = 46,
    Lock = 47,
    Punch = 48,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterInfo {
    pub register: Register,
    pub name: &'static str,
    pub width: u8,
    pub access: Access,
    pub volatile: bool,
}

const fn entry(
    register: Register,
    name: &'static str,
    width: u8,
    access: Access,
    volatile: bool,
) -> RegisterInfo {
    RegisterInfo {
        register,
        name,
        width,
        access,
        volatile,
    }
}

use self::Access::{ReadOnly, ReadWrite};

/// Every register in ascending address order.
pub const REGISTERS: &[RegisterInfo] = &[
    entry(Register::ModelNumber, "Model Number", 2, ReadOnly, false),
    entry(Register::FirmwareVersion, "Firmware Version", 1, ReadOnly, false),
    entry(Register::Id, "ID", 1, ReadWrite, false),
    entry(Register::BaudRate, "Baud Rate", 1, ReadWrite, false),
    entry(Register::ReturnDelayTime, "Return Delay Time", 1, ReadWrite, false),
    entry(Register::CwAngleLimit, "CW Angle Limit", 2, ReadWrite, false),
    entry(Register::CcwAngleLimit, "CCW Angle Limit", 2, ReadWrite, false),
    entry(Register::HighestLimitTemperature, "Highest Limit Temperature", 1, ReadWrite, false),
    entry(Register::LowestLimitVoltage, "Lowest Limit Voltage", 1, ReadWrite, false),
    entry(Register::HighestLimitVoltage, "Highest Limit Voltage", 1, ReadWrite, false),
    entry(Register::MaxTorque, "Max Torque", 2, ReadWrite, false),
    entry(Register::StatusReturnLevel, "Status Return Level", 1, ReadWrite, false),
    entry(Register::AlarmLed, "Alarm LED", 1, ReadWrite, false),
    entry(Register::AlarmShutdown, "Alarm Shutdown", 1, ReadWrite, false),
    entry(Register::DownCalibration, "Down Calibration", 2, ReadOnly, false),
    entry(Register::UpCalibration, "Up Calibration", 2, ReadOnly, false),
    // the servo drops torque on its own after an alarm shutdown
    entry(Register::TorqueEnable, "Torque Enable", 1, ReadWrite, true),
    entry(Register::Led, "LED", 1, ReadWrite, false),
    entry(Register::CwComplianceMargin, "CW Compliance Margin", 1, ReadWrite, false),
    entry(Register::CcwComplianceMargin, "CCW Compliance Margin", 1, ReadWrite, false),
    entry(Register::CwComplianceSlope, "CW Compliance Slope", 1, ReadWrite, false),
    entry(Register::CcwComplianceSlope, "CCW Compliance Slope", 1, ReadWrite, false),
    entry(Register::GoalPosition, "Goal Position", 2, ReadWrite, false),
    entry(Register::MovingSpeed, "Moving Speed", 2, ReadWrite, false),
    entry(Register::TorqueLimit, "Torque Limit", 2, ReadWrite, true),
    entry(Register::PresentPosition, "Present Position", 2, ReadOnly, true),
    entry(Register::PresentSpeed, "Present Speed", 2, ReadOnly, true),
    entry(Register::PresentLoad, "Present Load", 2, ReadOnly, true),
    entry(Register::PresentVoltage, "Present Voltage", 1, ReadOnly, true),
    entry(Register::PresentTemperature, "Present Temperature", 1, ReadOnly, true),
    entry(Register::RegisteredInstruction, "Registered Instruction", 1, ReadWrite, true),
    entry(Register::Moving, "Moving", 1, ReadOnly, true),
    entry(Register::Lock, "Lock", 1, ReadWrite, false),
    entry(Register::Punch, "Punch", 2, ReadWrite, false),
];

impl Register {
    pub fn info(self) -> &'static RegisterInfo {
        // REGISTERS is sorted by address and holds every variant
        let index = REGISTERS
            .binary_search_by_key(&self.address(), |info| info.register.address())
            .unwrap_or_else(|_| unreachable!("register {:?} missing from table", self));
        &REGISTERS[index]
    }

    pub fn from_address(address: u8) -> Option<Register> {
        REGISTERS
            .binary_search_by_key(&address, |info| info.register.address())
            .ok()
            .map(|index| REGISTERS[index].register)
    }

    pub fn from_name(name: &str) -> Option<Register> {
        let wanted = normalize(name);
        REGISTERS
            .iter()
            .find(|info| normalize(info.name) == wanted)
            .map(|info| info.register)
    }

    pub const fn address(self) -> u8 {
        self as u8
    }

    pub fn width(self) -> u8 {
        self.info().width
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn is_read_only(self) -> bool {
        self.info().access == Access::ReadOnly
    }

    pub fn is_volatile(self) -> bool {
        self.info().volatile
    }

    /// Registers whose cached value is the only source of truth once seeded.
    pub fn is_synchronized(self) -> bool {
        matches!(self, Register::GoalPosition | Register::MovingSpeed)
    }

    pub fn encode(self, value: u16) -> Vec<u8> {
        match self.width() {
            1 => vec![value as u8],
            _ => value.to_le_bytes().to_vec(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> u16 {
        decode_value(bytes)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 1 byte: raw value; 2 bytes: little-endian.
pub fn decode_value(bytes: &[u8]) -> u16 {
    match bytes {
        [lo] => *lo as u16,
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        [] => 0,
    }
}

/// Registers covered by a contiguous read from `first` through `last`, with
/// each register's byte offset from `first`.
pub fn span(first: Register, last: Register) -> Vec<(Register, usize)> {
    let start = first.address() as usize;
    REGISTERS
        .iter()
        .filter(|info| info.register >= first && info.register <= last)
        .map(|info| (info.register, info.register.address() as usize - start))
        .collect()
}

/// Byte length of the contiguous block `first..=last`, including unused gaps.
pub fn span_len(first: Register, last: Register) -> usize {
    (last.address() as usize + last.width() as usize).saturating_sub(first.address() as usize)
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_and_non_overlapping() {
        for pair in REGISTERS.windows(2) {
            let end = pair[0].register.address() + pair[0].width;
            assert!(end <= pair[1].register.address(), "{:?} overlaps {:?}", pair[0].register, pair[1].register);
        }
    }

    #[test]
    fn lookup_by_address_and_name() {
        assert_eq!(Register::from_address(30), Some(Register::GoalPosition));
        assert_eq!(Register::from_address(31), None);
        assert_eq!(Register::from_name("goal-position"), Some(Register::GoalPosition));
        assert_eq!(Register::from_name("PresentTemperature"), Some(Register::PresentTemperature));
        assert_eq!(Register::PresentLoad.info().width, 2);
        assert!(Register::PresentPosition.is_read_only());
        assert!(Register::PresentPosition.is_volatile());
        assert!(!Register::Led.is_volatile());
    }

    #[test]
    fn little_endian_decoding() {
        assert_eq!(decode_value(&[0x14, 0x00]), 20);
        assert_eq!(decode_value(&[0x00, 0x02]), 512);
        assert_eq!(decode_value(&[7]), 7);
        assert_eq!(Register::GoalPosition.encode(0x0201), vec![0x01, 0x02]);
        assert_eq!(Register::Led.encode(1), vec![1]);
    }

    #[test]
    fn span_offsets_follow_addresses() {
        let regs = span(Register::GoalPosition, Register::PresentPosition);
        assert_eq!(
            regs,
            vec![
                (Register::GoalPosition, 0),
                (Register::MovingSpeed, 2),
                (Register::TorqueLimit, 4),
                (Register::PresentPosition, 6),
            ]
        );
        assert_eq!(span_len(Register::GoalPosition, Register::PresentPosition), 8);
        assert_eq!(span_len(Register::ModelNumber, Register::Punch), 50);
    }
}
