use std::collections::BTreeMap;

use crate::servo::protocol::packet::{decode_instruction, encode_status, Instruction, ProtocolError, Status};
use crate::servo::protocol::registers::Register;
use crate::servo::protocol::servo_def::{ErrorFlags, BROADCAST_ID, RESET_ID};

const REGISTER_COUNT: usize = 50;
const MODEL_NUMBER: u16 = 12;
const FIRMWARE_VERSION: u8 = 24;
const CENTER_POSITION: u16 = 512;

const REG_ID: usize = Register::Id as usize;
const REG_STATUS_RETURN_LEVEL: usize = Register::StatusReturnLevel as usize;
const REG_GOAL_POSITION: usize = Register::GoalPosition as usize;
const REG_MOVING_SPEED: usize = Register::MovingSpeed as usize;
const REG_PRESENT_POSITION: usize = Register::PresentPosition as usize;
const REG_PRESENT_SPEED: usize = Register::PresentSpeed as usize;
const REG_REGISTERED_INSTRUCTION: usize = Register::RegisteredInstruction as usize;
const REG_MOVING: usize = Register::Moving as usize;

/// One emulated servo: a register file plus a queued RegWrite.
#[derive(Debug, Clone)]
pub struct SimServo {
    registers: [u8; REGISTER_COUNT],
    pending_writes: Vec<(u8, Vec<u8>)>,
    forced_error: ErrorFlags,
}

impl SimServo {
    pub fn new(id: u8) -> Self {
        let mut servo = Self {
            registers: [0u8; REGISTER_COUNT],
            pending_writes: Vec::new(),
            forced_error: ErrorFlags::NONE,
        };
        servo.init_defaults(id);
        servo
    }

    fn init_defaults(&mut self, id: u8) {
        self.registers = [0u8; REGISTER_COUNT];
        self.pending_writes.clear();
        self.set(Register::ModelNumber, MODEL_NUMBER);
        self.set(Register::FirmwareVersion, FIRMWARE_VERSION as u16);
        self.set(Register::Id, id as u16);
        self.set(Register::BaudRate, 1); // 1 Mbps
        self.set(Register::ReturnDelayTime, 250);
        self.set(Register::CwAngleLimit, 0);
        self.set(Register::CcwAngleLimit, 1023);
        self.set(Register::HighestLimitTemperature, 70);
        self.set(Register::LowestLimitVoltage, 60);
        self.set(Register::HighestLimitVoltage, 140);
        self.set(Register::MaxTorque, 1023);
        self.set(Register::StatusReturnLevel, 2);
        self.set(Register::AlarmLed, 36);
        self.set(Register::AlarmShutdown, 36);
        self.set(Register::CwComplianceMargin, 1);
        self.set(Register::CcwComplianceMargin, 1);
        self.set(Register::CwComplianceSlope, 32);
        self.set(Register::CcwComplianceSlope, 32);
        self.set(Register::GoalPosition, CENTER_POSITION);
        self.set(Register::TorqueLimit, 1023);
        self.set(Register::PresentPosition, CENTER_POSITION);
        self.set(Register::PresentVoltage, 120); // 12.0 V
        self.set(Register::PresentTemperature, 30);
        self.set(Register::Punch, 32);
    }

    pub fn get(&self, register: Register) -> u16 {
        let start = register.address() as usize;
        let end = start + register.width() as usize;
        crate::servo::protocol::registers::decode_value(&self.registers[start..end])
    }

    pub fn set(&mut self, register: Register, value: u16) {
        let start = register.address() as usize;
        let bytes = register.encode(value);
        self.registers[start..start + bytes.len()].copy_from_slice(&bytes);
    }

    fn id(&self) -> u8 {
        self.registers[REG_ID]
    }

    fn status_return_level(&self) -> u8 {
        self.registers[REG_STATUS_RETURN_LEVEL]
    }

    fn read(&self, address: u8, length: u8) -> Option<Vec<u8>> {
        let start = address as usize;
        let end = start + length as usize;
        if end > self.registers.len() {
            return None;
        }
        Some(self.registers[start..end].to_vec())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> bool {
        let start = address as usize;
        let end = start + data.len();
        if end > self.registers.len() {
            return false;
        }
        self.registers[start..end].copy_from_slice(data);
        true
    }

    fn queue_write(&mut self, address: u8, data: &[u8]) {
        self.pending_writes.push((address, data.to_vec()));
        self.registers[REG_REGISTERED_INSTRUCTION] = 1;
    }

    fn apply_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending_writes);
        for (address, data) in pending {
            let _ = self.write(address, &data);
        }
        self.registers[REG_REGISTERED_INSTRUCTION] = 0;
    }

    fn step(&mut self) {
        let goal = read_u16_le(&self.registers, REG_GOAL_POSITION) as i32;
        let present = read_u16_le(&self.registers, REG_PRESENT_POSITION) as i32;
        let speed = read_u16_le(&self.registers, REG_MOVING_SPEED) as i32;
        // 0 means "as fast as possible"
        let max_step = if speed == 0 { i32::MAX } else { speed.max(1) };

        let delta = (goal - present).clamp(-max_step, max_step);
        let next = (present + delta).clamp(0, 1023);
        write_u16_le(&mut self.registers, REG_PRESENT_POSITION, next as u16);
        write_u16_le(&mut self.registers, REG_PRESENT_SPEED, delta.unsigned_abs().min(1023) as u16);
        self.registers[REG_MOVING] = u8::from(next != goal);
    }

    fn status(&self, id: u8, error: ErrorFlags, params: Vec<u8>) -> Status {
        Status {
            id,
            error: error | self.forced_error,
            params,
        }
    }
}

/// A set of emulated servos sharing one bus.
#[derive(Debug, Default)]
pub struct ServoBusSim {
    servos: BTreeMap<u8, SimServo>,
}

impl ServoBusSim {
    pub fn new() -> Self {
        Self {
            servos: BTreeMap::new(),
        }
    }

    pub fn with_servos(ids: impl IntoIterator<Item = u8>) -> Self {
        let mut sim = Self::new();
        for id in ids {
            sim.add_servo(id);
        }
        sim
    }

    pub fn add_servo(&mut self, id: u8) {
        self.servos.entry(id).or_insert_with(|| SimServo::new(id));
    }

    pub fn remove_servo(&mut self, id: u8) -> bool {
        self.servos.remove(&id).is_some()
    }

    pub fn ids(&self) -> Vec<u8> {
        self.servos.keys().copied().collect()
    }

    pub fn servo(&self, id: u8) -> Option<&SimServo> {
        self.servos.get(&id)
    }

    pub fn servo_mut(&mut self, id: u8) -> Option<&mut SimServo> {
        self.servos.get_mut(&id)
    }

    pub fn register(&self, id: u8, register: Register) -> Option<u16> {
        self.servos.get(&id).map(|servo| servo.get(register))
    }

    pub fn set_register(&mut self, id: u8, register: Register, value: u16) -> bool {
        let Some(servo) = self.servos.get_mut(&id) else {
            return false;
        };
        servo.set(register, value);
        true
    }

    /// Make every status packet from `id` carry `flags`.
    pub fn set_error(&mut self, id: u8, flags: ErrorFlags) -> bool {
        let Some(servo) = self.servos.get_mut(&id) else {
            return false;
        };
        servo.forced_error = flags;
        true
    }

    /// Advance every servo one tick toward its goal position.
    pub fn step(&mut self) {
        for servo in self.servos.values_mut() {
            servo.step();
        }
    }

    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let decoded = decode_instruction(frame)?;
        let broadcast = decoded.id == BROADCAST_ID;

        match &decoded.instruction {
            Instruction::SyncWrite {
                address,
                length,
                writes,
            } => {
                if !broadcast {
                    return Ok(None);
                }
                for (id, data) in writes {
                    if data.len() != *length as usize {
                        continue;
                    }
                    if let Some(servo) = self.servos.get_mut(id) {
                        let _ = servo.write(*address, data);
                    }
                }
                self.rekey();
                return Ok(None);
            }
            Instruction::Reset => {
                // the servo reboots with factory settings and does not answer
                let targets: Vec<u8> = if broadcast {
                    self.ids()
                } else {
                    vec![decoded.id]
                };
                for id in targets {
                    if let Some(mut servo) = self.servos.remove(&id) {
                        servo.init_defaults(RESET_ID);
                        self.servos.insert(RESET_ID, servo);
                    }
                }
                return Ok(None);
            }
            _ => {}
        }

        if broadcast {
            for servo in self.servos.values_mut() {
                let id = servo.id();
                Self::apply_instruction(id, servo, &decoded.instruction);
            }
            self.rekey();
            return Ok(None);
        }

        let Some(servo) = self.servos.get_mut(&decoded.id) else {
            return Ok(None);
        };
        let level = servo.status_return_level();
        let response = Self::apply_instruction(decoded.id, servo, &decoded.instruction);
        self.rekey();

        let replies = match decoded.instruction {
            Instruction::Ping => true,
            Instruction::Read { .. } => level >= 1,
            // the host never waits for a RegWrite acknowledgement
            Instruction::RegWrite { .. } => false,
            _ => level >= 2,
        };
        if !replies {
            return Ok(None);
        }
        Ok(response.and_then(|status| encode_status(&status).ok()))
    }

    fn apply_instruction(id: u8, servo: &mut SimServo, instruction: &Instruction) -> Option<Status> {
        match instruction {
            Instruction::Ping => Some(servo.status(id, ErrorFlags::NONE, Vec::new())),
            Instruction::Read { address, length } => Some(match servo.read(*address, *length) {
                Some(params) => servo.status(id, ErrorFlags::NONE, params),
                None => servo.status(id, ErrorFlags::RANGE, Vec::new()),
            }),
            Instruction::Write { address, data } => {
                let error = if servo.write(*address, data) {
                    ErrorFlags::NONE
                } else {
                    ErrorFlags::RANGE
                };
                Some(servo.status(id, error, Vec::new()))
            }
            Instruction::RegWrite { address, data } => {
                servo.queue_write(*address, data);
                Some(servo.status(id, ErrorFlags::NONE, Vec::new()))
            }
            Instruction::Action => {
                servo.apply_pending();
                Some(servo.status(id, ErrorFlags::NONE, Vec::new()))
            }
            Instruction::Reset | Instruction::SyncWrite { .. } => None,
        }
    }

    // A write to the ID register moves the servo to its new address.
    fn rekey(&mut self) {
        let moved: Vec<u8> = self
            .servos
            .iter()
            .filter(|(key, servo)| **key != servo.id())
            .map(|(key, _)| *key)
            .collect();
        for key in moved {
            if let Some(servo) = self.servos.remove(&key) {
                self.servos.insert(servo.id(), servo);
            }
        }
    }
}

fn read_u16_le(registers: &[u8; REGISTER_COUNT], address: usize) -> u16 {
    let lo = registers[address] as u16;
    let hi = registers[address + 1] as u16;
    lo | (hi << 8)
}

fn write_u16_le(registers: &mut [u8; REGISTER_COUNT], address: usize, value: u16) {
    registers[address] = (value & 0xFF) as u8;
    registers[address + 1] = (value >> 8) as u8;
}
