use std::collections::BTreeMap;

use crate::servo::error::{BusError, Result};
use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::protocol_packet_handler::ProtocolPacketHandler;
use crate::servo::protocol::registers::{self, Register};

/// Last-known state of one servo on the bus.
///
/// Goal position and moving speed are seeded from the servo when the device
/// is discovered and afterwards only change through writes made here, so
/// they are never read back. Volatile registers are never cached.
#[derive(Debug, Clone)]
pub struct Device {
    address: u8,
    cache: BTreeMap<Register, u16>,
    synchronized: bool,
    dirty: bool,
}

impl Device {
    pub fn new(address: u8, goal_position: u16, moving_speed: u16) -> Self {
        let mut cache = BTreeMap::new();
        cache.insert(Register::GoalPosition, goal_position);
        cache.insert(Register::MovingSpeed, moving_speed);
        Self {
            address,
            cache,
            synchronized: true,
            dirty: false,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub(crate) fn set_address(&mut self, address: u8) {
        self.address = address;
        self.cache.insert(Register::Id, address as u16);
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// True while a goal/speed change is waiting for the next synchronize.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn cached(&self, register: Register) -> Option<u16> {
        self.cache.get(&register).copied()
    }

    pub fn goal_position(&self) -> u16 {
        self.cached(Register::GoalPosition).unwrap_or_default()
    }

    pub fn moving_speed(&self) -> u16 {
        self.cached(Register::MovingSpeed).unwrap_or_default()
    }

    pub(crate) fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Row for a goal-position/moving-speed sync write.
    pub(crate) fn motion_row(&self) -> Vec<u8> {
        let mut row = Register::GoalPosition.encode(self.goal_position());
        row.extend(Register::MovingSpeed.encode(self.moving_speed()));
        row
    }

    pub(crate) fn store(&mut self, register: Register, value: u16) {
        if !register.is_volatile() {
            self.cache.insert(register, value);
        }
    }
}

/// A device bound to the bus it lives on. Borrowed from the network, so it
/// cannot outlive a rescan.
pub struct ServoHandle<'a, P> {
    device: &'a mut Device,
    handler: &'a mut ProtocolPacketHandler<P>,
}

impl<'a, P: PortHandler> ServoHandle<'a, P> {
    pub(crate) fn new(device: &'a mut Device, handler: &'a mut ProtocolPacketHandler<P>) -> Self {
        Self { device, handler }
    }

    pub fn address(&self) -> u8 {
        self.device.address
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    pub fn is_dirty(&self) -> bool {
        self.device.dirty
    }

    pub fn is_synchronized(&self) -> bool {
        self.device.synchronized
    }

    /// Leaving synchronized mode sends any pending goal/speed straight away.
    pub fn set_synchronized(&mut self, synchronized: bool) -> Result<()> {
        if !synchronized && self.device.dirty {
            let row = self.device.motion_row();
            self.handler
                .write_registers(self.device.address, Register::GoalPosition.address(), &row, false)?;
            self.device.dirty = false;
        }
        self.device.synchronized = synchronized;
        Ok(())
    }

    pub fn read(&mut self, register: Register) -> Result<u16> {
        if !register.is_volatile() {
            if let Some(value) = self.device.cached(register) {
                return Ok(value);
            }
        }
        let value = self.fetch(register)?;
        self.device.store(register, value);
        Ok(value)
    }

    pub fn write(&mut self, register: Register, value: u16) -> Result<()> {
        check_writable(register)?;

        if register.is_synchronized() && self.device.synchronized {
            self.device.cache.insert(register, value);
            self.device.dirty = true;
            return Ok(());
        }

        if !register.is_volatile() && self.device.cached(register) == Some(value) {
            log::trace!("servo {}: {} already {}", self.device.address, register, value);
            return Ok(());
        }

        self.handler
            .write_registers(self.device.address, register.address(), &register.encode(value), false)?;
        self.device.store(register, value);
        Ok(())
    }

    /// RegWrite: the servo holds the value until `Network::flush_deferred`.
    pub fn write_deferred(&mut self, register: Register, value: u16) -> Result<()> {
        check_writable(register)?;
        self.handler
            .write_registers(self.device.address, register.address(), &register.encode(value), true)?;
        self.device.store(register, value);
        Ok(())
    }

    /// Read every register from `first` through `last` in one transaction.
    /// Values are what the servo holds; the cache is refreshed for cacheable
    /// registers other than goal position and moving speed.
    pub fn read_span(&mut self, first: Register, last: Register) -> Result<Vec<(Register, u16)>> {
        let len = registers::span_len(first, last);
        if first > last || len > u8::MAX as usize {
            return Err(BusError::RegisterSpan { first, last });
        }

        let bytes = self
            .handler
            .read_registers(self.device.address, first.address(), len as u8)?;

        let mut values = Vec::new();
        for (register, offset) in registers::span(first, last) {
            let end = offset + register.width() as usize;
            let Some(raw) = bytes.get(offset..end) else {
                continue;
            };
            let value = register.decode(raw);
            if !register.is_synchronized() {
                self.device.store(register, value);
            }
            values.push((register, value));
        }
        Ok(values)
    }

    fn fetch(&mut self, register: Register) -> Result<u16> {
        let bytes = self
            .handler
            .read_registers(self.device.address, register.address(), register.width())?;
        Ok(register.decode(&bytes))
    }

    pub fn model_number(&mut self) -> Result<u16> {
        self.read(Register::ModelNumber)
    }

    pub fn firmware_version(&mut self) -> Result<u8> {
        Ok(self.read(Register::FirmwareVersion)? as u8)
    }

    pub fn baud_rate(&mut self) -> Result<u8> {
        Ok(self.read(Register::BaudRate)? as u8)
    }

    pub fn return_delay_time(&mut self) -> Result<u8> {
        Ok(self.read(Register::ReturnDelayTime)? as u8)
    }

    pub fn set_return_delay_time(&mut self, value: u8) -> Result<()> {
        self.write(Register::ReturnDelayTime, value as u16)
    }

    pub fn cw_angle_limit(&mut self) -> Result<u16> {
        self.read(Register::CwAngleLimit)
    }

    pub fn set_cw_angle_limit(&mut self, value: u16) -> Result<()> {
        self.write(Register::CwAngleLimit, value)
    }

    pub fn ccw_angle_limit(&mut self) -> Result<u16> {
        self.read(Register::CcwAngleLimit)
    }

    pub fn set_ccw_angle_limit(&mut self, value: u16) -> Result<()> {
        self.write(Register::CcwAngleLimit, value)
    }

    pub fn max_torque(&mut self) -> Result<u16> {
        self.read(Register::MaxTorque)
    }

    pub fn set_max_torque(&mut self, value: u16) -> Result<()> {
        self.write(Register::MaxTorque, value)
    }

    pub fn status_return_level(&mut self) -> Result<u8> {
        Ok(self.read(Register::StatusReturnLevel)? as u8)
    }

    pub fn set_status_return_level(&mut self, value: u8) -> Result<()> {
        self.write(Register::StatusReturnLevel, value as u16)
    }

    pub fn torque_enable(&mut self) -> Result<bool> {
        Ok(self.read(Register::TorqueEnable)? != 0)
    }

    pub fn set_torque_enable(&mut self, enabled: bool) -> Result<()> {
        self.write(Register::TorqueEnable, u16::from(enabled))
    }

    pub fn led(&mut self) -> Result<bool> {
        Ok(self.read(Register::Led)? != 0)
    }

    pub fn set_led(&mut self, on: bool) -> Result<()> {
        self.write(Register::Led, u16::from(on))
    }

    pub fn cw_compliance_margin(&mut self) -> Result<u8> {
        Ok(self.read(Register::CwComplianceMargin)? as u8)
    }

    pub fn set_cw_compliance_margin(&mut self, value: u8) -> Result<()> {
        self.write(Register::CwComplianceMargin, value as u16)
    }

    pub fn ccw_compliance_margin(&mut self) -> Result<u8> {
        Ok(self.read(Register::CcwComplianceMargin)? as u8)
    }

    pub fn set_ccw_compliance_margin(&mut self, value: u8) -> Result<()> {
        self.write(Register::CcwComplianceMargin, value as u16)
    }

    pub fn cw_compliance_slope(&mut self) -> Result<u8> {
        Ok(self.read(Register::CwComplianceSlope)? as u8)
    }

    pub fn set_cw_compliance_slope(&mut self, value: u8) -> Result<()> {
        self.write(Register::CwComplianceSlope, value as u16)
    }

    pub fn ccw_compliance_slope(&mut self) -> Result<u8> {
        Ok(self.read(Register::CcwComplianceSlope)? as u8)
    }

    pub fn set_ccw_compliance_slope(&mut self, value: u8) -> Result<()> {
        self.write(Register::CcwComplianceSlope, value as u16)
    }

    pub fn goal_position(&self) -> u16 {
        self.device.goal_position()
    }

    pub fn set_goal_position(&mut self, value: u16) -> Result<()> {
        self.write(Register::GoalPosition, value)
    }

    pub fn moving_speed(&self) -> u16 {
        self.device.moving_speed()
    }

    pub fn set_moving_speed(&mut self, value: u16) -> Result<()> {
        self.write(Register::MovingSpeed, value)
    }

    pub fn torque_limit(&mut self) -> Result<u16> {
        self.read(Register::TorqueLimit)
    }

    pub fn set_torque_limit(&mut self, value: u16) -> Result<()> {
        self.write(Register::TorqueLimit, value)
    }

    pub fn present_position(&mut self) -> Result<u16> {
        self.read(Register::PresentPosition)
    }

    pub fn present_speed(&mut self) -> Result<u16> {
        self.read(Register::PresentSpeed)
    }

    pub fn present_load(&mut self) -> Result<u16> {
        self.read(Register::PresentLoad)
    }

    /// Tenths of a volt.
    pub fn present_voltage(&mut self) -> Result<u8> {
        Ok(self.read(Register::PresentVoltage)? as u8)
    }

    /// Degrees Celsius.
    pub fn present_temperature(&mut self) -> Result<u8> {
        Ok(self.read(Register::PresentTemperature)? as u8)
    }

    pub fn is_moving(&mut self) -> Result<bool> {
        Ok(self.read(Register::Moving)? != 0)
    }

    pub fn punch(&mut self) -> Result<u16> {
        self.read(Register::Punch)
    }

    pub fn set_punch(&mut self, value: u16) -> Result<()> {
        self.write(Register::Punch, value)
    }
}

pub(crate) fn check_writable(register: Register) -> Result<()> {
    if register.is_read_only() {
        return Err(BusError::ReadOnlyRegister(register));
    }
    if register == Register::Id {
        return Err(BusError::IdRegister);
    }
    Ok(())
}
