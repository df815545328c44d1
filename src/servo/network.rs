use std::collections::BTreeMap;
use std::time::Duration;

use crate::servo::device::{check_writable, Device, ServoHandle};
use crate::servo::error::{BusError, Result};
use crate::servo::protocol::group_sync_write::GroupSyncWrite;
use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::protocol_packet_handler::{Diagnostics, ProtocolPacketHandler};
use crate::servo::protocol::registers::{decode_value, Register};
use crate::servo::protocol::servo_def::{ErrorFlags, BROADCAST_ID, MAX_ID, RESET_ID};

// goal position and moving speed, written together by synchronize()
const MOTION_LEN: u8 = 4;

/// All servos discovered on one bus, keyed by address.
pub struct Network<P> {
    handler: ProtocolPacketHandler<P>,
    devices: BTreeMap<u8, Device>,
    stopped: bool,
}

impl<P: PortHandler> Network<P> {
    pub fn new(handler: ProtocolPacketHandler<P>) -> Self {
        Self {
            handler,
            devices: BTreeMap::new(),
            stopped: false,
        }
    }

    pub fn from_port(port: P) -> Self {
        Self::new(ProtocolPacketHandler::new(port))
    }

    pub fn handler(&self) -> &ProtocolPacketHandler<P> {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut ProtocolPacketHandler<P> {
        &mut self.handler
    }

    pub fn into_handler(self) -> ProtocolPacketHandler<P> {
        self.handler
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.handler.diagnostics()
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.handler.set_read_timeout(timeout)
    }

    pub fn set_error_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&mut ProtocolPacketHandler<P>, u8, ErrorFlags) + 'static,
    {
        self.handler.set_error_observer(observer);
    }

    /// Forget every known servo and ping `low..=high`. Each responder gets a
    /// fresh device whose goal position and moving speed are read back from
    /// the servo. A servo that answers the ping but not the read is left out.
    pub fn scan(&mut self, low: u8, high: u8) -> Result<Vec<u8>> {
        self.devices.clear();
        let found = self.handler.scan_addresses(low, high)?;

        for &address in &found {
            let motion = match self.handler.read_registers(
                address,
                Register::GoalPosition.address(),
                MOTION_LEN,
            ) {
                Ok(motion) => motion,
                Err(BusError::Timeout) => {
                    log::warn!("servo {address} answered ping but not the goal/speed read, skipping");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let goal = motion.get(0..2).map(decode_value).unwrap_or_default();
            let speed = motion.get(2..4).map(decode_value).unwrap_or_default();
            log::debug!("servo {address}: goal {goal}, speed {speed}");
            self.devices.insert(address, Device::new(address, goal, speed));
        }
        Ok(self.addresses())
    }

    pub fn addresses(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    pub fn device(&self, address: u8) -> Option<&Device> {
        self.devices.get(&address)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> + '_ {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn servo(&mut self, address: u8) -> Option<ServoHandle<'_, P>> {
        let device = self.devices.get_mut(&address)?;
        Some(ServoHandle::new(device, &mut self.handler))
    }

    /// Move the servo at `old` to `new`. The map is rekeyed first and rolled
    /// back if the servo does not acknowledge the write.
    pub fn set_address(&mut self, old: u8, new: u8) -> Result<()> {
        if new > MAX_ID {
            return Err(BusError::AddressOutOfRange(new));
        }
        if !self.devices.contains_key(&old) {
            return Err(BusError::UnknownDevice(old));
        }
        if old == new {
            return Ok(());
        }
        if self.devices.contains_key(&new) {
            return Err(BusError::AddressCollision(new));
        }

        let Some(mut device) = self.devices.remove(&old) else {
            return Err(BusError::UnknownDevice(old));
        };
        if let Err(err) = self
            .handler
            .write_registers(old, Register::Id.address(), &[new], false)
        {
            self.devices.insert(old, device);
            return Err(err);
        }

        device.set_address(new);
        self.devices.insert(new, device);
        log::info!("servo {old} is now at address {new}");
        Ok(())
    }

    /// Send pending goal/speed changes in one SyncWrite. Returns the number
    /// of servos included. While stopped, pending changes are dropped.
    pub fn synchronize(&mut self) -> Result<usize> {
        self.send_motion(false)
    }

    // dirty flags are cleared only after the SyncWrite is sent
    fn send_motion(&mut self, force: bool) -> Result<usize> {
        if self.stopped && !force {
            for device in self.devices.values_mut() {
                device.take_dirty();
            }
            return Ok(0);
        }

        let mut group = GroupSyncWrite::new(Register::GoalPosition.address(), MOTION_LEN);
        for device in self.devices.values().filter(|device| device.is_dirty()) {
            group.add_param(device.address(), &device.motion_row())?;
        }

        group.tx_packet(&mut self.handler)?;
        for address in group.ids() {
            if let Some(device) = self.devices.get_mut(&address) {
                device.take_dirty();
            }
        }
        Ok(group.len())
    }

    /// Stopping holds every servo at its present position. Goal changes made
    /// while stopped are discarded by `synchronize`. The stopped flag is left
    /// as it was if stopping fails.
    pub fn set_stopped(&mut self, stopped: bool) -> Result<()> {
        if stopped {
            for device in self.devices.values_mut() {
                let mut servo = ServoHandle::new(device, &mut self.handler);
                let position = servo.present_position()?;
                servo.set_goal_position(position)?;
                servo.set_moving_speed(1)?;
            }
            self.send_motion(true)?;
            log::info!("bus stopped");
        }
        self.stopped = stopped;
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Write `value` to `register` on every servo with one broadcast
    /// WriteData. No servo answers a broadcast.
    pub fn broadcast_register(&mut self, register: Register, value: u16) -> Result<()> {
        check_writable(register)?;
        self.handler
            .write_registers(BROADCAST_ID, register.address(), &register.encode(value), false)?;
        for device in self.devices.values_mut() {
            device.store(register, value);
        }
        Ok(())
    }

    /// Apply every RegWrite queued on the servos.
    pub fn flush_deferred(&mut self) -> Result<()> {
        self.handler.flush_deferred()
    }

    /// Restore factory settings. The servo drops off the map; after the
    /// reset it answers at address 1 and a rescan picks it up.
    pub fn reset_device(&mut self, address: u8) -> Result<()> {
        if !self.devices.contains_key(&address) {
            return Err(BusError::UnknownDevice(address));
        }
        self.handler.reset_to_defaults(address)?;
        self.devices.remove(&address);
        if address != RESET_ID && self.devices.contains_key(&RESET_ID) {
            log::warn!("servo {address} was reset onto address {RESET_ID}, which is already in use");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servo::protocol::port_handler::SimPort;
    use crate::servo::sim::ServoBusSim;

    #[test]
    fn scan_seeds_motion_registers() {
        let mut sim = ServoBusSim::with_servos([4, 9]);
        sim.set_register(9, Register::GoalPosition, 300);
        sim.set_register(9, Register::MovingSpeed, 77);
        let mut network = Network::from_port(SimPort::new(sim));

        assert_eq!(network.scan(0, 20).expect("scan"), vec![4, 9]);
        let device = network.device(9).expect("servo 9");
        assert_eq!(device.goal_position(), 300);
        assert_eq!(device.moving_speed(), 77);
        assert!(!device.is_dirty());
    }

    #[test]
    fn unknown_servo_has_no_handle() {
        let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos([1])));
        network.scan(0, 3).expect("scan");
        assert!(network.servo(2).is_none());
        assert!(matches!(network.set_address(2, 5), Err(BusError::UnknownDevice(2))));
    }

    #[test]
    fn address_above_range_is_rejected() {
        let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos([1])));
        network.scan(0, 3).expect("scan");
        assert!(matches!(
            network.set_address(1, BROADCAST_ID),
            Err(BusError::AddressOutOfRange(BROADCAST_ID))
        ));
        assert_eq!(network.addresses(), vec![1]);
    }

    #[test]
    fn renaming_to_same_address_sends_nothing() {
        let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos([1])));
        network.scan(0, 3).expect("scan");
        let sent = network.diagnostics().packets_sent;
        network.set_address(1, 1).expect("no-op");
        assert_eq!(network.diagnostics().packets_sent, sent);
    }

    #[test]
    fn scan_skips_servo_that_only_answers_pings() {
        let mut sim = ServoBusSim::with_servos([1, 2, 3]);
        sim.set_register(2, Register::StatusReturnLevel, 0);
        let mut network = Network::from_port(SimPort::new(sim));

        assert_eq!(network.scan(0, 5).expect("scan"), vec![1, 3]);
        assert!(network.device(2).is_none());
    }

    #[test]
    fn synchronize_without_dirty_servos_sends_nothing() {
        let mut network = Network::from_port(SimPort::new(ServoBusSim::with_servos([1, 2])));
        network.scan(0, 3).expect("scan");
        let sent = network.diagnostics().packets_sent;
        assert_eq!(network.synchronize().expect("sync"), 0);
        assert_eq!(network.diagnostics().packets_sent, sent);
    }
}
