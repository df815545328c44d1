use std::collections::BTreeMap;

use crate::servo::error::{BusError, Result};
use crate::servo::protocol::port_handler::PortHandler;
use crate::servo::protocol::protocol_packet_handler::ProtocolPacketHandler;
use crate::servo::protocol::servo_def::MAX_ID;

/// Collects one fixed-width row per servo and sends them as a single
/// SyncWrite. Rows go out in ascending address order.
#[derive(Debug)]
pub struct GroupSyncWrite {
    start_address: u8,
    data_length: u8,
    rows: BTreeMap<u8, Vec<u8>>,
}

impl GroupSyncWrite {
    pub fn new(start_address: u8, data_length: u8) -> Self {
        Self {
            start_address,
            data_length,
            rows: BTreeMap::new(),
        }
    }

    /// Returns false if `id` already has a row.
    pub fn add_param(&mut self, id: u8, data: &[u8]) -> Result<bool> {
        self.check_row(id, data)?;
        if self.rows.contains_key(&id) {
            return Ok(false);
        }
        self.rows.insert(id, data.to_vec());
        Ok(true)
    }

    /// Returns false if `id` has no row yet.
    pub fn change_param(&mut self, id: u8, data: &[u8]) -> Result<bool> {
        self.check_row(id, data)?;
        match self.rows.get_mut(&id) {
            Some(row) => {
                *row = data.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn check_row(&self, id: u8, data: &[u8]) -> Result<()> {
        if id > MAX_ID {
            return Err(BusError::AddressOutOfRange(id));
        }
        if data.len() != self.data_length as usize {
            return Err(BusError::SyncRowMismatch {
                rows: data.len() + 1,
                devices: 1,
            });
        }
        Ok(())
    }

    pub fn make_param(&self) -> Vec<u8> {
        let mut param = Vec::with_capacity(self.rows.len() * (1 + self.data_length as usize));
        for (id, data) in &self.rows {
            param.push(*id);
            param.extend_from_slice(data);
        }
        param
    }

    /// Send the collected rows. Does nothing when no row was added.
    pub fn tx_packet<P: PortHandler>(&self, handler: &mut ProtocolPacketHandler<P>) -> Result<bool> {
        if self.rows.is_empty() {
            return Ok(false);
        }
        handler.sync_write(self.start_address, self.rows.len(), &self.make_param())?;
        Ok(true)
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.rows.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn data_length(&self) -> u8 {
        self.data_length
    }

    pub fn start_address(&self) -> u8 {
        self.start_address
    }
}
