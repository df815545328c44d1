use std::io;

use thiserror::Error;

use crate::servo::protocol::registers::Register;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("timed out waiting for status packet")]
    Timeout,

    #[error("transport error: {0}")]
    Io(io::Error),

    #[error("register {0} is read-only")]
    ReadOnlyRegister(Register),

    #[error("sync write rows ({rows} bytes) are not a multiple of the device count ({devices})")]
    SyncRowMismatch { rows: usize, devices: usize },

    #[error("address {0} is outside the valid range 0..=253")]
    AddressOutOfRange(u8),

    #[error("address {0} is already taken by another servo")]
    AddressCollision(u8),

    #[error("no servo known at address {0}")]
    UnknownDevice(u8),

    #[error("instruction parameters too long ({0} bytes)")]
    PacketTooLong(usize),

    #[error("the ID register is changed through Network::set_address")]
    IdRegister,

    #[error("invalid register span {first}..={last}")]
    RegisterSpan { first: Register, last: Register },
}

impl From<io::Error> for BusError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => BusError::Timeout,
            _ => BusError::Io(err),
        }
    }
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout)
    }
}
