use thiserror::Error;

use crate::servo::error::{BusError, Result};
use crate::servo::protocol::servo_def::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Ping,
    Read { address: u8, length: u8 },
    Write { address: u8, data: Vec<u8> },
    RegWrite { address: u8, data: Vec<u8> },
    Action,
    Reset,
    SyncWrite { address: u8, length: u8, writes: Vec<(u8, Vec<u8>)> },
}

impl Instruction {
    pub fn code(&self) -> u8 {
        match self {
            Instruction::Ping => INST_PING,
            Instruction::Read { .. } => INST_READ,
            Instruction::Write { .. } => INST_WRITE,
            Instruction::RegWrite { .. } => INST_REG_WRITE,
            Instruction::Action => INST_ACTION,
            Instruction::Reset => INST_RESET,
            Instruction::SyncWrite { .. } => INST_SYNC_WRITE,
        }
    }

    pub fn params(&self) -> Vec<u8> {
        match self {
            Instruction::Ping | Instruction::Action | Instruction::Reset => Vec::new(),
            Instruction::Read { address, length } => vec![*address, *length],
            Instruction::Write { address, data } | Instruction::RegWrite { address, data } => {
                let mut params = Vec::with_capacity(1 + data.len());
                params.push(*address);
                params.extend_from_slice(data);
                params
            }
            Instruction::SyncWrite {
                address,
                length,
                writes,
            } => {
                let mut params = vec![*address, *length];
                for (id, data) in writes {
                    params.push(*id);
                    params.extend_from_slice(data);
                }
                params
            }
        }
    }
}

/// Status packet as sent by a servo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: u8,
    pub error: ErrorFlags,
    pub params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub id: u8,
    pub instruction: Instruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad header")]
    BadHeader,
    #[error("packet too short")]
    TooShort,
    #[error("length byte does not match packet size")]
    LengthMismatch,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("malformed parameters")]
    Malformed,
    #[error("unsupported instruction")]
    UnsupportedInstruction,
}

/// Complement of the low byte of the sum of every byte from the id through
/// the last parameter.
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

pub fn encode_packet(id: u8, instruction_or_error: u8, params: &[u8]) -> Result<Vec<u8>> {
    if params.len() > MAX_PARAM_LEN {
        return Err(BusError::PacketTooLong(params.len()));
    }
    let length = (params.len() + 2) as u8;

    let mut frame = Vec::with_capacity(6 + params.len());
    frame.push(HEADER_BYTE);
    frame.push(HEADER_BYTE);
    frame.push(id);
    frame.push(length);
    frame.push(instruction_or_error);
    frame.extend_from_slice(params);
    frame.push(checksum(&frame[PKT_ID..]));
    Ok(frame)
}

pub fn encode_instruction(id: u8, instruction: &Instruction) -> Result<Vec<u8>> {
    encode_packet(id, instruction.code(), &instruction.params())
}

pub fn encode_status(status: &Status) -> Result<Vec<u8>> {
    encode_packet(status.id, status.error.bits(), &status.params)
}

pub fn decode_instruction(bytes: &[u8]) -> std::result::Result<Decoded, ProtocolError> {
    let (id, instruction, params) = parse_packet(bytes)?;

    let instruction = match instruction {
        INST_PING => Instruction::Ping,
        INST_READ => {
            let [address, length] = params else {
                return Err(ProtocolError::Malformed);
            };
            Instruction::Read {
                address: *address,
                length: *length,
            }
        }
        INST_WRITE | INST_REG_WRITE => {
            let Some((address, data)) = params.split_first() else {
                return Err(ProtocolError::Malformed);
            };
            if instruction == INST_WRITE {
                Instruction::Write {
                    address: *address,
                    data: data.to_vec(),
                }
            } else {
                Instruction::RegWrite {
                    address: *address,
                    data: data.to_vec(),
                }
            }
        }
        INST_ACTION => Instruction::Action,
        INST_RESET => Instruction::Reset,
        INST_SYNC_WRITE => {
            if params.len() < 2 {
                return Err(ProtocolError::Malformed);
            }
            let address = params[0];
            let length = params[1];
            let chunk_len = length as usize + 1;
            let tail = &params[2..];
            if tail.len() % chunk_len != 0 {
                return Err(ProtocolError::Malformed);
            }
            let writes = tail
                .chunks(chunk_len)
                .map(|chunk| (chunk[0], chunk[1..].to_vec()))
                .collect();
            Instruction::SyncWrite {
                address,
                length,
                writes,
            }
        }
        _ => return Err(ProtocolError::UnsupportedInstruction),
    };

    Ok(Decoded { id, instruction })
}

/// Strict status decoder; the bus reader in the packet handler is lenient and
/// does not go through here.
pub fn decode_status(bytes: &[u8]) -> std::result::Result<Status, ProtocolError> {
    let (id, error, params) = parse_packet(bytes)?;
    Ok(Status {
        id,
        error: ErrorFlags::from_bits(error),
        params: params.to_vec(),
    })
}

fn parse_packet(bytes: &[u8]) -> std::result::Result<(u8, u8, &[u8]), ProtocolError> {
    if bytes.len() < 6 {
        return Err(ProtocolError::TooShort);
    }
    if bytes[PKT_HEADER0] != HEADER_BYTE || bytes[PKT_HEADER1] != HEADER_BYTE {
        return Err(ProtocolError::BadHeader);
    }

    let length = bytes[PKT_LENGTH] as usize;
    if length < 2 || bytes.len() != length + 4 {
        return Err(ProtocolError::LengthMismatch);
    }

    let last = bytes.len() - 1;
    if checksum(&bytes[PKT_ID..last]) != bytes[last] {
        return Err(ProtocolError::ChecksumMismatch);
    }

    Ok((bytes[PKT_ID], bytes[PKT_INSTRUCTION], &bytes[PKT_PARAMETER0..last]))
}
