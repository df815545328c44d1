use std::time::{Duration, Instant};

use crate::servo::error::{BusError, Result};
use crate::servo::protocol::packet::{checksum, encode_packet};
use crate::servo::protocol::port_handler::{format_packet_hex, PortHandler};
use crate::servo::protocol::servo_def::*;

/// A status packet as read off the wire. The checksum is carried but not
/// enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub address: u8,
    pub error: ErrorFlags,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

impl Presence {
    pub fn is_present(self) -> bool {
        self == Presence::Present
    }
}

/// Counters accumulated over the lifetime of one packet handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub framing_errors: u64,
    pub extra_header_bytes: u64,
    pub discarded_packets: u64,
    pub checksum_mismatches: u64,
    pub device_errors: u64,
    pub timeouts: u64,
    pub reads: u64,
    pub average_read_time: Duration,
    pub max_read_time: Duration,
}

pub type ErrorObserver<P> = Box<dyn FnMut(&mut ProtocolPacketHandler<P>, u8, ErrorFlags)>;

pub struct ProtocolPacketHandler<P> {
    port: P,
    diagnostics: Diagnostics,
    total_read_time: Duration,
    observer: Option<ErrorObserver<P>>,
    notifying: bool,
}

impl<P: PortHandler> ProtocolPacketHandler<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            diagnostics: Diagnostics::default(),
            total_read_time: Duration::ZERO,
            observer: None,
            notifying: false,
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        self.port.read_timeout()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn reset_diagnostics(&mut self) {
        self.diagnostics = Diagnostics::default();
        self.total_read_time = Duration::ZERO;
    }

    /// Install the callback invoked when a status packet carries error bits.
    /// The callback may use the handler; errors raised by its own traffic are
    /// logged but not delivered back to it.
    pub fn set_error_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&mut ProtocolPacketHandler<P>, u8, ErrorFlags) + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    pub fn clear_error_observer(&mut self) {
        self.observer = None;
    }

    pub fn write_instruction(&mut self, address: u8, instruction: u8, payload: &[u8]) -> Result<()> {
        let frame = encode_packet(address, instruction, payload)?;
        log::trace!("tx id={address} instr=0x{instruction:02X} bytes={}", format_packet_hex(&frame));
        self.port.write_port(&frame)?;
        self.diagnostics.packets_sent += 1;
        Ok(())
    }

    /// Read one status packet. Returns `Ok(None)` when the bytes on the wire
    /// do not frame a packet; the caller decides whether to try again.
    pub fn read_raw_packet(&mut self) -> Result<Option<RawPacket>> {
        let started = Instant::now();
        let result = self.read_frame();
        self.record_read_time(started.elapsed());

        if matches!(result, Err(BusError::Timeout)) {
            self.diagnostics.timeouts += 1;
        }
        let packet = result?;

        if let Some(packet) = &packet {
            if !packet.error.is_empty() {
                self.notify_device_error(packet.address, packet.error);
            }
        }
        Ok(packet)
    }

    fn read_frame(&mut self) -> Result<Option<RawPacket>> {
        for _ in 0..2 {
            let byte = self.port.read_byte()?;
            if byte != HEADER_BYTE {
                self.diagnostics.framing_errors += 1;
                log::debug!("framing error: expected header, got 0x{byte:02X}");
                return Ok(None);
            }
        }

        let mut address = self.port.read_byte()?;
        if address == HEADER_BYTE {
            // some adapters echo a third header byte
            self.diagnostics.extra_header_bytes += 1;
            address = self.port.read_byte()?;
        }

        let length = self.port.read_byte()?;
        let Some(payload_len) = (length as usize).checked_sub(2) else {
            self.diagnostics.framing_errors += 1;
            log::debug!("framing error: length byte {length} from id {address}");
            return Ok(None);
        };

        let error = self.port.read_byte()?;

        let mut payload = vec![0u8; payload_len];
        let mut filled = 0;
        while filled < payload_len {
            let read = self.port.read_port(&mut payload[filled..])?;
            if read == 0 {
                return Err(BusError::Timeout);
            }
            filled += read;
        }

        let received = self.port.read_byte()?;
        let mut summed = Vec::with_capacity(payload_len + 3);
        summed.extend_from_slice(&[address, length, error]);
        summed.extend_from_slice(&payload);
        if checksum(&summed) != received {
            self.diagnostics.checksum_mismatches += 1;
            log::debug!("checksum mismatch from id {address} (accepted)");
        }

        self.diagnostics.packets_received += 1;
        Ok(Some(RawPacket {
            address,
            error: ErrorFlags::from_bits(error),
            payload,
            checksum: received,
        }))
    }

    fn record_read_time(&mut self, elapsed: Duration) {
        self.diagnostics.reads += 1;
        self.total_read_time += elapsed;
        let average = self.total_read_time.as_nanos() / u128::from(self.diagnostics.reads);
        self.diagnostics.average_read_time = Duration::from_nanos(u64::try_from(average).unwrap_or(u64::MAX));
        if elapsed > self.diagnostics.max_read_time {
            self.diagnostics.max_read_time = elapsed;
        }
    }

    fn notify_device_error(&mut self, address: u8, flags: ErrorFlags) {
        self.diagnostics.device_errors += 1;
        log::warn!("servo {address} reported error: {flags}");

        if self.notifying {
            return;
        }
        let Some(mut observer) = self.observer.take() else {
            return;
        };
        self.notifying = true;
        observer(self, address, flags);
        self.notifying = false;
        if self.observer.is_none() {
            self.observer = Some(observer);
        }
    }

    /// Wait for the status packet from `address` carrying exactly
    /// `expected_len` bytes, discarding anything else. Only a read timeout
    /// ends the wait without a match.
    pub fn read_response(&mut self, address: u8, expected_len: usize) -> Result<Option<Vec<u8>>> {
        if address == BROADCAST_ID {
            return Ok(None);
        }

        loop {
            match self.read_raw_packet()? {
                Some(packet) if packet.address == address && packet.payload.len() == expected_len => {
                    return Ok(Some(packet.payload));
                }
                Some(packet) => {
                    self.diagnostics.discarded_packets += 1;
                    log::debug!(
                        "discarding status from id {} ({} bytes), waiting for id {} ({} bytes)",
                        packet.address,
                        packet.payload.len(),
                        address,
                        expected_len
                    );
                }
                None => {
                    self.diagnostics.discarded_packets += 1;
                }
            }
        }
    }

    pub fn ping(&mut self, address: u8) -> Result<Presence> {
        check_unicast(address)?;
        self.write_instruction(address, INST_PING, &[])?;
        match self.read_response(address, 0) {
            Ok(_) => Ok(Presence::Present),
            Err(BusError::Timeout) => Ok(Presence::Absent),
            Err(err) => Err(err),
        }
    }

    pub fn read_registers(&mut self, address: u8, start: u8, count: u8) -> Result<Vec<u8>> {
        check_unicast(address)?;
        self.write_instruction(address, INST_READ, &[start, count])?;
        let payload = self.read_response(address, count as usize)?;
        Ok(payload.unwrap_or_default())
    }

    /// WriteData when `deferred` is false (acknowledged), RegWrite otherwise
    /// (stored on the servo until `flush_deferred`).
    pub fn write_registers(&mut self, address: u8, start: u8, data: &[u8], deferred: bool) -> Result<()> {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(start);
        params.extend_from_slice(data);

        if deferred {
            return self.write_instruction(address, INST_REG_WRITE, &params);
        }
        self.write_instruction(address, INST_WRITE, &params)?;
        self.read_response(address, 0)?;
        Ok(())
    }

    pub fn flush_deferred(&mut self) -> Result<()> {
        self.write_instruction(BROADCAST_ID, INST_ACTION, &[])
    }

    /// Factory reset. The servo comes back at address 1.
    pub fn reset_to_defaults(&mut self, address: u8) -> Result<()> {
        self.write_instruction(address, INST_RESET, &[])
    }

    /// `rows` is, per servo, its address followed by its register bytes.
    pub fn sync_write(&mut self, start: u8, device_count: usize, rows: &[u8]) -> Result<()> {
        if device_count == 0 || rows.len() < device_count * 2 || rows.len() % device_count != 0 {
            return Err(BusError::SyncRowMismatch {
                rows: rows.len(),
                devices: device_count,
            });
        }
        let per_device = rows.len() / device_count - 1;
        if per_device > u8::MAX as usize {
            return Err(BusError::PacketTooLong(rows.len() + 2));
        }

        let mut params = Vec::with_capacity(2 + rows.len());
        params.push(start);
        params.push(per_device as u8);
        params.extend_from_slice(rows);
        self.write_instruction(BROADCAST_ID, INST_SYNC_WRITE, &params)
    }

    pub fn scan_addresses(&mut self, low: u8, high: u8) -> Result<Vec<u8>> {
        if high > MAX_ID {
            return Err(BusError::AddressOutOfRange(high));
        }
        if low > high {
            return Err(BusError::AddressOutOfRange(low));
        }

        let mut found = Vec::new();
        for address in low..=high {
            if self.ping(address)?.is_present() {
                log::debug!("servo answered at {address}");
                found.push(address);
            }
        }
        log::info!("scan {low}..={high}: {} servo(s) found {:?}", found.len(), found);
        Ok(found)
    }
}

fn check_unicast(address: u8) -> Result<()> {
    if address > MAX_ID {
        return Err(BusError::AddressOutOfRange(address));
    }
    Ok(())
}
