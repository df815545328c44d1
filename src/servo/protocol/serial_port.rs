use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::servo::protocol::port_handler::PortHandler;

pub struct SerialPortHandler {
    port: Box<dyn SerialPort>,
    baudrate: u32,
    timeout: Duration,
}

impl SerialPortHandler {
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> serialport::Result<Self> {
        let port = serialport::new(port_name, baudrate).timeout(timeout).open()?;
        log::info!("opened {port_name} @ {baudrate} baud, read timeout {timeout:?}");
        Ok(Self::from_port(port, baudrate))
    }

    pub fn from_port(port: Box<dyn SerialPort>, baudrate: u32) -> Self {
        let timeout = port.timeout();
        Self {
            port,
            baudrate,
            timeout,
        }
    }

    pub fn set_baud_rate(&mut self, baudrate: u32) -> serialport::Result<()> {
        self.port.set_baud_rate(baudrate)?;
        self.baudrate = baudrate;
        Ok(())
    }

    pub fn baud_rate(&self) -> u32 {
        self.baudrate
    }

    /// Drop anything already sitting in the receive buffer.
    pub fn clear_port(&mut self) -> serialport::Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)
    }
}

impl PortHandler for SerialPortHandler {
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.port.read(buf)
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Rank detected ports so USB serial adapters (the usual half-duplex bus
/// bridges) are tried first.
pub fn score_port(info: &SerialPortInfo) -> i32 {
    let name = info.port_name.to_ascii_lowercase();
    let mut score = match info.port_type {
        SerialPortType::UsbPort(_) => 40,
        SerialPortType::PciPort => 20,
        SerialPortType::Unknown => 10,
        SerialPortType::BluetoothPort => -30,
    };

    if name.contains("ttyusb") || name.contains("ttyacm") || name.contains("cu.usb") {
        score += 30;
    }
    if name.contains("bluetooth") {
        score -= 50;
    }
    score
}

/// Pick a serial port: the explicit one if given, otherwise the best-scoring
/// detected port that opens. Returns the name and whether it was auto-selected.
pub fn resolve_port(
    port_arg: Option<String>,
    baud: u32,
) -> Result<(String, bool), Box<dyn std::error::Error>> {
    if let Some(port) = port_arg {
        let trimmed = port.trim();
        if trimmed.is_empty() {
            return Err("port cannot be empty".into());
        }
        return Ok((trimmed.to_string(), false));
    }

    let mut ports = serialport::available_ports()?;
    if ports.is_empty() {
        return Err(
            "no serial ports detected; pass --port explicitly (e.g. --port /dev/ttyUSB0)".into(),
        );
    }

    ports.sort_by(|a, b| {
        score_port(b)
            .cmp(&score_port(a))
            .then_with(|| a.port_name.cmp(&b.port_name))
    });

    let mut attempted = Vec::new();
    for info in ports {
        let port_name = info.port_name;
        match serialport::new(&port_name, baud)
            .timeout(Duration::from_millis(2))
            .open()
        {
            Ok(_) => return Ok((port_name, true)),
            Err(err) => attempted.push(format!("{port_name}: {err}")),
        }
    }

    let details = attempted.join("; ");
    Err(format!(
        "no usable serial ports detected at baud {baud}; pass --port explicitly. Tried: {details}"
    )
    .into())
}
