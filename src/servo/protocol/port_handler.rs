use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crate::servo::sim::ServoBusSim;

/// Half-duplex byte stream to the servo bus. Reads block for at most the
/// configured timeout and report expiry as `io::ErrorKind::TimedOut`.
pub trait PortHandler {
    /// May return fewer bytes than `buf` holds; never returns `Ok(0)` for a
    /// non-empty buffer unless the stream is exhausted.
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_port(&mut self, packet: &[u8]) -> io::Result<()>;
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn read_timeout(&self) -> Duration;

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        match self.read_port(&mut byte)? {
            0 => Err(io::Error::new(io::ErrorKind::TimedOut, "no data on bus")),
            _ => Ok(byte[0]),
        }
    }
}

impl<P: PortHandler + ?Sized> PortHandler for Box<P> {
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_port(buf)
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<()> {
        (**self).write_port(packet)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn read_timeout(&self) -> Duration {
        (**self).read_timeout()
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        (**self).read_byte()
    }
}

/// In-memory port wired to a simulated bus. Replies are queued as soon as a
/// frame is written; an empty queue reads as a timeout.
#[derive(Debug)]
pub struct SimPort {
    sim: ServoBusSim,
    rx_buffer: VecDeque<u8>,
    timeout: Duration,
    max_chunk: usize,
    written: Vec<Vec<u8>>,
    read_calls: usize,
    motion: bool,
}

impl SimPort {
    pub fn new(sim: ServoBusSim) -> Self {
        Self {
            sim,
            rx_buffer: VecDeque::new(),
            timeout: Duration::from_millis(50),
            max_chunk: usize::MAX,
            written: Vec::new(),
            read_calls: 0,
            motion: false,
        }
    }

    pub fn sim(&self) -> &ServoBusSim {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut ServoBusSim {
        &mut self.sim
    }

    /// Queue raw bytes ahead of any reply, e.g. line noise.
    pub fn inject(&mut self, bytes: &[u8]) {
        self.rx_buffer.extend(bytes.iter().copied());
    }

    /// Cap the bytes handed out per read call to exercise short reads.
    pub fn set_max_chunk(&mut self, max_chunk: usize) {
        self.max_chunk = max_chunk.max(1);
    }

    /// Advance the emulated servos one motion step before each frame, so
    /// goals are reached over successive transactions.
    pub fn set_motion(&mut self, motion: bool) {
        self.motion = motion;
    }

    /// Every frame written so far, oldest first.
    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls
    }

    pub fn pending_rx(&self) -> usize {
        self.rx_buffer.len()
    }
}

impl PortHandler for SimPort {
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls += 1;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.rx_buffer.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated read timeout"));
        }
        let count = buf.len().min(self.max_chunk).min(self.rx_buffer.len());
        for slot in buf.iter_mut().take(count) {
            if let Some(byte) = self.rx_buffer.pop_front() {
                *slot = byte;
            }
        }
        Ok(count)
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<()> {
        self.written.push(packet.to_vec());
        if self.motion {
            self.sim.step();
        }
        match self.sim.handle_frame(packet) {
            Ok(Some(response)) => self.rx_buffer.extend(response),
            Ok(None) => {}
            Err(err) => log::debug!("simulated bus ignored frame: {err}"),
        }
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new(ServoBusSim::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

type TraceObserver = Box<dyn FnMut(Direction, &[u8]) + Send>;

/// Pass-through port that mirrors every byte block to `log::trace!` and an
/// optional observer.
pub struct TracePort<P> {
    inner: P,
    observer: Option<TraceObserver>,
}

impl<P: PortHandler> TracePort<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            observer: None,
        }
    }

    pub fn with_observer<F>(inner: P, observer: F) -> Self
    where
        F: FnMut(Direction, &[u8]) + Send + 'static,
    {
        Self {
            inner,
            observer: Some(Box::new(observer)),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.inner
    }

    pub fn into_inner(self) -> P {
        self.inner
    }

    fn mirror(&mut self, direction: Direction, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        log::trace!("[bus {:?}] {}", direction, format_packet_hex(bytes));
        if let Some(observer) = self.observer.as_mut() {
            observer(direction, bytes);
        }
    }
}

impl<P: PortHandler> PortHandler for TracePort<P> {
    fn read_port(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read_port(buf)?;
        self.mirror(Direction::Rx, &buf[..count]);
        Ok(count)
    }

    fn write_port(&mut self, packet: &[u8]) -> io::Result<()> {
        self.inner.write_port(packet)?;
        self.mirror(Direction::Tx, packet);
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    fn read_timeout(&self) -> Duration {
        self.inner.read_timeout()
    }
}

pub fn format_packet_hex(packet: &[u8]) -> String {
    packet
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
