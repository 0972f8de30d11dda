use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default read timeout of the serial link. Reads return `TimedOut` after
/// this, which is what lets the capture loop observe cancellation.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Duplex byte stream to a SUMP device.
pub trait SumpLink: Read + Write + Send {
    /// Discard whatever the device sent that has not been read yet.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Close both directions. Reads and writes fail afterwards.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// Opens links and force-closes the current one.
///
/// `close` may be called from any thread while another thread is blocked in a
/// read on the link returned by `open`; the blocked read must return shortly
/// after.
pub trait Transport: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SumpLink>, LinkError>;

    fn close(&self);
}

/// [`Transport`] over a local serial port, 8N1 without flow control.
#[derive(Debug)]
pub struct SerialTransport {
    read_timeout: Duration,
    closed: Mutex<Arc<AtomicBool>>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::with_read_timeout(DEFAULT_READ_TIMEOUT)
    }

    pub fn with_read_timeout(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            closed: Mutex::new(Arc::new(AtomicBool::new(true))),
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SerialTransport {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SumpLink>, LinkError> {
        log::debug!("Opening {} @ {}bps", port, baud);
        let serial = serialport::new(port, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.read_timeout)
            .open()?;

        let closed = Arc::new(AtomicBool::new(false));
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&closed);

        Ok(Box::new(SerialLink {
            serial,
            closed,
            shut: false,
        }))
    }

    fn close(&self) {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct SerialLink {
    serial: Box<dyn SerialPort>,
    // set by the transport; only reads observe it so a detach can still reset the device
    closed: Arc<AtomicBool>,
    shut: bool,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial link closed")
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.shut || self.closed.load(Ordering::SeqCst) {
            return Err(not_connected());
        }
        self.serial.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shut {
            return Err(not_connected());
        }
        self.serial.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.shut {
            return Err(not_connected());
        }
        self.serial.flush()
    }
}

impl SumpLink for SerialLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.serial
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.shut {
            return Ok(());
        }
        let flushed = self.serial.flush();
        self.shut = true;
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_fails() {
        let transport = SerialTransport::new();
        let result = transport.open("/dev/this-port-does-not-exist", 115_200);
        assert!(matches!(result, Err(LinkError::SerialPort(_))));
    }

    #[test]
    fn test_close_without_link_is_harmless() {
        let transport = SerialTransport::default();
        transport.close();
        transport.close();
    }
}
