//! Byte transport to the instrument.
//!
//! Anything that reads and writes bytes can carry the protocol. Reads are
//! expected to block for at most a fixed timeout; an empty read means the
//! device had nothing to say, not that the link failed.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::{debug, trace};
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::errors::{DriverError, Result};

/// Baud rate the instrument ships with.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Read timeout; also the silence that ends a measurement run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Size of one read from the transport.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Most bytes [`drain`] buffers before giving up on a quiet link.
pub const MAX_DRAIN_BYTES: usize = 64 * 1024;

/// Read + Write + Send, so serial ports and in-memory mocks are interchangeable.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Read whatever is available. Returns `0` when the read timed out.
///
/// Interrupted reads are retried; only a real timeout reads as empty.
pub fn read_chunk(transport: &mut dyn Transport, buf: &mut [u8]) -> Result<usize> {
    loop {
        match transport.read(buf) {
            Ok(n) => {
                if n > 0 {
                    trace!("rx {:02X?}", &buf[..n]);
                }
                return Ok(n);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                return Ok(0)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write a whole command and flush it out.
pub fn write_frame(transport: &mut dyn Transport, bytes: &[u8]) -> Result<()> {
    trace!("tx {:02X?}", bytes);
    transport.write_all(bytes)?;
    transport.flush()?;
    Ok(())
}

/// Read until the transport times out, returning everything received.
///
/// Fails with [`DriverError::Protocol`] once more than [`MAX_DRAIN_BYTES`]
/// arrive without a pause.
pub fn drain(transport: &mut dyn Transport) -> Result<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = read_chunk(transport, &mut buf)?;
        if n == 0 {
            break;
        }
        if received.len() + n > MAX_DRAIN_BYTES {
            return Err(DriverError::Protocol(format!(
                "device kept sending past {MAX_DRAIN_BYTES} bytes while draining"
            )));
        }
        received.extend_from_slice(&buf[..n]);
    }
    Ok(received)
}

/// Open a serial port with the instrument's line settings (8N1, no flow control).
pub fn open_serial(path: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Transport>> {
    let port = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(timeout)
        .open()?;
    debug!("opened {path} at {baud_rate} baud, timeout {timeout:?}");
    Ok(Box::new(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Returns scripted results, then times out forever.
    struct Scripted(Vec<io::Result<Vec<u8>>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "timed out"));
            }
            let bytes = self.0.remove(0)?;
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_timeouts_read_as_empty() {
        let mut t = Scripted(vec![
            Err(io::Error::new(ErrorKind::WouldBlock, "again")),
            Ok(vec![1, 2]),
        ]);
        let mut buf = [0u8; 8];
        assert_eq!(read_chunk(&mut t, &mut buf).unwrap(), 0);
        assert_eq!(read_chunk(&mut t, &mut buf).unwrap(), 2);
        assert_eq!(read_chunk(&mut t, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut t = Scripted(vec![
            Err(io::Error::new(ErrorKind::Interrupted, "signal")),
            Ok(vec![0xB4, 0x01]),
        ]);
        let mut buf = [0u8; 8];
        assert_eq!(read_chunk(&mut t, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[0xB4, 0x01]);
    }

    #[test]
    fn test_hard_errors_propagate() {
        let mut t = Scripted(vec![Err(io::Error::new(ErrorKind::BrokenPipe, "gone"))]);
        let mut buf = [0u8; 8];
        assert!(read_chunk(&mut t, &mut buf).is_err());
    }

    #[test]
    fn test_drain_stops_at_first_timeout() {
        let mut t = Scripted(vec![Ok(vec![0x18, 0x01]), Ok(vec![0x84, 0x18])]);
        assert_eq!(drain(&mut t).unwrap(), vec![0x18, 0x01, 0x84, 0x18]);
    }

    #[test]
    fn test_drain_gives_up_on_endless_stream() {
        let chunks = (0..=MAX_DRAIN_BYTES / READ_CHUNK_SIZE)
            .map(|_| Ok(vec![0u8; READ_CHUNK_SIZE]))
            .collect();
        let mut t = Scripted(chunks);
        assert!(matches!(drain(&mut t), Err(DriverError::Protocol(_))));
    }
}
