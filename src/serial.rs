//! Serial transport and the single request/response exchange primitive.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use log::debug;

use crate::errors::{DriverError, Result};
use crate::frame::{self, Command, ACK, NAK};

/// Serial baud rate of the TFD 128 USB bridge.
const BAUD_RATE: u32 = 38400;

/// Read timeout for a single byte.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay after opening the port. The open call may return before the physical
/// link is actually usable.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Trait for Read + Write + Send, allowing different transport backends.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Read adapter over the boxed transport, so the frame decoder can stay
/// generic over `io::Read`.
struct TransportReader<'a>(&'a mut dyn Transport);

impl Read for TransportReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// One serial session with the logger.
///
/// The connection exclusively owns its transport and sequences exactly one
/// outstanding request/response exchange at a time; the port is released when
/// the connection is dropped. A failed exchange leaves the open transport
/// intact for a subsequent attempt.
pub struct SerialConnection {
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection").finish_non_exhaustive()
    }
}

impl SerialConnection {
    /// Open the serial device at `path` with the logger's fixed link
    /// parameters (38400 baud, even parity, one stop bit, 5 s read timeout).
    pub fn open(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(DriverError::DeviceNotFound(path.to_string()));
        }
        let port = serialport::new(path, BAUD_RATE)
            .parity(serialport::Parity::Even)
            .stop_bits(serialport::StopBits::One)
            .data_bits(serialport::DataBits::Eight)
            .timeout(READ_TIMEOUT)
            .open()?;
        std::thread::sleep(SETTLE_DELAY);
        debug!("opened {path} at {BAUD_RATE} baud 8E1");
        Ok(Self {
            transport: Box::new(port),
        })
    }

    /// Create a connection over an already-established transport.
    ///
    /// Used for testing against simulated devices; no settle delay applies.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Transfer `cmd` plus `payload` to the device and return the decoded
    /// reply payload.
    ///
    /// A reply of exactly `[NAK]` fails with [`DriverError::Busy`]. When the
    /// request carried data, the reply must begin with ACK or the exchange
    /// fails with a protocol error.
    pub fn exchange(&mut self, cmd: Command, payload: &[u8]) -> Result<Vec<u8>> {
        let wire = frame::encode_frame(cmd, payload);
        self.transport.write_all(&wire)?;
        self.transport.flush()?;

        let reply = frame::decode_frame(cmd, &mut TransportReader(self.transport.as_mut()))?;
        debug!("{} -> {:02x?}", cmd.byte() as char, reply);

        if reply == [NAK] {
            return Err(DriverError::Busy);
        }
        if !payload.is_empty() && reply.first() != Some(&ACK) {
            return Err(DriverError::Protocol(format!(
                "expected ACK, got {:02x?}",
                reply.first()
            )));
        }
        Ok(reply)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::{encode_frame, ETX, STX};
    use std::io::{self, Cursor};
    use std::sync::{Arc, Mutex};

    /// In-memory transport: serves queued reply bytes, captures every write.
    pub(crate) struct ScriptedPort {
        reads: Cursor<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedPort {
        pub fn new(replies: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let port = Self {
                reads: Cursor::new(replies),
                written: Arc::clone(&written),
            };
            (port, written)
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.read(buf)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn session_with_reply(reply: Vec<u8>) -> SerialConnection {
        let (port, _) = ScriptedPort::new(reply);
        SerialConnection::from_transport(Box::new(port))
    }

    #[test]
    fn exchange_returns_the_decoded_payload() {
        let mut session = session_with_reply(encode_frame(Command::Version, &[0x2a, 0x01]));
        let reply = session.exchange(Command::Version, &[]).unwrap();
        assert_eq!(reply, vec![0x2a, 0x01]);
    }

    #[test]
    fn nak_reply_is_busy_for_any_command() {
        for cmd in [Command::Version, Command::Parameters, Command::FirstBlock] {
            let mut session = session_with_reply(encode_frame(cmd, &[NAK]));
            assert!(matches!(
                session.exchange(cmd, &[]),
                Err(DriverError::Busy)
            ));
        }
    }

    #[test]
    fn data_command_requires_ack() {
        let mut session = session_with_reply(encode_frame(Command::Stop, &[0x00]));
        let err = session.exchange(Command::Stop, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn data_command_accepts_ack() {
        let mut session = session_with_reply(encode_frame(Command::Stop, &[ACK]));
        let reply = session.exchange(Command::Stop, &[1, 2, 3]).unwrap();
        assert_eq!(reply, vec![ACK]);
    }

    #[test]
    fn request_frame_is_escaped_on_the_wire() {
        let (port, written) = ScriptedPort::new(encode_frame(Command::Start, &[ACK]));
        let mut session = SerialConnection::from_transport(Box::new(port));
        session.exchange(Command::Start, &[STX, ETX]).unwrap();
        // STX 'S' <ENQ 0x82> <ENQ 0x83> ETX: both payload bytes escaped.
        assert_eq!(
            *written.lock().unwrap(),
            vec![STX, b'S', 0x05, 0x82, 0x05, 0x83, ETX]
        );
    }

    #[test]
    fn missing_device_path_is_device_not_found() {
        let err = SerialConnection::open("/dev/definitely-not-a-tfd128").unwrap_err();
        assert!(matches!(err, DriverError::DeviceNotFound(_)));
    }
}
