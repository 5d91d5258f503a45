//! STX/ETX framing with ENQ byte-stuffing.
//!
//! One frame = STX, the command byte, the escaped payload, ETX. Any payload
//! byte that collides with a control value is sent as a two-byte escape
//! sequence: ENQ followed by the byte plus 0x80 (mod 256). There is no length
//! prefix; ETX alone terminates the frame.

use std::io::Read;

use crate::errors::{DriverError, Result};

// ============================================================================
// Framing constants
// ============================================================================

/// Frame start marker.
pub const STX: u8 = 0x02;
/// Frame end marker.
pub const ETX: u8 = 0x03;
/// Escape marker for payload bytes colliding with STX/ETX/ENQ.
pub const ENQ: u8 = 0x05;
/// Positive acknowledgement, first payload byte of replies to data-carrying
/// commands.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement; a reply payload of exactly `[NAK]` means busy.
pub const NAK: u8 = 0x15;

/// Offset added to an escaped byte on the wire.
const ESCAPE_OFFSET: u8 = 0x80;

// ============================================================================
// Commands
// ============================================================================

/// Command tokens understood by the logger, one ASCII byte each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `S` - start logging.
    Start,
    /// `E` - stop logging.
    Stop,
    /// `Z` - read start/stop/mode/interval.
    Parameters,
    /// `A` - read recorded-point count.
    Count,
    /// `V` - read firmware version, doubles as the idle probe.
    Version,
    /// `R` - read the first data block.
    FirstBlock,
    /// `N` - read the next data block.
    NextBlock,
}

impl Command {
    pub fn byte(self) -> u8 {
        match self {
            Command::Start => b'S',
            Command::Stop => b'E',
            Command::Parameters => b'Z',
            Command::Count => b'A',
            Command::Version => b'V',
            Command::FirstBlock => b'R',
            Command::NextBlock => b'N',
        }
    }
}

// ============================================================================
// Encode / decode
// ============================================================================

/// Encode a command plus payload into a complete wire frame.
pub fn encode_frame(cmd: Command, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(STX);
    out.push(cmd.byte());
    for &b in payload {
        if matches!(b, STX | ETX | ENQ) {
            out.push(ENQ);
            out.push(b.wrapping_add(ESCAPE_OFFSET));
        } else {
            out.push(b);
        }
    }
    out.push(ETX);
    out
}

/// Decode one response frame from `reader`, validating the start marker and
/// the echoed command, and unescaping the payload.
///
/// The returned payload may be empty and never contains a raw control value.
/// A read that times out before ETX arrives fails with the underlying io
/// error.
pub fn decode_frame<R: Read>(expected: Command, reader: &mut R) -> Result<Vec<u8>> {
    let b = read_byte(reader)?;
    if b != STX {
        return Err(DriverError::Protocol(format!(
            "expected STX, got 0x{b:02x}"
        )));
    }

    let b = read_byte(reader)?;
    if b != expected.byte() {
        return Err(DriverError::Protocol(format!(
            "expected command echo '{}', got 0x{b:02x}",
            expected.byte() as char
        )));
    }

    let mut payload = Vec::new();
    loop {
        match read_byte(reader)? {
            ETX => break,
            ENQ => {
                let escaped = read_byte(reader)?;
                payload.push(escaped.wrapping_sub(ESCAPE_OFFSET));
            }
            b => payload.push(b),
        }
    }
    Ok(payload)
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(payload: &[u8]) -> Vec<u8> {
        let wire = encode_frame(Command::Parameters, payload);
        decode_frame(Command::Parameters, &mut Cursor::new(wire)).unwrap()
    }

    #[test]
    fn empty_payload_roundtrips() {
        assert_eq!(roundtrip(&[]), Vec::<u8>::new());
    }

    #[test]
    fn plain_payload_roundtrips() {
        let payload = [0x00, 0x07, 0x01, 0x1f, 0xff, b'x'];
        assert_eq!(roundtrip(&payload), payload);
    }

    #[test]
    fn control_bytes_roundtrip() {
        let payload = [STX, ETX, ENQ, 0x04, STX];
        assert_eq!(roundtrip(&payload), payload);
    }

    #[test]
    fn control_byte_encodes_as_two_wire_bytes() {
        let wire = encode_frame(Command::Count, &[ETX]);
        // STX 'A' ENQ (ETX + 0x80) ETX
        assert_eq!(wire, vec![STX, b'A', ENQ, 0x83, ETX]);
    }

    #[test]
    fn escape_wraps_past_0xff() {
        // 0x85 unescapes to 0x05 (ENQ); the offset arithmetic is mod 256.
        let wire = vec![STX, b'Z', ENQ, 0x85, ETX];
        let payload = decode_frame(Command::Parameters, &mut Cursor::new(wire)).unwrap();
        assert_eq!(payload, vec![ENQ]);
    }

    #[test]
    fn missing_stx_is_a_protocol_error() {
        let wire = vec![0x00, b'Z', ETX];
        let err = decode_frame(Command::Parameters, &mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn wrong_command_echo_is_a_protocol_error() {
        let wire = encode_frame(Command::Count, &[1, 2]);
        let err = decode_frame(Command::Parameters, &mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn truncated_frame_surfaces_the_read_error() {
        let wire = vec![STX, b'V', 0x01];
        let err = decode_frame(Command::Version, &mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, DriverError::Io(_)));
    }
}
