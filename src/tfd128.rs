//! TFD 128 device driver.
//!
//! This module provides the driver for the TFD 128 battery-powered
//! temperature/humidity data logger over its serial protocol.
//!
//! # Timestamps
//!
//! The logger does NOT store per-point timestamps - only the start and stop
//! of a logging session are recorded. Point times are reconstructed on the
//! host by linear interpolation between the corrected start and stop times
//! (see [`RetrievalPlan`]). All timestamps are raw seconds since the epoch in
//! local calendar terms; string rendering is a presentation concern left to
//! callers.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use log::debug;
use serde::Serialize;

use crate::errors::{DriverError, Result};
use crate::frame::Command;
use crate::serial::{SerialConnection, Transport};

// ============================================================================
// Data Types
// ============================================================================

/// Measurement channels, using the mask values the logger stores internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeFlags(u8);

impl ModeFlags {
    pub const HUMIDITY: ModeFlags = ModeFlags(0x01);
    pub const TEMPERATURE: ModeFlags = ModeFlags(0x02);

    const ALL: u8 = 0x03;

    /// Build flags from raw bits, rejecting anything outside the recognized
    /// set.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(DriverError::Validation(format!(
                "unknown mode bits 0x{bits:02x}"
            )));
        }
        Ok(Self(bits))
    }

    /// Flags as reported by the device; unknown bits are ignored.
    fn from_device(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: ModeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ModeFlags {
    type Output = ModeFlags;
    fn bitor(self, rhs: ModeFlags) -> ModeFlags {
        ModeFlags(self.0 | rhs.0)
    }
}

/// Stored logging-session parameters, read via the `Z` and `A` queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggerParameters {
    /// Session start, local epoch seconds.
    pub start: i64,
    /// Session stop, local epoch seconds. `None` when the device recorded no
    /// stop time (memory full or battery drained mid-session).
    pub stop: Option<i64>,
    /// Active measurement channels.
    pub mode: ModeFlags,
    /// Sampling interval in minutes (1 or 5).
    pub interval: u8,
    /// Number of recorded measurement points.
    pub count: u32,
}

/// One recorded measurement point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Interpolated point time, local epoch seconds.
    pub timestamp: i64,
    /// Temperature in degrees Celsius (stored in tenths on the device).
    pub temperature: f32,
    /// Relative humidity in percent; present iff the session logged humidity.
    pub humidity: Option<u8>,
}

// ============================================================================
// Retrieval timing
// ============================================================================

/// Corrected session timing for one retrieval pass.
///
/// The device only stores points on the fixed sampling grid, so the last
/// stored point may lie up to one interval (minus a second) before the
/// recorded stop time; the recorded stop is rounded down accordingly. When no
/// stop was recorded at all, one is synthesized from the point count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalPlan {
    pub start: i64,
    pub stop: i64,
    /// Seconds between consecutive points, for timestamp interpolation.
    pub delta: f64,
}

impl RetrievalPlan {
    pub fn new(params: &LoggerParameters) -> Self {
        let period = params.interval as i64 * 60;
        let stop = match params.stop {
            Some(stop) => {
                let elapsed = stop - params.start;
                params.start + elapsed.div_euclid(period) * period
            }
            // No stop time (battery failure or eeprom full): assume exactly
            // `count` points at full spacing.
            None => params.start + params.count.saturating_sub(1) as i64 * period,
        };
        let delta = if params.count > 1 {
            (stop - params.start) as f64 / (params.count - 1) as f64
        } else {
            0.0
        };
        Self {
            start: params.start,
            stop,
            delta,
        }
    }
}

// ============================================================================
// Date codec
// ============================================================================

// The logger exchanges dates as seven octets: year low/high, zero-based
// month, day, hour, minute, second, interpreted in local time.

fn decode_datetime(octets: &[u8]) -> Result<i64> {
    let year = octets[0] as i32 + ((octets[1] as i32) << 8);
    let month = octets[2] as u32 + 1;
    let (day, hour, minute, second) = (
        octets[3] as u32,
        octets[4] as u32,
        octets[5] as u32,
        octets[6] as u32,
    );
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| {
            DriverError::Protocol(format!(
                "invalid device date {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            ))
        })
}

fn encode_datetime(t: &DateTime<Local>) -> [u8; 7] {
    let year = t.year() as u16;
    [
        (year & 0xff) as u8,
        (year >> 8) as u8,
        t.month0() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
    ]
}

fn now_octets() -> [u8; 7] {
    encode_datetime(&Local::now())
}

fn decode_u16_le(payload: &[u8], what: &str) -> Result<u16> {
    match payload {
        [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(DriverError::Protocol(format!(
            "{what} payload of {} bytes (expected 2)",
            payload.len()
        ))),
    }
}

// ============================================================================
// Tfd128 Driver
// ============================================================================

/// TFD 128 data logger driver.
///
/// Owns one serial session and issues strictly alternating request/response
/// exchanges on it.
///
/// # Example
/// ```ignore
/// let mut logger = Tfd128::open("/dev/tfd128")?;
/// if logger.is_idle()? {
///     let params = logger.params()?;
///     println!("{} points every {} min", params.count, params.interval);
///     for point in logger.data()? {
///         println!("{} {:.1}", point.timestamp, point.temperature);
///     }
/// }
/// ```
pub struct Tfd128 {
    session: SerialConnection,
}

impl Tfd128 {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the logger at the given serial device path.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            session: SerialConnection::open(path)?,
        })
    }

    /// Create a driver over an already-established transport.
    pub fn from_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            session: SerialConnection::from_transport(transport),
        }
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Query the firmware version.
    pub fn version(&mut self) -> Result<u16> {
        let reply = self.session.exchange(Command::Version, &[])?;
        decode_u16_le(&reply, "version")
    }

    /// Whether the logger is idle. Uses the version query as a probe; a busy
    /// device answers it with NAK.
    pub fn is_idle(&mut self) -> Result<bool> {
        match self.version() {
            Ok(_) => Ok(true),
            Err(DriverError::Busy) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the logger is currently running a logging session.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.is_idle().map(|idle| !idle)
    }

    /// Read the stored session parameters (`Z`) and point count (`A`).
    pub fn params(&mut self) -> Result<LoggerParameters> {
        let reply = self.session.exchange(Command::Parameters, &[])?;
        let (start, mode, interval, stop) = match reply.len() {
            // Start date, mode, interval; no stop recorded.
            9 => (
                decode_datetime(&reply[..7])?,
                ModeFlags::from_device(reply[7]),
                reply[8],
                None,
            ),
            // Same, followed by the stop date.
            16 => (
                decode_datetime(&reply[..7])?,
                ModeFlags::from_device(reply[7]),
                reply[8],
                Some(decode_datetime(&reply[9..16])?),
            ),
            n => {
                return Err(DriverError::Protocol(format!(
                    "parameter payload of {n} bytes (expected 9 or 16)"
                )))
            }
        };

        let count = decode_u16_le(&self.session.exchange(Command::Count, &[])?, "count")? as u32;
        let params = LoggerParameters {
            start,
            stop,
            mode,
            interval,
            count,
        };
        debug!("logger parameters: {params:?}");
        Ok(params)
    }

    /// Start a logging session at the current wall-clock time.
    ///
    /// `interval` must be 1 or 5 minutes. The temperature channel is always
    /// logged regardless of the requested mode; the device cannot record
    /// humidity alone.
    pub fn start(&mut self, interval: u8, mode: ModeFlags) -> Result<()> {
        if !matches!(interval, 1 | 5) {
            return Err(DriverError::Validation(format!(
                "interval {interval} min (expected 1 or 5)"
            )));
        }
        // Failsafe: always add the temperature flag.
        let mode = mode | ModeFlags::TEMPERATURE;

        let mut payload = now_octets().to_vec();
        payload.push(mode.bits());
        payload.push(interval);
        self.session.exchange(Command::Start, &payload)?;
        debug!(
            "started logging: interval={interval}min mode=0x{:02x}",
            mode.bits()
        );
        Ok(())
    }

    /// Stop the running logging session, stamping it with the current
    /// wall-clock time.
    pub fn stop(&mut self) -> Result<()> {
        self.session.exchange(Command::Stop, &now_octets())?;
        debug!("stopped logging");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Data retrieval
    // ------------------------------------------------------------------------

    /// Iterate over the recorded measurements, one `Vec` per device block.
    ///
    /// The first advance reads the session parameters and point count from
    /// the device; subsequent advances fetch one raw block each (`R`, then
    /// `N`) until exactly `count` points have been emitted. The pass borrows
    /// the driver exclusively and is not restartable; call `blocks()` again
    /// for a fresh top-to-bottom read.
    pub fn blocks(&mut self) -> Blocks<'_> {
        Blocks {
            device: self,
            cursor: None,
            done: false,
        }
    }

    /// Read all recorded measurements as one flat vector.
    pub fn data(&mut self) -> Result<Vec<Measurement>> {
        let mut points = Vec::new();
        for block in self.blocks() {
            points.extend(block?);
        }
        Ok(points)
    }
}

// ============================================================================
// Block iteration
// ============================================================================

/// Cursor state for one retrieval pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationState {
    /// Points still owed; iteration ends exactly when this reaches zero.
    pub remaining: u32,
    /// Points emitted so far, drives timestamp interpolation.
    pub index: u32,
    /// Whether the next block request is the first one (`R` vs `N`).
    pub first_block: bool,
}

struct BlockCursor {
    plan: RetrievalPlan,
    mode: ModeFlags,
    state: IterationState,
}

/// Iterator over device data blocks; see [`Tfd128::blocks`].
pub struct Blocks<'a> {
    device: &'a mut Tfd128,
    cursor: Option<BlockCursor>,
    done: bool,
}

impl Iterator for Blocks<'_> {
    type Item = Result<Vec<Measurement>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.cursor.is_none() {
            let params = match self.device.params() {
                Ok(p) => p,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            self.cursor = Some(BlockCursor {
                plan: RetrievalPlan::new(&params),
                mode: params.mode,
                state: IterationState {
                    remaining: params.count,
                    index: 0,
                    first_block: true,
                },
            });
        }
        let cursor = self.cursor.as_mut().unwrap();

        if cursor.state.remaining == 0 {
            self.done = true;
            return None;
        }

        let cmd = if cursor.state.first_block {
            Command::FirstBlock
        } else {
            Command::NextBlock
        };
        let raw = match self.device.session.exchange(cmd, &[]) {
            Ok(raw) => raw,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        cursor.state.first_block = false;

        let points = decode_block(&raw, &cursor.plan, cursor.mode, &mut cursor.state);
        if points.is_empty() {
            // The device owes more points but sent none; bail out instead of
            // requesting blocks forever.
            self.done = true;
            return Some(Err(DriverError::Protocol(format!(
                "empty data block with {} points remaining",
                cursor.state.remaining
            ))));
        }
        Some(Ok(points))
    }
}

/// Decode one raw block into at most `state.remaining` measurements.
///
/// The USB transport is block oriented, so the final block usually carries
/// more bytes than there are points left; the excess is padding and is
/// discarded.
fn decode_block(
    raw: &[u8],
    plan: &RetrievalPlan,
    mode: ModeFlags,
    state: &mut IterationState,
) -> Vec<Measurement> {
    let with_humidity = mode.contains(ModeFlags::HUMIDITY);
    let point_len = if with_humidity { 3 } else { 2 };

    let mut points = Vec::new();
    let mut bytes = raw;
    while bytes.len() >= point_len && state.remaining > 0 {
        let timestamp = plan.start + (state.index as f64 * plan.delta).round() as i64;
        // Little-endian 16-bit two's complement, tenths of a degree.
        let temperature = i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 10.0;
        let humidity = with_humidity.then(|| bytes[2]);
        points.push(Measurement {
            timestamp,
            temperature,
            humidity,
        });
        bytes = &bytes[point_len..];
        state.remaining -= 1;
        state.index += 1;
    }
    points
}

// ============================================================================
// Tests
// ============================================================================
