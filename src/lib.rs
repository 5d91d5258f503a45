//! Serial protocol driver for the TFD 128 temperature/humidity data logger.
//!
//! The TFD 128 records temperature (and optionally humidity) at a fixed
//! 1- or 5-minute interval and exposes its memory over a 38400 baud serial
//! link. Frames are STX/ETX delimited with ENQ byte-stuffing; a NAK reply
//! means the logger is busy with a running session (or rejected the command -
//! the wire does not distinguish the two).
//!
//! # Reading out a logger
//!
//! ```ignore
//! let mut logger = tfd128::Tfd128::open("/dev/tfd128")?;
//! if logger.is_idle()? {
//!     for block in logger.blocks() {
//!         for point in block? {
//!             println!("{} {:.1}", point.timestamp, point.temperature);
//!         }
//!     }
//! }
//! ```
//!
//! Per-point timestamps are never transmitted by the device; they are
//! interpolated between the session's corrected start and stop times.

mod errors;
mod frame;
mod logging;
mod serial;
mod tfd128;

pub use errors::{DriverError, Result};
pub use frame::{Command, ACK, ENQ, ETX, NAK, STX};
pub use logging::init_logging;
pub use serial::{SerialConnection, Transport};
pub use tfd128::{
    Blocks, IterationState, LoggerParameters, Measurement, ModeFlags, RetrievalPlan, Tfd128,
};
