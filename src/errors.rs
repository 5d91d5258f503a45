use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("TFD 128 device '{0}' not found")]
    DeviceNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The logger answered NAK. The wire signal is identical for "a logging
    /// session is running" and any other command rejection, so both surface
    /// as this one condition.
    #[error("device busy")]
    Busy,
    #[error("invalid argument: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
