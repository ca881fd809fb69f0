//! Transport-layer errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial error: {0}")]
    Serial(String),
    #[error("usb error: {0}")]
    Usb(String),
    /// A transfer moved fewer bytes than requested. Fatal for acquisition.
    #[error("short transfer: {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("operation timed out")]
    Timeout,
    #[error("malformed spec string: {0}")]
    Spec(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> TransportError {
        TransportError::Serial(e.to_string())
    }
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> TransportError {
        match e {
            rusb::Error::Timeout => TransportError::Timeout,
            other => TransportError::Usb(other.to_string()),
        }
    }
}

impl From<TransportError> for meas_types::Error {
    fn from(e: TransportError) -> meas_types::Error {
        match e {
            TransportError::Spec(msg) => meas_types::Error::Arg(msg),
            other => meas_types::Error::Transport(other.to_string()),
        }
    }
}
