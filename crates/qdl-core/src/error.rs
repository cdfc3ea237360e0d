//! Session errors and the status codes they map to.

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::{FirehoseError, SaharaError};
use crate::pump::PumpError;
use crate::script::ScriptError;
use crate::session::Mode;
use crate::transport::TransportError;

/// Outcome of a run as seen by C callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Generic = -1,
    DeviceNotFound = -2,
    FlashFailed = -3,
    ProvisionFailed = -4,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Cannot read programmer {}: {source}", .path.display())]
    Programmer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),
    #[error("Sahara failed: {0}")]
    Sahara(#[from] SaharaError),
    #[error("Firehose failed: {0}")]
    Firehose(#[from] FirehoseError),
    #[error("Transfer failed: {0}")]
    Pump(#[from] PumpError),
}

impl From<TransportError> for RunError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeviceNotFound(serial) => RunError::DeviceNotFound(serial),
            other => RunError::Transport(other),
        }
    }
}

impl RunError {
    /// Status code for this failure in `mode`.
    ///
    /// Anything that goes wrong before the device speaks a protocol is
    /// generic. Protocol failures after that point take the mode's code.
    pub fn status(&self, mode: Mode) -> Status {
        match self {
            RunError::DeviceNotFound(_) => Status::DeviceNotFound,
            RunError::InvalidArgument(_)
            | RunError::Programmer { .. }
            | RunError::Script(_)
            | RunError::Transport(_)
            | RunError::Sahara(SaharaError::Transport(_)) => Status::Generic,
            RunError::Sahara(_) | RunError::Firehose(_) | RunError::Pump(_) => {
                mode.failure_status()
            }
        }
    }
}
