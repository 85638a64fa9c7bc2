//! Error taxonomy for the fiscal register gateway.
//!
//! Transport and protocol failures are kept apart from device-reported
//! error codes: the former mean the link misbehaved, the latter mean the
//! register understood the command and refused it.

use crate::ecr::status::FnWarnings;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EcrError {
    /// The link could not be opened or broke mid-call.
    #[error("transport error: {0}")]
    Transport(String),

    /// Lost STX, persistent checksum mismatch or an answer that never came.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// Nonzero error code answered by the register.
    #[error("device error 0x{code:02X}: {message}")]
    Device { code: u8, message: String },

    /// Shift open/close refused by the register. Fiscal module warnings
    /// gathered before the refusal travel with the error.
    #[error("shift command failed 0x{code:02X}: {message}")]
    ShiftCommandFailed {
        code: u8,
        message: String,
        warnings: FnWarnings,
    },

    #[error("device {device_id} is busy")]
    Concurrency { device_id: String },

    #[error("device {0} is not registered")]
    NotRegistered(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EcrError>;

impl EcrError {
    /// Device error with its catalog description attached.
    pub fn device(code: u8) -> Self {
        EcrError::Device {
            code,
            message: crate::ecr::catalog::describe(code).to_string(),
        }
    }

    /// Error code reported by the register, if this error carries one.
    pub fn device_code(&self) -> Option<u8> {
        match self {
            EcrError::Device { code, .. } | EcrError::ShiftCommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the link itself failed (the next call reconnects).
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            EcrError::Transport(_) | EcrError::ProtocolDesync(_) | EcrError::CorruptFrame(_)
        )
    }
}

impl From<std::io::Error> for EcrError {
    fn from(e: std::io::Error) -> Self {
        EcrError::Transport(e.to_string())
    }
}

impl From<serialport::Error> for EcrError {
    fn from(e: serialport::Error) -> Self {
        EcrError::Transport(e.to_string())
    }
}

impl From<rusqlite::Error> for EcrError {
    fn from(e: rusqlite::Error) -> Self {
        EcrError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EcrError {
    fn from(e: serde_json::Error) -> Self {
        EcrError::Storage(format!("json: {e}"))
    }
}
