//! Daemon error types

use modlink_proto::ModbusError;
use thiserror::Error;

/// Exit code that asks the supervisor for a restart
pub const RESTART_EXIT_CODE: i32 = 156;

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Modbus(#[from] ModbusError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Formula '{formula}': {message}")]
    Formula { formula: String, message: String },

    #[error("Unknown point: {0}")]
    UnknownPoint(String),

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Error budget exhausted after {failures} failed device polls")]
    ErrorBudgetExhausted { failures: u32 },
}

impl LinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn formula(formula: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Formula {
            formula: formula.into(),
            message: message.to_string(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            LinkError::ErrorBudgetExhausted { .. } => RESTART_EXIT_CODE,
            _ => 1,
        }
    }
}

impl From<figment::Error> for LinkError {
    fn from(err: figment::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            LinkError::ErrorBudgetExhausted { failures: 12 }.exit_code(),
            RESTART_EXIT_CODE
        );
        assert_eq!(LinkError::config("bad").exit_code(), 1);
    }

    #[test]
    fn test_modbus_error_is_transparent() {
        let err: LinkError = ModbusError::Flushed.into();
        assert_eq!(err.to_string(), ModbusError::Flushed.to_string());
    }
}
