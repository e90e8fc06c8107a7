//! Modbus Error Types
//!
//! One taxonomy shared by the codec, the client/server cores and the transports.

use thiserror::Error;

use crate::constants::exception_description;

/// Result type for modlink-proto operations
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Errors produced by the Modbus wire layer
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModbusError {
    /// Device answered with a Modbus exception PDU
    #[error("Modbus exception on FC {function:#04X}: {message} (code {code})")]
    Exception {
        function: u8,
        code: u8,
        message: &'static str,
    },

    /// No response within the request window
    #[error("Request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Socket, serial or TLS failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Client-side bound violation, raised before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown register format name
    #[error("Invalid register type: {0}")]
    InvalidType(String),

    /// Malformed frame or unexpected response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request dropped from the queue after an earlier timeout
    #[error("Request flushed after timeout")]
    Flushed,

    /// Client is closed
    #[error("Connection closed")]
    Closed,
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Transport(err.to_string())
    }
}

impl ModbusError {
    pub fn exception(function: u8, code: u8) -> Self {
        ModbusError::Exception {
            function: function & 0x7F,
            code,
            message: exception_description(code),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ModbusError::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ModbusError::Validation(msg.into())
    }

    pub fn invalid_type(msg: impl Into<String>) -> Self {
        ModbusError::InvalidType(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol(msg.into())
    }

    /// Errors that say something about the link rather than the single request.
    ///
    /// These feed the master's error budget; exceptions and validation
    /// failures do not.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout { .. }
                | ModbusError::Transport(_)
                | ModbusError::Flushed
                | ModbusError::Closed
        )
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_strips_high_bit() {
        let err = ModbusError::exception(0x83, 0x02);
        match err {
            ModbusError::Exception {
                function,
                code,
                message,
            } => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
                assert_eq!(message, "Illegal Data Address");
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_connection_level_classification() {
        assert!(ModbusError::Timeout { timeout_ms: 5000 }.is_connection_level());
        assert!(ModbusError::transport("reset").is_connection_level());
        assert!(!ModbusError::exception(3, 2).is_connection_level());
        assert!(!ModbusError::validation("too many").is_connection_level());
    }
}
