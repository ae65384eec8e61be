//! Error types for GW-Nexus
//!
//! Every failure reported to a controller maps to one of these variants;
//! the `Display` string becomes the response frame's error message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("Unknown request type: {0}")]
    UnknownKind(u32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error("{what} at {address:#x} is not readable")]
    NotReadable { address: usize, what: String },

    #[error("Address {0:#x} is not executable")]
    NotExecutable(usize),

    #[error("Address {0:#x} is not committed")]
    NotCommitted(usize),

    #[error("Access violation at {address:#x} during {context}")]
    AccessViolation { address: usize, context: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transport-level failures. Never serialized into a response frame;
    /// an `Ipc` error terminates the worker instead.
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience for range probes that fail partway through.
    pub fn not_readable(address: usize, what: impl Into<String>) -> Self {
        Error::NotReadable {
            address,
            what: what.into(),
        }
    }

    pub fn access_violation(address: usize, context: impl Into<String>) -> Self {
        Error::AccessViolation {
            address,
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutting_down_message_is_fixed() {
        assert_eq!(Error::ShuttingDown.to_string(), "Server is shutting down");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::NotFound("Pattern".to_string());
        assert_eq!(err.to_string(), "Pattern not found");

        let err = Error::NotFound("Function".to_string());
        assert_eq!(err.to_string(), "Function not found");
    }

    #[test]
    fn test_timeout_message_names_timeout() {
        let err = Error::Timeout("host thread did not drain the call".into());
        assert!(err.to_string().starts_with("Timeout"));
    }

    #[test]
    fn test_access_violation_names_address() {
        let err = Error::access_violation(0xDEAD_0000, "memory read");
        let msg = err.to_string();
        assert!(msg.contains("0xdead0000"));
        assert!(msg.contains("memory read"));
    }

    #[test]
    fn test_not_readable_names_step() {
        let err = Error::not_readable(0x1000, "pointer-chain step 2");
        assert!(err.to_string().contains("pointer-chain step 2"));
        assert!(err.to_string().contains("0x1000"));
    }

    #[test]
    fn test_unknown_kind_display() {
        assert!(Error::UnknownKind(48).to_string().contains("48"));
    }
}
