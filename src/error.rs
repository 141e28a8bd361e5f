//! Huddle Error Types

use thiserror::Error;

/// Result type alias for Huddle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Huddle error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Frame of {length} bytes exceeds limit of {limit}")]
    FrameTooLarge { length: u32, limit: u32 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Connection lost to {0}")]
    ConnectionLost(String),

    // Registry errors
    #[error("Registration rejected after close: {reason}")]
    RegistrationAfterClose { reason: String },

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Client {client_id} already registered from {address}")]
    DuplicateRegistration { client_id: String, address: String },

    // Session errors
    #[error("Stale epoch {received} (current epoch is {current})")]
    StaleEpoch { received: u64, current: u64 },

    #[error("No alive candidate left in session {session_id}")]
    NoAliveCandidate { session_id: u64 },

    #[error("Client {0} is not a member of the assigned session")]
    NotInSession(String),

    #[error("Unknown session member: {0}")]
    UnknownMember(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionLost(_)
                | Error::Network(_)
        )
    }

    /// Errors that are dropped after logging and never abort a loop
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::StaleEpoch { .. }
                | Error::ConnectionLost(_)
        )
    }

    /// Check if this error means the session has no viable leader and must be torn down
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, Error::NoAliveCandidate { .. })
    }
}
