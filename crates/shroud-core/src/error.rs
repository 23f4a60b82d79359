//! Core error types for shroud

use shroud_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the shroud ecosystem
#[derive(Error, Debug)]
pub enum ShroudError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session is closed or closing; only a new session recovers
    #[error("broken session")]
    BrokenSession,

    /// `close` was called on a session that is already closed
    #[error("trying to close a closed session")]
    RepeatClose,

    /// No physical connection is attached to carry the record
    #[error("no underlying connection available")]
    NoConnection,
}

impl SessionError {
    /// Whether this is the harmless second-close condition
    pub fn is_repeat_close(&self) -> bool {
        matches!(self, SessionError::RepeatClose)
    }
}

/// Stream-related errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// The stream is closed
    #[error("broken stream")]
    BrokenStream,

    /// `close` was called on a stream that is already closed
    #[error("trying to close a closed stream")]
    RepeatClose,

    /// Frame could not be encoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The owning session refused the write
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_messages() {
        assert_eq!(SessionError::BrokenSession.to_string(), "broken session");
        assert_eq!(
            SessionError::RepeatClose.to_string(),
            "trying to close a closed session"
        );
        assert!(SessionError::RepeatClose.is_repeat_close());
        assert!(!SessionError::BrokenSession.is_repeat_close());
    }

    #[test]
    fn test_errors_convert_upward() {
        let err: ShroudError = SessionError::BrokenSession.into();
        assert!(matches!(err, ShroudError::Session(SessionError::BrokenSession)));

        let err: StreamError = SessionError::NoConnection.into();
        assert!(matches!(err, StreamError::Session(SessionError::NoConnection)));
    }
}
