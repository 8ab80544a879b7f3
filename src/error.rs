//! Error types for the grab pipeline
//!
//! Provides structured error types with contextual information for:
//! - Configuration errors (invalid flags, bad matcher globs)
//! - Corpus errors (service-probe parse failures, regex compilation)
//! - Connection errors (dial failures, handshakes, timeouts)
//! - Protocol and application errors reported by scan modules

use std::io;
use thiserror::Error;

use crate::grab::ScanStatus;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, GrabError>;

#[derive(Error, Debug)]
pub enum GrabError {
    /// Flag or option level misconfiguration
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A product-matcher glob that does not compile
    #[error("invalid matcher pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Service-probe corpus parse failure
    #[error("service-probes parse error at line {line}: {message}")]
    CorpusParse { line: usize, message: String },

    /// A corpus regex that the engine rejects
    #[error("cannot compile match pattern {pattern:?}: {message}")]
    RegexCompile { pattern: String, message: String },

    /// A rejected input line
    #[error("invalid target {line:?}: {reason}")]
    InvalidTarget { line: String, reason: String },

    /// Dial deadline expired before the connection was established
    #[error("connection timed out: {message}")]
    ConnectionTimeout { message: String },

    #[error("connection refused: {message}")]
    ConnectionRefused { message: String },

    /// Bounded read expired before any byte arrived
    #[error("read timed out: {message}")]
    IoTimeout { message: String },

    /// The remote spoke, but not the protocol the module expected
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Module-level application failure (e.g. pattern gate did not match)
    #[error("application error: {message}")]
    Application { message: String },

    #[error("output error: {message}")]
    Output { message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl GrabError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_pattern<P: Into<String>, M: ToString>(pattern: P, message: M) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: message.to_string(),
        }
    }

    pub fn corpus_parse<S: Into<String>>(line: usize, message: S) -> Self {
        Self::CorpusParse {
            line,
            message: message.into(),
        }
    }

    pub fn regex_compile<P: Into<String>, M: ToString>(pattern: P, message: M) -> Self {
        Self::RegexCompile {
            pattern: pattern.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_target<L: Into<String>, R: Into<String>>(line: L, reason: R) -> Self {
        Self::InvalidTarget {
            line: line.into(),
            reason: reason.into(),
        }
    }

    pub fn connection_timeout<S: Into<String>>(message: S) -> Self {
        Self::ConnectionTimeout {
            message: message.into(),
        }
    }

    pub fn connection_refused<S: Into<String>>(message: S) -> Self {
        Self::ConnectionRefused {
            message: message.into(),
        }
    }

    pub fn io_timeout<S: Into<String>>(message: S) -> Self {
        Self::IoTimeout {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn application<S: Into<String>>(message: S) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    pub fn output<S: Into<String>>(message: S) -> Self {
        Self::Output {
            message: message.into(),
        }
    }

    /// The scan status a module response should carry for this error.
    pub fn scan_status(&self) -> ScanStatus {
        match self {
            Self::ConnectionTimeout { .. } => ScanStatus::ConnectionTimeout,
            Self::ConnectionRefused { .. } => ScanStatus::ConnectionRefused,
            Self::IoTimeout { .. } => ScanStatus::IoTimeout,
            Self::Protocol { .. } => ScanStatus::ProtocolError,
            Self::Application { .. } => ScanStatus::ApplicationError,
            Self::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionRefused => ScanStatus::ConnectionRefused,
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    ScanStatus::ConnectionTimeout
                }
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ScanStatus::IoTimeout,
                _ => ScanStatus::UnknownError,
            },
            _ => ScanStatus::UnknownError,
        }
    }
}
