//! Unified error types for leakcheck.
//!
//! Library code uses `Error` and `Result<T>`. Driver code embedding the
//! checker is expected to use `anyhow` for ergonomic error handling; the
//! conversions below make `?` work in both directions.

use std::path::PathBuf;
use thiserror::Error as ThisError;

/// Unified error type for leakcheck library operations.
///
/// User-facing findings are never errors: they are reported as diagnostics
/// and the analysis continues. `Error` covers configuration problems,
/// malformed input models, and internal invariant violations.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Configuration file error.
    #[error("configuration error in {}: {message}", path.display())]
    Config {
        /// Path to the problematic configuration file.
        path: PathBuf,
        /// Description of what went wrong.
        message: String,
    },

    /// Configuration parse error.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Unknown diagnostic message key in settings or configuration.
    #[error("unknown message key: {0}")]
    UnknownMessageKey(String),

    /// The control-flow graph handed in for a method is malformed.
    #[error("malformed control-flow graph for `{method}`: {message}")]
    InvalidCfg {
        /// The method whose graph failed validation.
        method: String,
        /// Description of the structural problem.
        message: String,
    },

    /// An internal analysis invariant was violated.
    ///
    /// This indicates a bug in the annotations or in a collaborating
    /// framework, not in the program under analysis. Per-method analysis is
    /// transactional: partial state is discarded when this is raised.
    #[error("internal invariant violated: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context.
    #[error("{context}: {message}")]
    WithContext {
        /// Context describing where the error occurred.
        context: String,
        /// The underlying error message.
        message: String,
    },

    /// Generic error for other cases.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a config error.
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an unknown message key error.
    pub fn unknown_message_key(key: impl Into<String>) -> Self {
        Self::UnknownMessageKey(key.into())
    }

    /// Create a malformed-CFG error.
    pub fn invalid_cfg(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCfg {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create an internal invariant error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Add context to an error.
    #[must_use]
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            message: self.to_string(),
        }
    }

    /// True for the fail-fast kind that aborts a per-method analysis.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::InvalidCfg { .. })
    }
}

/// Result type alias for leakcheck library operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::other(err.to_string())
    }
}

/// Convenience macro mirroring `anyhow::bail!` but returning `Error`.
#[macro_export]
macro_rules! leakcheck_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::other(format!($($arg)*)));
    };
}

/// Convenience macro mirroring `anyhow::ensure!`.
#[macro_export]
macro_rules! leakcheck_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::leakcheck_bail!($($arg)*);
        }
    };
}
