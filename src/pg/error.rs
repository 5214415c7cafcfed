//! Error types for the PostgreSQL wire protocol layer.

use std::fmt;
use std::io;

/// Result type for PostgreSQL session operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors raised by a [`Session`](super::session::Session).
#[derive(Debug)]
pub enum PgError {
    /// I/O error during communication.
    Io(io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    Protocol(String),

    /// Authentication failed.
    Auth(String),

    /// Server returned an error.
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// The connection string could not be used.
    Config(String),

    /// Connection is closed or in invalid state.
    ConnectionClosed,

    /// Timed out while establishing the connection.
    Timeout,
}

impl PgError {
    /// Build a `Server` error from the fields of an ErrorResponse.
    pub(crate) fn from_fields(fields: &std::collections::HashMap<u8, String>) -> Self {
        PgError::Server {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }

    /// The SQLSTATE code, when the server reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } if !code.is_empty() => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Server {
                severity,
                code,
                message,
                detail,
                hint,
            } => {
                write!(f, "{}:  {} ({})", severity, message, code)?;
                if let Some(d) = detail {
                    write!(f, "\nDETAIL:  {}", d)?;
                }
                if let Some(h) = hint {
                    write!(f, "\nHINT:  {}", h)?;
                }
                Ok(())
            }
            PgError::Config(msg) => write!(f, "{}", msg),
            PgError::ConnectionClosed => write!(f, "Connection is closed"),
            PgError::Timeout => write!(f, "Timed out while connecting"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}
