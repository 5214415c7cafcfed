//! Error types surfaced by the driver.
//!
//! Wire-level failures arrive as [`PgError`] and are folded into
//! [`DriverError`] at the connection boundary: server diagnostics become
//! `CommandError`, everything else stays wrapped as `Session`.

use thiserror::Error;

use crate::pg::error::PgError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("connection error: {message}")]
    ConnectionError { message: String },

    #[error("the PostgreSQL session was not built for concurrent use")]
    ThreadSafetyUnavailable,

    #[error("command error: {message}")]
    CommandError {
        message: String,
        /// SQLSTATE reported by the server, if any.
        code: Option<String>,
    },

    #[error("unsupported argument type: {0}")]
    UnsupportedArgumentType(String),

    #[error("unsupported column type oid: {oid}")]
    UnsupportedColumnType { oid: i32 },

    #[error("invalid byte string format")]
    InvalidByteFormat,

    #[error("could not decode hex string: {0}")]
    HexDecodeError(String),

    #[error("could not decode column value: {0}")]
    Decode(String),

    #[error("waiting for notification failed: {0}")]
    NotificationWaitError(String),

    #[error("LastInsertId is not supported by PostgreSQL")]
    LastInsertIdUnsupported,

    #[error("exec is not supported for LISTEN statements")]
    ExecNotSupportedForListen,

    #[error("statement is closed")]
    StatementClosed,

    #[error("statement was prepared on a different connection")]
    ForeignStatement,

    #[error("destination has {got} slots but the result has {expected} columns")]
    ColumnCountMismatch { expected: usize, got: usize },

    #[error("no column named {0:?}")]
    ColumnNotFound(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error(transparent)]
    Session(PgError),
}

impl DriverError {
    /// Whether the connection that produced this error should be discarded.
    pub fn is_bad_connection(&self) -> bool {
        match self {
            DriverError::NotificationWaitError(_) => true,
            DriverError::Session(e) => matches!(
                e,
                PgError::Io(_) | PgError::Protocol(_) | PgError::ConnectionClosed
            ),
            _ => false,
        }
    }

    /// Wrap a handshake failure the way `Open` reports it.
    pub(crate) fn connection(err: PgError) -> Self {
        let message = match err {
            PgError::Server { message, .. } => message,
            other => other.to_string(),
        };
        DriverError::ConnectionError { message }
    }
}

impl From<PgError> for DriverError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Server { message, code, .. } => DriverError::CommandError {
                message,
                code: (!code.is_empty()).then_some(code),
            },
            other => DriverError::Session(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
