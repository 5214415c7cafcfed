//! PostgreSQL wire protocol client.
//!
//! This module speaks the v3 frontend/backend protocol in text format:
//! - Arguments and results always travel as text
//! - Statements are prepared under connection-local names
//! - NOTIFY messages are buffered as they arrive, between or during commands
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `config`: Connection string parsing
//! - `scram`: SCRAM-SHA-256 authentication
//! - `session`: The `Session` trait the driver runs on
//! - `connection`: `PgSession`, the socket-backed session
//! - `types`: Text-format value codec
//! - `statement`: Prepared statements, LISTEN channels and the statement cache

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod scram;
pub mod session;
pub mod statement;
pub mod types;

#[cfg(test)]
mod tests;

pub use config::{ConnInfo, SslMode};
pub use connection::PgSession;
pub use error::{PgError, PgResult};
pub use session::{NoticeHandler, Notification, QueryResult, Session, StatementDescription};
pub use statement::{ListenState, ListenStatement, PreparedStatement, Statement};
pub use types::{Oid, ToValue, Value};
