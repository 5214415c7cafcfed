//! The seam between the driver and the wire.
//!
//! [`Session`] is everything the driver needs from a live PostgreSQL
//! connection. [`PgSession`](super::connection::PgSession) implements it over
//! TCP or a Unix socket; tests drive the driver through scripted sessions.

use std::future::Future;
use std::io;
use std::sync::Arc;

use super::error::PgResult;
use super::protocol::{DataRow, FieldDescription};
use super::types::Oid;

/// Callback receiving every server notice, already formatted.
pub type NoticeHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// An asynchronous NOTIFY delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// PID of the notifying backend.
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Outcome of one command: its result columns, materialized rows and tag.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<FieldDescription>,
    pub rows: Vec<DataRow>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    /// The affected-row count carried by the command tag, as text.
    ///
    /// Empty for commands whose tag has no count (`CREATE TABLE`, `LISTEN`,
    /// ...). `INSERT` tags carry an OID before the count.
    pub fn cmd_tuples(&self) -> &str {
        let mut words = self.command_tag.split_whitespace();
        let count = match words.next() {
            Some("INSERT") => words.nth(1),
            Some("UPDATE" | "DELETE" | "SELECT" | "MOVE" | "FETCH" | "COPY" | "MERGE") => {
                words.next()
            }
            _ => None,
        };
        count.unwrap_or("")
    }
}

/// What the server reports about a prepared statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementDescription {
    pub param_types: Vec<Oid>,
    pub columns: Vec<FieldDescription>,
}

/// A connection the driver can issue commands over.
///
/// Commands run strictly one after another; the driver never pipelines.
pub trait Session: Send + Sized {
    /// Open and authenticate a session from a connection string.
    fn connect(
        conninfo: &str,
        notices: Option<NoticeHandler>,
    ) -> impl Future<Output = PgResult<Self>> + Send;

    /// Whether the session may be handed between threads.
    fn is_thread_safe(&self) -> bool {
        true
    }

    /// Run a command with no parameters.
    fn exec(&mut self, sql: &str) -> impl Future<Output = PgResult<QueryResult>> + Send;

    /// Run an unnamed statement with text parameters (`None` is SQL NULL).
    fn exec_params(
        &mut self,
        sql: &str,
        params: &[Option<String>],
    ) -> impl Future<Output = PgResult<QueryResult>> + Send;

    /// Create the server-side prepared statement `name`.
    fn prepare(&mut self, name: &str, sql: &str) -> impl Future<Output = PgResult<()>> + Send;

    fn describe_prepared(
        &mut self,
        name: &str,
    ) -> impl Future<Output = PgResult<StatementDescription>> + Send;

    fn exec_prepared(
        &mut self,
        name: &str,
        params: &[Option<String>],
    ) -> impl Future<Output = PgResult<QueryResult>> + Send;

    /// Resolve once the socket has data to read. May wake spuriously.
    fn wait_readable(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Read whatever input is available without waiting.
    fn consume_input(&mut self) -> PgResult<()>;

    /// Pop the oldest buffered notification.
    fn take_notification(&mut self) -> Option<Notification>;

    /// Say goodbye to the server and drop the connection.
    fn finish(self) -> impl Future<Output = PgResult<()>> + Send;
}
