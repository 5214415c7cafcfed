//! Prepared statements, LISTEN channels and the per-connection statement cache.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side prepared statement
//! - `ListenStatement`: a LISTEN channel handed out by `prepare("LISTEN ...")`
//! - `Statement`: what `Connection::prepare` returns, one of the two above
//! - `StatementCache`: query text to prepared statement, for the connection's lifetime

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::session::Session;
use super::types::{Oid, ToValue};
use crate::driver::{Connection, ExecResult};
use crate::error::{DriverError, Result};
use crate::rows::Rows;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement prepared on the server under a connection-local name.
///
/// Shared as `Arc` between the cache and callers; the server-side name is
/// only released when the owning connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub(crate) conn_id: u64,
    /// Server-side name ("0", "1", ...)
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
}

impl PreparedStatement {
    /// Number of parameters the server expects.
    pub fn num_input(&self) -> usize {
        self.param_types.len()
    }
}

// ============================================================================
// LISTEN channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Listening,
    AwaitingNotification,
    Closed,
}

/// A subscription created by preparing a `LISTEN` command.
///
/// Each `query` blocks until one notification arrives and yields its payload
/// as a single-row cursor. Closing issues the matching `UNLISTEN`.
#[derive(Debug)]
pub struct ListenStatement {
    conn_id: u64,
    query: String,
    state: ListenState,
}

impl ListenStatement {
    pub(crate) fn new(conn_id: u64, query: String) -> Self {
        Self {
            conn_id,
            query,
            state: ListenState::Listening,
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }

    pub fn state(&self) -> ListenState {
        self.state
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ListenState::Closed {
            return Err(DriverError::StatementClosed);
        }
        Ok(())
    }

    /// `LISTEN chan` becomes `UNLISTEN chan`, keeping the caller's spelling.
    fn unlisten_query(&self) -> String {
        format!("UN{}", self.query.trim_start())
    }
}

/// Marks a channel as waiting; the state returns to `Listening` when the
/// wait completes, fails or its future is dropped.
struct AwaitingNotification<'a> {
    state: &'a mut ListenState,
}

impl<'a> AwaitingNotification<'a> {
    fn enter(state: &'a mut ListenState) -> Self {
        *state = ListenState::AwaitingNotification;
        Self { state }
    }
}

impl Drop for AwaitingNotification<'_> {
    fn drop(&mut self) {
        *self.state = ListenState::Listening;
    }
}

// ============================================================================
// Statement
// ============================================================================

/// What `Connection::prepare` hands back.
#[derive(Debug)]
pub enum Statement {
    Prepared(Arc<PreparedStatement>),
    Listen(ListenStatement),
}

impl Statement {
    fn conn_id(&self) -> u64 {
        match self {
            Statement::Prepared(stmt) => stmt.conn_id,
            Statement::Listen(listen) => listen.conn_id,
        }
    }

    fn check_owner<S: Session>(&self, conn: &Connection<S>) -> Result<()> {
        if self.conn_id() != conn.id() {
            return Err(DriverError::ForeignStatement);
        }
        Ok(())
    }

    /// Declared parameter count; always zero for a LISTEN channel.
    pub fn num_input(&self) -> usize {
        match self {
            Statement::Prepared(stmt) => stmt.num_input(),
            Statement::Listen(_) => 0,
        }
    }

    /// Run the statement for its row count.
    pub async fn exec<S: Session>(
        &self,
        conn: &mut Connection<S>,
        args: &[&(dyn ToValue + Sync)],
    ) -> Result<ExecResult> {
        self.check_owner(conn)?;
        match self {
            Statement::Prepared(stmt) => {
                let result = conn.run_prepared(stmt, args).await?;
                ExecResult::from_result(&result)
            }
            Statement::Listen(_) => Err(DriverError::ExecNotSupportedForListen),
        }
    }

    /// Run the statement and return its rows.
    ///
    /// On a LISTEN channel this waits for the next notification.
    pub async fn query<S: Session>(
        &mut self,
        conn: &mut Connection<S>,
        args: &[&(dyn ToValue + Sync)],
    ) -> Result<Rows> {
        self.check_owner(conn)?;
        match self {
            Statement::Prepared(stmt) => {
                let result = conn.run_prepared(stmt, args).await?;
                Ok(Rows::from_result(result))
            }
            Statement::Listen(listen) => {
                listen.ensure_open()?;
                let _awaiting = AwaitingNotification::enter(&mut listen.state);
                let notification = conn.wait_for_notification().await?;
                Ok(Rows::notification(notification.payload))
            }
        }
    }

    /// Close the statement.
    ///
    /// Prepared statements stay on the server until the connection closes, so
    /// this only matters for LISTEN channels, which unsubscribe.
    pub async fn close<S: Session>(&mut self, conn: &mut Connection<S>) -> Result<()> {
        let Statement::Listen(listen) = self else {
            return Ok(());
        };
        listen.ensure_open()?;
        if listen.conn_id != conn.id() {
            return Err(DriverError::ForeignStatement);
        }
        conn.simple(&listen.unlisten_query()).await?;
        listen.state = ListenState::Closed;
        debug!(conn = conn.id(), query = %listen.query, "stopped listening");
        Ok(())
    }
}

// ============================================================================
// Statement Cache
// ============================================================================

/// Prepared statements of one connection, keyed by query text.
///
/// Entries are never evicted: a name stays valid on the server for as long as
/// the connection lives.
#[derive(Debug, Default)]
pub struct StatementCache {
    statements: HashMap<String, Arc<PreparedStatement>>,
    next_id: u64,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.get(query).cloned()
    }

    pub fn insert(&mut self, statement: Arc<PreparedStatement>) {
        self.statements.insert(statement.query.clone(), statement);
    }

    /// The next unused statement name: "0", "1", "2", ...
    pub fn next_statement_name(&mut self) -> String {
        let name = self.next_id.to_string();
        self.next_id += 1;
        name
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Remove every entry, returning the released statement names.
    pub fn drain(&mut self) -> Vec<String> {
        self.statements
            .drain()
            .map(|(_, statement)| statement.name.clone())
            .collect()
    }
}
