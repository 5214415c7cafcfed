//! Connections and the driver that opens them.
//!
//! A [`Connection`] owns one [`Session`], its prepared-statement cache and
//! the counter naming new statements. Everything runs in call order on the
//! owning task; `&mut self` keeps a connection from being shared without
//! external synchronisation.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{DriverError, Result};
use crate::pg::connection::PgSession;
use crate::pg::session::{NoticeHandler, Notification, QueryResult, Session};
use crate::pg::statement::{ListenStatement, PreparedStatement, Statement, StatementCache};
use crate::pg::types::{encode_argument, ToValue};
use crate::pool::{ArgumentPool, LentBuffer};
use crate::rows::Rows;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Driver
// ============================================================================

/// Connection factory holding settings shared by every connection it opens.
#[derive(Clone, Default)]
pub struct Driver {
    notice_handler: Option<NoticeHandler>,
    pool: Option<ArgumentPool>,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every server notice (`WARNING:  ...`, `NOTICE:  ...`).
    ///
    /// Without a handler notices are logged at debug level.
    pub fn notice_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.notice_handler = Some(Arc::new(handler));
        self
    }

    /// Use `pool` for argument buffers instead of the process-wide one.
    pub fn argument_pool(mut self, pool: ArgumentPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Open a connection described by a libpq-style connection string.
    pub async fn open(&self, conninfo: &str) -> Result<Connection> {
        self.open_with::<PgSession>(conninfo).await
    }

    /// Open a connection over a custom session type.
    pub async fn open_with<S: Session>(&self, conninfo: &str) -> Result<Connection<S>> {
        let session = S::connect(conninfo, self.notice_handler.clone())
            .await
            .map_err(DriverError::connection)?;
        Connection::from_session(session, self.pool())
    }

    fn pool(&self) -> ArgumentPool {
        self.pool
            .clone()
            .unwrap_or_else(|| ArgumentPool::global().clone())
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("notice_handler", &self.notice_handler.is_some())
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

// ============================================================================
// Exec result
// ============================================================================

/// Outcome of a command that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    rows_affected: i64,
}

impl ExecResult {
    /// Commands whose tag carries no count affected zero rows.
    pub(crate) fn from_result(result: &QueryResult) -> Result<Self> {
        let count = result.cmd_tuples();
        if count.is_empty() {
            return Ok(Self { rows_affected: 0 });
        }
        let rows_affected = count.parse().map_err(|_| {
            DriverError::Decode(format!(
                "invalid row count in command tag {:?}",
                result.command_tag
            ))
        })?;
        Ok(Self { rows_affected })
    }

    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    /// PostgreSQL has no last-insert id; use `INSERT ... RETURNING` instead.
    pub fn last_insert_id(&self) -> Result<i64> {
        Err(DriverError::LastInsertIdUnsupported)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A database connection.
pub struct Connection<S: Session = PgSession> {
    id: u64,
    session: S,
    statements: StatementCache,
    pool: ArgumentPool,
}

impl<S: Session> Connection<S> {
    /// Wrap an established session.
    pub fn from_session(session: S, pool: ArgumentPool) -> Result<Self> {
        if !session.is_thread_safe() {
            return Err(DriverError::ThreadSafetyUnavailable);
        }
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(conn = id, "connection opened");
        Ok(Self {
            id,
            session,
            statements: StatementCache::new(),
            pool,
        })
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Number of statements prepared on this connection.
    pub fn prepared_count(&self) -> usize {
        self.statements.len()
    }

    /// Prepare `query`, or return the statement already prepared for it.
    ///
    /// A query starting with `LISTEN` subscribes immediately and returns a
    /// notification channel instead; those are never cached.
    pub async fn prepare(&mut self, query: &str) -> Result<Statement> {
        if is_listen(query) {
            self.simple(query).await?;
            debug!(conn = self.id, query, "listening");
            return Ok(Statement::Listen(ListenStatement::new(
                self.id,
                query.to_string(),
            )));
        }

        if let Some(statement) = self.statements.get(query) {
            return Ok(Statement::Prepared(statement));
        }

        let name = self.statements.next_statement_name();
        self.session.prepare(&name, query).await?;
        let description = self.session.describe_prepared(&name).await?;
        debug!(
            conn = self.id,
            statement = %name,
            params = description.param_types.len(),
            "statement prepared"
        );

        let statement = Arc::new(PreparedStatement {
            conn_id: self.id,
            name,
            query: query.to_string(),
            param_types: description.param_types,
        });
        self.statements.insert(Arc::clone(&statement));
        Ok(Statement::Prepared(statement))
    }

    /// Run a command for its row count.
    ///
    /// Without arguments the query goes out as a simple query, so several
    /// `;`-separated commands are allowed.
    pub async fn exec(
        &mut self,
        query: &str,
        args: &[&(dyn ToValue + Sync)],
    ) -> Result<ExecResult> {
        let result = if args.is_empty() {
            self.simple(query).await?
        } else {
            let buffer = self.bind(args).await?;
            self.session.exec_params(query, buffer.slots()).await?
        };
        ExecResult::from_result(&result)
    }

    /// Prepare, run and close in one call.
    ///
    /// When both the query and the close fail, the query's error is returned.
    pub async fn query(&mut self, query: &str, args: &[&(dyn ToValue + Sync)]) -> Result<Rows> {
        let mut statement = self.prepare(query).await?;
        let rows = statement.query(self, args).await;
        if let Err(e) = statement.close(self).await {
            if rows.is_ok() {
                return Err(e);
            }
            warn!(conn = self.id, error = %e, "closing statement after a failed query");
        }
        rows
    }

    /// Start a transaction.
    pub async fn begin(&mut self) -> Result<Transaction<'_, S>> {
        self.simple("BEGIN").await?;
        Ok(Transaction {
            conn: self,
            finished: false,
        })
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.simple("COMMIT").await.map(drop)
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.simple("ROLLBACK").await.map(drop)
    }

    /// Block until a notification arrives on any channel this connection
    /// listens on.
    ///
    /// Notifications that arrived while other commands ran are returned first.
    /// Dropping the returned future abandons the wait and leaves the
    /// connection usable.
    pub async fn wait_for_notification(&mut self) -> Result<Notification> {
        loop {
            if let Some(notification) = self.session.take_notification() {
                debug!(
                    conn = self.id,
                    channel = %notification.channel,
                    from = notification.process_id,
                    "notification received"
                );
                return Ok(notification);
            }
            self.session
                .wait_readable()
                .await
                .map_err(|e| DriverError::NotificationWaitError(e.to_string()))?;
            self.session
                .consume_input()
                .map_err(|e| DriverError::NotificationWaitError(e.to_string()))?;
        }
    }

    /// Close the connection, releasing every prepared statement with it.
    pub async fn close(mut self) -> Result<()> {
        let released = self.statements.drain();
        debug!(
            conn = self.id,
            statements = released.len(),
            "closing connection"
        );
        self.session.finish().await?;
        Ok(())
    }

    pub(crate) async fn simple(&mut self, query: &str) -> Result<QueryResult> {
        Ok(self.session.exec(query).await?)
    }

    pub(crate) async fn run_prepared(
        &mut self,
        statement: &PreparedStatement,
        args: &[&(dyn ToValue + Sync)],
    ) -> Result<QueryResult> {
        let buffer = self.bind(args).await?;
        Ok(self
            .session
            .exec_prepared(&statement.name, buffer.slots())
            .await?)
    }

    /// Encode `args` into a pooled buffer.
    async fn bind(&self, args: &[&(dyn ToValue + Sync)]) -> Result<LentBuffer> {
        let mut buffer = self.pool.lend(args.len()).await;
        for (i, arg) in args.iter().enumerate() {
            let value = arg.to_value()?;
            buffer.set(i, encode_argument(&value)?);
        }
        Ok(buffer)
    }
}

impl<S: Session> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("prepared", &self.statements.len())
            .finish()
    }
}

fn is_listen(query: &str) -> bool {
    query
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("LISTEN"))
}

// ============================================================================
// Transaction
// ============================================================================

/// An open transaction. Derefs to the connection it runs on.
///
/// Dropping it without `commit` or `rollback` leaves the transaction open on
/// the server.
pub struct Transaction<'a, S: Session = PgSession> {
    conn: &'a mut Connection<S>,
    finished: bool,
}

impl<S: Session> Transaction<'_, S> {
    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.conn.commit().await
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.rollback().await
    }
}

impl<S: Session> Deref for Transaction<'_, S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Connection<S> {
        self.conn
    }
}

impl<S: Session> DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut Connection<S> {
        self.conn
    }
}

impl<S: Session> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(conn = self.conn.id, "transaction dropped without commit or rollback");
        }
    }
}
