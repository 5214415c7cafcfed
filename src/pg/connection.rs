//! PostgreSQL session over TCP or a Unix socket.
//!
//! This module provides the [`Session`] implementation that handles:
//! - Socket connection establishment
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Simple and extended query cycles in text format
//! - Buffering of asynchronous notifications and notices

use std::collections::{HashMap, VecDeque};
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, trace};

use super::config::ConnInfo;
use super::error::{PgError, PgResult};
use super::protocol::*;
use super::scram::{self, ScramExchange};
use super::session::{NoticeHandler, Notification, QueryResult, Session, StatementDescription};
use super::types::Oid;

// ============================================================================
// Transport
// ============================================================================

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    async fn connect(info: &ConnInfo) -> PgResult<Self> {
        #[cfg(unix)]
        if let Some(path) = info.socket_path() {
            let stream = UnixStream::connect(&path).await?;
            return Ok(Stream::Unix(stream));
        }

        let stream = TcpStream::connect((info.host.as_str(), info.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Stream::Tcp(stream))
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read_buf(buf).await,
            #[cfg(unix)]
            Stream::Unix(s) => s.read_buf(buf).await,
        }
    }

    fn try_read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read_buf(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_read_buf(buf),
        }
    }

    async fn readable(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.readable().await,
            #[cfg(unix)]
            Stream::Unix(s) => s.readable().await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown().await,
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown().await,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Everything a round trip can hand back.
#[derive(Default)]
struct Reply {
    result: QueryResult,
    param_types: Vec<Oid>,
}

/// A live PostgreSQL session.
pub struct PgSession {
    stream: Stream,
    /// Bytes received but not yet decoded
    read_buffer: BytesMut,
    /// Messages queued for the next flush
    write_buffer: BytesMut,
    /// Notifications received and not yet taken
    notifications: VecDeque<Notification>,
    notice_handler: Option<NoticeHandler>,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    transaction_status: TransactionStatus,
    backend_pid: i32,
    closed: bool,
}

impl PgSession {
    /// Connect using already parsed parameters.
    pub async fn connect_with(info: ConnInfo, notices: Option<NoticeHandler>) -> PgResult<Self> {
        if info.sslmode.requires_tls() {
            return Err(PgError::Config(format!(
                "sslmode {:?} requires TLS, which this driver does not support",
                info.sslmode
            )));
        }

        let establish = Self::establish(&info, notices);
        match info.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, establish)
                .await
                .map_err(|_| PgError::Timeout)?,
            None => establish.await,
        }
    }

    async fn establish(info: &ConnInfo, notices: Option<NoticeHandler>) -> PgResult<Self> {
        let stream = Stream::connect(info).await?;
        let mut session = Self {
            stream,
            read_buffer: BytesMut::with_capacity(16 * 1024),
            write_buffer: BytesMut::with_capacity(1024),
            notifications: VecDeque::new(),
            notice_handler: notices,
            parameters: HashMap::new(),
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            closed: false,
        };
        session.startup(info).await?;
        debug!(
            host = %info.host,
            port = info.port,
            dbname = %info.dbname,
            backend_pid = session.backend_pid,
            "session established"
        );
        Ok(session)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self, info: &ConnInfo) -> PgResult<()> {
        let mut params: Vec<(&str, &str)> = vec![
            ("user", info.user.as_str()),
            ("database", info.dbname.as_str()),
            ("client_encoding", "UTF8"),
        ];
        if let Some(name) = &info.application_name {
            params.push(("application_name", name.as_str()));
        }
        if let Some(options) = &info.options {
            params.push(("options", options.as_str()));
        }
        self.queue(&StartupMessage { params: &params });
        self.flush().await?;

        let mut sasl: Option<ScramExchange> = None;
        loop {
            match self.recv().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = password(info)?;
                    self.queue(&PasswordMessage { password });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let hash = md5_password(&info.user, password(info)?, &salt);
                    self.queue(&PasswordMessage { password: &hash });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let exchange = ScramExchange::new(&info.user, password(info)?);
                    self.queue(&SaslInitialResponseMessage {
                        mechanism: scram::MECHANISM,
                        data: &exchange.initial(),
                    });
                    self.flush().await?;
                    sasl = Some(exchange);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let exchange = sasl.as_mut().ok_or_else(|| {
                        PgError::Protocol("SASL continue without SASL start".to_string())
                    })?;
                    let response = exchange.respond(&data)?;
                    self.queue(&SaslResponseMessage { data: &response });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    sasl.as_mut()
                        .ok_or_else(|| {
                            PgError::Protocol("SASL final without SASL start".to_string())
                        })?
                        .finish(&data)?;
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected message during startup: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Backend process ID.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// A server parameter reported via ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn queue<M: FrontendMessage>(&mut self, msg: &M) {
        self.write_buffer.extend_from_slice(&msg.encode());
    }

    async fn flush(&mut self) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        let pending = self.write_buffer.split();
        self.stream.write_all(&pending).await?;
        Ok(())
    }

    /// Decode the next complete message already in the read buffer.
    fn next_buffered(&mut self) -> PgResult<Option<BackendMessage>> {
        match BackendMessage::frame_len(&self.read_buffer) {
            Some(len) => {
                let frame = self.read_buffer.split_to(len).freeze();
                BackendMessage::decode(frame).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Receive the next synchronous message, setting aside asynchronous ones.
    async fn recv(&mut self) -> PgResult<BackendMessage> {
        loop {
            while let Some(msg) = self.next_buffered()? {
                if let Some(msg) = self.intercept(msg) {
                    return Ok(msg);
                }
            }

            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                self.closed = true;
                return Err(PgError::ConnectionClosed);
            }
        }
    }

    /// Swallow messages the server may send at any time.
    fn intercept(&mut self, msg: BackendMessage) -> Option<BackendMessage> {
        match msg {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                trace!(%channel, process_id, "notification buffered");
                self.notifications.push_back(Notification {
                    process_id,
                    channel,
                    payload,
                });
                None
            }
            BackendMessage::NoticeResponse { fields } => {
                let notice = format_notice(&fields);
                match &self.notice_handler {
                    Some(handler) => handler(&notice),
                    None => debug!(%notice, "server notice"),
                }
                None
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
                None
            }
            other => Some(other),
        }
    }

    /// Handle whatever complete messages are already buffered.
    fn drain_buffered(&mut self) -> PgResult<()> {
        while let Some(msg) = self.next_buffered()? {
            if let Some(msg) = self.intercept(msg) {
                trace!(?msg, "dropping unsolicited message");
            }
        }
        Ok(())
    }

    /// Flush queued messages and collect the reply up to ReadyForQuery.
    async fn round_trip(&mut self) -> PgResult<Reply> {
        self.flush().await?;

        let mut reply = Reply::default();
        let mut error = None;
        loop {
            match self.recv().await? {
                BackendMessage::RowDescription { fields } => {
                    reply.result.columns = fields;
                    reply.result.rows.clear();
                }
                BackendMessage::DataRow { values } => reply.result.rows.push(values),
                BackendMessage::CommandComplete { tag } => reply.result.command_tag = tag,
                BackendMessage::ParameterDescription { type_oids } => {
                    reply.param_types = type_oids
                }
                BackendMessage::ErrorResponse { fields } => {
                    error.get_or_insert_with(|| PgError::from_fields(&fields));
                }
                BackendMessage::CopyInResponse => {
                    self.queue(&CopyFailMessage {
                        reason: "COPY FROM STDIN is not supported",
                    });
                    self.flush().await?;
                }
                BackendMessage::CopyOutResponse => {
                    error.get_or_insert_with(|| {
                        PgError::Protocol("COPY TO STDOUT is not supported".to_string())
                    });
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    // Anything that arrived in the same read (typically a
                    // NOTIFY committed by this very command) is handled now,
                    // so a later wait does not block on data already read.
                    self.drain_buffered()?;
                    return match error {
                        Some(e) => Err(e),
                        None => Ok(reply),
                    };
                }
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::CloseComplete
                | BackendMessage::NoData
                | BackendMessage::EmptyQueryResponse
                | BackendMessage::PortalSuspended
                | BackendMessage::CopyData
                | BackendMessage::CopyDone => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected message: {:?}",
                        other
                    )))
                }
            }
        }
    }

    fn queue_execute(&mut self, statement: &str, params: &[Option<String>]) {
        self.queue(&BindMessage {
            portal: "",
            statement,
            params,
        });
        self.queue(&DescribeMessage {
            target: Target::Portal,
            name: "",
        });
        self.queue(&ExecuteMessage {
            portal: "",
            max_rows: 0,
        });
        self.queue(&SyncMessage);
    }
}

impl Session for PgSession {
    async fn connect(conninfo: &str, notices: Option<NoticeHandler>) -> PgResult<Self> {
        let info = ConnInfo::parse(conninfo)?;
        Self::connect_with(info, notices).await
    }

    async fn exec(&mut self, sql: &str) -> PgResult<QueryResult> {
        trace!(sql, "simple query");
        self.queue(&QueryMessage { query: sql });
        Ok(self.round_trip().await?.result)
    }

    async fn exec_params(&mut self, sql: &str, params: &[Option<String>]) -> PgResult<QueryResult> {
        trace!(sql, params = params.len(), "extended query");
        self.queue(&ParseMessage {
            name: "",
            query: sql,
        });
        self.queue_execute("", params);
        Ok(self.round_trip().await?.result)
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> PgResult<()> {
        trace!(name, sql, "prepare");
        self.queue(&ParseMessage { name, query: sql });
        self.queue(&SyncMessage);
        self.round_trip().await?;
        Ok(())
    }

    async fn describe_prepared(&mut self, name: &str) -> PgResult<StatementDescription> {
        self.queue(&DescribeMessage {
            target: Target::Statement,
            name,
        });
        self.queue(&SyncMessage);
        let reply = self.round_trip().await?;
        Ok(StatementDescription {
            param_types: reply.param_types,
            columns: reply.result.columns,
        })
    }

    async fn exec_prepared(
        &mut self,
        name: &str,
        params: &[Option<String>],
    ) -> PgResult<QueryResult> {
        trace!(name, params = params.len(), "execute prepared");
        self.queue_execute(name, params);
        Ok(self.round_trip().await?.result)
    }

    async fn wait_readable(&mut self) -> io::Result<()> {
        self.stream.readable().await
    }

    fn consume_input(&mut self) -> PgResult<()> {
        loop {
            match self.stream.try_read_buf(&mut self.read_buffer) {
                Ok(0) => {
                    self.closed = true;
                    return Err(PgError::ConnectionClosed);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(PgError::Io(e)),
            }
        }
        self.drain_buffered()
    }

    fn take_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    async fn finish(mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.queue(&TerminateMessage);
        self.flush().await?;
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn password(info: &ConnInfo) -> PgResult<&str> {
    info.password
        .as_deref()
        .ok_or_else(|| PgError::Auth("Password required".to_string()))
}

/// `"md5" + md5(md5(password + user) + salt)`, hex encoded.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_password_shape() {
        let hash = md5_password("postgres", "secret", &[0x01, 0x02, 0x03, 0x04]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);
        assert_eq!(hash, md5_password("postgres", "secret", &[0x01, 0x02, 0x03, 0x04]));
        assert_ne!(hash, md5_password("postgres", "secret", &[0x04, 0x03, 0x02, 0x01]));
    }

    #[test]
    fn tls_modes_are_refused_before_connecting() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let info = ConnInfo::parse_with_env("user=u sslmode=require", |_| None).unwrap();
        let err = rt.block_on(PgSession::connect_with(info, None));
        assert!(matches!(err, Err(PgError::Config(_))));
    }
}
