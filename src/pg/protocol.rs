//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the subset of the PostgreSQL v3 protocol the driver
//! speaks: startup/authentication, the simple query cycle and the extended
//! query cycle with text-format parameters and results.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Write a tagged message, back-filling the length once the body is known.
fn tagged(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start.
///
/// `params` are sent verbatim as startup parameters (`user`, `database`,
/// `application_name`, ...).
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub params: &'a [(&'a str, &'a str)],
}

impl FrontendMessage for StartupMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);
        for (key, value) in self.params {
            put_cstr(&mut buf, key);
            put_cstr(&mut buf, value);
        }
        buf.put_u8(0);

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendMessage for PasswordMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| put_cstr(buf, self.password))
    }
}

/// SASLInitialResponse ('p') - first SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| {
            put_cstr(buf, self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(self.data);
        })
    }
}

/// SASLResponse ('p') - subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'p', |buf| buf.put_slice(self.data))
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'Q', |buf| put_cstr(buf, self.query))
    }
}

/// Parse message ('P') - creates a prepared statement.
///
/// No parameter types are sent; the server infers them.
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'P', |buf| {
            put_cstr(buf, self.name);
            put_cstr(buf, self.query);
            buf.put_i16(0);
        })
    }
}

/// Bind message ('B') - binds text parameters to a prepared statement.
///
/// Zero format codes are sent for both parameters and results, which means
/// text format throughout. A `None` slot is bound as SQL NULL.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Option<String>],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'B', |buf| {
            put_cstr(buf, self.portal);
            put_cstr(buf, self.statement);
            buf.put_i16(0);
            buf.put_i16(self.params.len() as i16);
            for param in self.params {
                match param {
                    Some(text) => {
                        buf.put_i32(text.len() as i32);
                        buf.put_slice(text.as_bytes());
                    }
                    None => buf.put_i32(-1),
                }
            }
            buf.put_i16(0);
        })
    }
}

/// Execute message ('E') - executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'E', |buf| {
            put_cstr(buf, self.portal);
            buf.put_i32(self.max_rows);
        })
    }
}

/// Which kind of object a Describe refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Describe message ('D')
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    pub target: Target,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'D', |buf| {
            buf.put_u8(self.target.code());
            put_cstr(buf, self.name);
        })
    }
}

/// Sync message ('S') - marks the end of an extended query cycle
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'S', |_| {})
    }
}

/// CopyFail message ('f') - abort a COPY FROM STDIN the driver cannot feed
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub reason: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'f', |buf| put_cstr(buf, self.reason))
    }
}

/// Terminate message ('X') - close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'X', |_| {})
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary. The driver only ever asks for text.
    pub format: i16,
}

/// Cells of one DataRow; `None` is SQL NULL.
pub type DataRow = SmallVec<[Option<Bytes>; 8]>;

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: DataRow },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    // Asynchronous
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },

    // COPY is not supported; the messages are recognised so they can be refused.
    CopyInResponse,
    CopyOutResponse,
    CopyData,
    CopyDone,
}

impl BackendMessage {
    /// Length of the first complete frame in `buf`, if there is one.
    pub fn frame_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < 5 {
            return None;
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let total = 1 + len.max(4) as usize;
        (buf.len() >= total).then_some(total)
    }

    /// Decode one complete frame (type byte, length, body).
    pub fn decode(mut frame: Bytes) -> PgResult<Self> {
        if frame.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = frame.get_u8();
        let len = frame.get_i32();
        if len < 4 || frame.remaining() < (len - 4) as usize {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }
        let body = frame.split_to((len - 4) as usize);

        let mut reader = Reader { buf: body };
        let msg = match msg_type {
            b'R' => reader.auth()?,
            b'T' => reader.row_description()?,
            b'D' => reader.data_row()?,
            b'C' => BackendMessage::CommandComplete {
                tag: reader.cstr()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from(reader.u8()?),
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: reader.fields()?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: reader.fields()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: reader.cstr()?,
                value: reader.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: reader.i32()?,
                secret_key: reader.i32()?,
            },
            b't' => {
                let count = reader.i16()?.max(0) as usize;
                let mut type_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    type_oids.push(Oid::from_i32(reader.i32()?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: reader.i32()?,
                channel: reader.cstr()?,
                payload: reader.cstr()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b'G' => BackendMessage::CopyInResponse,
            b'H' => BackendMessage::CopyOutResponse,
            b'd' => BackendMessage::CopyData,
            b'c' => BackendMessage::CopyDone,
            _ => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {}",
                    msg_type as char
                )))
            }
        };
        Ok(msg)
    }
}

/// Bounds-checked cursor over a message body.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Protocol("Message body too short".to_string()));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// Read a null-terminated string.
    fn cstr(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

        let s = match std::str::from_utf8(&self.buf[..end]) {
            Ok(s) => s.to_owned(),
            Err(_) => String::from_utf8_lossy(&self.buf[..end]).into_owned(),
        };
        self.buf.advance(end + 1);
        Ok(s)
    }

    fn auth(&mut self) -> PgResult<BackendMessage> {
        let msg = match self.i32()? {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                self.need(4)?;
                let mut salt = [0u8; 4];
                self.buf.copy_to_slice(&mut salt);
                BackendMessage::AuthenticationMD5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while self.buf.has_remaining() {
                    let mech = self.cstr()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                BackendMessage::AuthenticationSASL { mechanisms }
            }
            11 => BackendMessage::AuthenticationSASLContinue {
                data: self.buf.split_off(0),
            },
            12 => BackendMessage::AuthenticationSASLFinal {
                data: self.buf.split_off(0),
            },
            other => {
                return Err(PgError::Auth(format!(
                    "Unsupported authentication method: {}",
                    other
                )))
            }
        };
        Ok(msg)
    }

    fn row_description(&mut self) -> PgResult<BackendMessage> {
        let count = self.i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldDescription {
                name: self.cstr()?,
                table_oid: self.i32()?,
                column_attr: self.i16()?,
                type_oid: Oid::from_i32(self.i32()?),
                type_size: self.i16()?,
                type_modifier: self.i32()?,
                format: self.i16()?,
            });
        }
        Ok(BackendMessage::RowDescription { fields })
    }

    fn data_row(&mut self) -> PgResult<BackendMessage> {
        let count = self.i16()?.max(0) as usize;
        let mut values = DataRow::with_capacity(count);
        for _ in 0..count {
            let len = self.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                self.need(len as usize)?;
                values.push(Some(self.buf.split_to(len as usize)));
            }
        }
        Ok(BackendMessage::DataRow { values })
    }

    /// Error/notice response fields
    fn fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        while self.buf.has_remaining() {
            let code = self.u8()?;
            if code == 0 {
                break;
            }
            fields.insert(code, self.cstr()?);
        }
        Ok(fields)
    }
}

/// Render notice fields the way libpq's default notice processor does.
pub fn format_notice(fields: &HashMap<u8, String>) -> String {
    let severity = fields
        .get(&b'V')
        .or_else(|| fields.get(&b'S'))
        .map(String::as_str)
        .unwrap_or("NOTICE");
    let message = fields.get(&b'M').map(String::as_str).unwrap_or("");
    let mut out = format!("{}:  {}", severity, message);
    if let Some(detail) = fields.get(&b'D') {
        out.push_str("\nDETAIL:  ");
        out.push_str(detail);
    }
    if let Some(hint) = fields.get(&b'H') {
        out.push_str("\nHINT:  ");
        out.push_str(hint);
    }
    out
}
