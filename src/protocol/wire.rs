//! PostgreSQL Wire Protocol Messages
//!
//! The subset of the Frontend/Backend Protocol (v3.0) this client speaks.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::fmt;

use bytes::Bytes;

use super::framing::Frame;
use super::reader::MessageReader;
use crate::error::{PgError, PgResult};

/// Protocol version 3.0 (major in the high 16 bits).
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Authentication request codes carried in 'R' frames.
pub mod auth_code {
    pub const OK: i32 = 0;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Frontend (client → server) message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Startup message (sent first, no type byte)
    Startup { params: Vec<(String, String)> },
    /// SASL initial response (first message in SCRAM)
    SaslInitialResponse { mechanism: String, data: Vec<u8> },
    /// SASL response (subsequent messages in SCRAM)
    SaslResponse(Vec<u8>),
    /// Simple query
    Query(String),
    Terminate,
}

/// Backend (server → client) message types, one variant per consumed tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// 'R'
    Authentication(AuthRequest),
    /// 'E'
    ErrorResponse(ErrorFields),
    /// 'N'
    NoticeResponse(ErrorFields),
    /// 'S'
    ParameterStatus { name: String, value: String },
    /// 'K'
    BackendKeyData { process_id: i32, secret_key: i32 },
    /// 'Z'
    ReadyForQuery(TransactionStatus),
    /// 'T'
    RowDescription(Vec<FieldDescription>),
    /// 'D'
    DataRow(Vec<Option<Bytes>>),
    /// 'C'
    CommandComplete(String),
    /// 'I'
    EmptyQueryResponse,
    /// Any tag this client does not consume.
    Unknown(u8),
}

/// Payload of an 'R' frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    /// Mechanisms offered by the server.
    Sasl(Vec<String>),
    /// server-first-message
    SaslContinue(Vec<u8>),
    /// server-final-message
    SaslFinal(Vec<u8>),
    /// Cleartext, MD5, GSS, ... - not spoken by this client.
    Unsupported(i32),
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    #[default]
    Idle, // 'I'
    InBlock, // 'T'
    Failed,  // 'E'
}

impl TransactionStatus {
    pub fn as_char(self) -> char {
        match self {
            TransactionStatus::Idle => 'I',
            TransactionStatus::InBlock => 'T',
            TransactionStatus::Failed => 'E',
        }
    }
}

/// Field description in RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Fields of an ErrorResponse or NoticeResponse, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub fields: Vec<(u8, String)>,
}

impl ErrorFields {
    pub fn get(&self, field_type: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == field_type)
            .map(|(_, v)| v.as_str())
    }

    /// Localized severity, falling back to the non-localized 'V' field.
    pub fn severity(&self) -> &str {
        self.get(b'S').or_else(|| self.get(b'V')).unwrap_or("ERROR")
    }

    /// SQLSTATE code
    pub fn code(&self) -> Option<&str> {
        self.get(b'C')
    }

    pub fn message(&self) -> &str {
        self.get(b'M').unwrap_or("")
    }

    pub fn detail(&self) -> Option<&str> {
        self.get(b'D')
    }

    pub fn hint(&self) -> Option<&str> {
        self.get(b'H')
    }
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())?;
        if let Some(code) = self.code() {
            write!(f, " (SQLSTATE {})", code)?;
        }
        Ok(())
    }
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Tag + length (covering itself) + content.
fn tagged(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + content.len());
    buf.push(tag);
    buf.extend_from_slice(&((content.len() + 4) as i32).to_be_bytes());
    buf.extend_from_slice(content);
    buf
}

impl FrontendMessage {
    /// Build a startup message with the `user` and `database` parameters.
    pub fn startup(user: &str, database: &str) -> Self {
        FrontendMessage::Startup {
            params: vec![
                ("user".to_string(), user.to_string()),
                ("database".to_string(), database.to_string()),
            ],
        }
    }

    /// Encode message to bytes for sending over the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            FrontendMessage::Startup { params } => {
                let mut body = Vec::new();
                body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
                for (key, value) in params {
                    put_cstr(&mut body, key);
                    put_cstr(&mut body, value);
                }
                body.push(0); // Terminator

                // Prepend length (includes length itself)
                let mut buf = ((body.len() + 4) as i32).to_be_bytes().to_vec();
                buf.extend(body);
                buf
            }
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                let mut content = Vec::with_capacity(mechanism.len() + 5 + data.len());
                put_cstr(&mut content, mechanism);
                content.extend_from_slice(&(data.len() as i32).to_be_bytes());
                content.extend_from_slice(data);
                tagged(b'p', &content)
            }
            FrontendMessage::SaslResponse(data) => tagged(b'p', data),
            FrontendMessage::Query(sql) => {
                let mut content = Vec::with_capacity(sql.len() + 1);
                put_cstr(&mut content, sql);
                tagged(b'Q', &content)
            }
            FrontendMessage::Terminate => tagged(b'X', &[]),
        }
    }
}

impl BackendMessage {
    /// Decode the payload of a complete frame.
    pub fn decode(frame: &Frame) -> PgResult<Self> {
        let mut r = MessageReader::new(frame.tag, &frame.payload);
        let message = match frame.tag {
            b'R' => BackendMessage::Authentication(Self::decode_auth(&mut r)?),
            b'E' => BackendMessage::ErrorResponse(Self::parse_error_fields(&mut r)?),
            b'N' => BackendMessage::NoticeResponse(Self::parse_error_fields(&mut r)?),
            b'S' => BackendMessage::ParameterStatus {
                name: r.read_cstr()?,
                value: r.read_cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: r.read_i32()?,
                secret_key: r.read_i32()?,
            },
            b'Z' => BackendMessage::ReadyForQuery(match r.read_u8()? {
                b'I' => TransactionStatus::Idle,
                b'T' => TransactionStatus::InBlock,
                b'E' => TransactionStatus::Failed,
                other => {
                    return Err(PgError::decode(
                        b'Z',
                        format!("unknown transaction status '{}'", other as char),
                    ));
                }
            }),
            b'T' => BackendMessage::RowDescription(Self::decode_row_description(&mut r)?),
            b'D' => BackendMessage::DataRow(Self::decode_data_row(frame)?),
            b'C' => BackendMessage::CommandComplete(Self::decode_command_complete(&mut r)),
            b'I' => BackendMessage::EmptyQueryResponse,
            other => BackendMessage::Unknown(other),
        };
        Ok(message)
    }

    fn decode_auth(r: &mut MessageReader<'_>) -> PgResult<AuthRequest> {
        let code = r.read_i32()?;
        let request = match code {
            auth_code::OK => AuthRequest::Ok,
            auth_code::SASL => {
                // Null-terminated names, list ends with an empty name.
                let mut mechanisms = Vec::new();
                while !r.is_empty() {
                    let name = r.read_cstr()?;
                    if name.is_empty() {
                        break;
                    }
                    mechanisms.push(name);
                }
                AuthRequest::Sasl(mechanisms)
            }
            auth_code::SASL_CONTINUE => AuthRequest::SaslContinue(r.rest().to_vec()),
            auth_code::SASL_FINAL => AuthRequest::SaslFinal(r.rest().to_vec()),
            other => AuthRequest::Unsupported(other),
        };
        Ok(request)
    }

    fn decode_row_description(r: &mut MessageReader<'_>) -> PgResult<Vec<FieldDescription>> {
        let count = r.read_i16()?;
        let field_count = usize::try_from(count)
            .map_err(|_| PgError::decode(b'T', format!("negative field count {}", count)))?;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(FieldDescription {
                name: r.read_cstr()?,
                table_oid: r.read_u32()?,
                column_attr: r.read_i16()?,
                type_oid: r.read_u32()?,
                type_size: r.read_i16()?,
                type_modifier: r.read_i32()?,
                format: r.read_i16()?,
            });
        }
        Ok(fields)
    }

    fn decode_data_row(frame: &Frame) -> PgResult<Vec<Option<Bytes>>> {
        let mut r = MessageReader::new(frame.tag, &frame.payload);
        let count = r.read_i16()?;
        let column_count = usize::try_from(count)
            .map_err(|_| PgError::decode(b'D', format!("negative column count {}", count)))?;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let start = r.position() + 4;
            let value = r
                .read_len_prefixed()?
                .map(|v| frame.payload.slice(start..start + v.len()));
            columns.push(value);
        }
        Ok(columns)
    }

    fn decode_command_complete(r: &mut MessageReader<'_>) -> String {
        String::from_utf8_lossy(r.rest())
            .trim_end_matches('\0')
            .to_string()
    }

    fn parse_error_fields(r: &mut MessageReader<'_>) -> PgResult<ErrorFields> {
        let mut fields = ErrorFields::default();
        while !r.is_empty() {
            let field_type = r.read_u8()?;
            if field_type == 0 {
                break;
            }
            fields.fields.push((field_type, r.read_cstr()?));
        }
        Ok(fields)
    }
}
