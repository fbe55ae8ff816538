//! Wire format encoding and decoding.
//!
//! Implements the 8-byte FastCGI record header:
//! ```text
//! ┌─────────┬──────┬───────────┬─────────────┬─────────────┬──────────┐
//! │ Version │ Type │ Req ID    │ Content len │ Padding len │ Reserved │
//! │ 1 byte  │ 1 B  │ 2 B, BE   │ 2 bytes, BE │ 1 byte      │ 1 byte   │
//! └─────────┴──────┴───────────┴─────────────┴─────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. A record's content is followed
//! by `padding_length` zero bytes so that content + padding is a multiple
//! of 8.

use crate::error::{FastgateError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// The only FastCGI protocol version in existence.
pub const VERSION_1: u8 = 1;

/// Maximum content length of a single record.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// The fixed request ID for management records.
pub const MANAGEMENT_REQUEST_ID: u16 = 0;

/// Mask for the keep-connection bit in `BEGIN_REQUEST` flags.
pub const KEEP_CONN: u8 = 1;

/// Well-known variable names for `GET_VALUES` queries.
pub mod values {
    /// Maximum number of concurrent transport connections the application accepts.
    pub const MAX_CONNS: &str = "FCGI_MAX_CONNS";
    /// Maximum number of concurrent requests the application accepts.
    pub const MAX_REQS: &str = "FCGI_MAX_REQS";
    /// "1" if the application multiplexes connections, "0" otherwise.
    pub const MPXS_CONNS: &str = "FCGI_MPXS_CONNS";
}

/// FastCGI record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Starts a request; carries role and flags.
    BeginRequest = 1,
    /// Aborts a request mid-flight.
    AbortRequest = 2,
    /// Ends a request; carries application and protocol status.
    EndRequest = 3,
    /// Name-value pair stream with the CGI environment.
    Params = 4,
    /// Request body stream.
    Stdin = 5,
    /// Response body stream.
    Stdout = 6,
    /// Response error stream.
    Stderr = 7,
    /// Extra data stream for the Filter role.
    Data = 8,
    /// Management query for application capabilities.
    GetValues = 9,
    /// Management response to [`RecordType::GetValues`].
    GetValuesResult = 10,
    /// Management response to a record type the application does not know.
    UnknownType = 11,
}

impl RecordType {
    /// Parse a wire byte into a record type.
    pub fn from_u8(v: u8) -> Result<Self> {
        use RecordType::*;
        Ok(match v {
            1 => BeginRequest,
            2 => AbortRequest,
            3 => EndRequest,
            4 => Params,
            5 => Stdin,
            6 => Stdout,
            7 => Stderr,
            8 => Data,
            9 => GetValues,
            10 => GetValuesResult,
            11 => UnknownType,
            other => {
                return Err(FastgateError::Protocol(format!(
                    "unknown record type {other}"
                )))
            }
        })
    }

    /// Management record types travel on request ID 0.
    #[inline]
    pub fn is_management(self) -> bool {
        matches!(
            self,
            RecordType::GetValues | RecordType::GetValuesResult | RecordType::UnknownType
        )
    }

    /// Stream record types are terminated by a zero-length record.
    #[inline]
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            RecordType::Params
                | RecordType::Stdin
                | RecordType::Stdout
                | RecordType::Stderr
                | RecordType::Data
        )
    }
}

/// The role the application plays for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Role {
    /// Handle the request and produce the response.
    Responder = 1,
    /// Permit or deny the request.
    Authorizer = 2,
    /// Transform the extra data stream.
    Filter = 3,
}

impl Role {
    /// Parse a wire value into a role.
    pub fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            1 => Role::Responder,
            2 => Role::Authorizer,
            3 => Role::Filter,
            other => return Err(FastgateError::Protocol(format!("unknown role {other}"))),
        })
    }
}

/// Protocol-level completion status carried in `END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Normal end of request.
    RequestComplete = 0,
    /// The application rejects a second multiplexed request per connection.
    CantMpxConn = 1,
    /// The application is out of some resource.
    Overloaded = 2,
    /// The application does not implement the requested role.
    UnknownRole = 3,
}

impl ProtocolStatus {
    /// Parse a wire byte into a protocol status.
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => ProtocolStatus::RequestComplete,
            1 => ProtocolStatus::CantMpxConn,
            2 => ProtocolStatus::Overloaded,
            3 => ProtocolStatus::UnknownRole,
            other => {
                return Err(FastgateError::Protocol(format!(
                    "unknown protocol status {other}"
                )))
            }
        })
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Record type, defining the payload.
    pub rtype: RecordType,
    /// Request this record belongs to (0 = management).
    pub request_id: u16,
    /// Payload length in bytes.
    pub content_length: u16,
    /// Number of zero bytes following the payload.
    pub padding_length: u8,
}

impl Header {
    /// Create a header with lengths set to 0.
    pub fn new(rtype: RecordType, request_id: u16) -> Self {
        Self {
            rtype,
            request_id,
            content_length: 0,
            padding_length: 0,
        }
    }

    /// Create a header for `content_length` bytes of payload, padding the
    /// record out to a multiple of 8 bytes.
    pub fn for_content(rtype: RecordType, request_id: u16, content_length: u16) -> Self {
        let mut h = Self::new(rtype, request_id);
        h.set_lengths(content_length);
        h
    }

    /// Set `content_length` and derive `padding_length` (0-7 bytes) so that
    /// content + padding is a multiple of 8.
    pub fn set_lengths(&mut self, content_length: u16) {
        self.content_length = content_length;
        let rem = content_length % 8;
        self.padding_length = if rem == 0 { 0 } else { (8 - rem) as u8 };
    }

    /// Encode the header to wire bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = VERSION_1;
        buf[1] = self.rtype as u8;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf
    }

    /// Decode a header from wire bytes.
    ///
    /// # Errors
    /// Fails on a short buffer, a version other than 1, or an unknown
    /// record type.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(FastgateError::Protocol(format!(
                "short record header: {} bytes",
                buf.len()
            )));
        }
        if buf[0] != VERSION_1 {
            return Err(FastgateError::Protocol(format!(
                "unsupported FastCGI version {}",
                buf[0]
            )));
        }
        Ok(Self {
            rtype: RecordType::from_u8(buf[1])?,
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    /// Whether this header belongs to a management record.
    #[inline]
    pub fn is_management(&self) -> bool {
        self.rtype.is_management() && self.request_id == MANAGEMENT_REQUEST_ID
    }

    /// A slice of `padding_length` zero bytes.
    #[inline]
    pub fn padding_bytes(&self) -> &'static [u8] {
        static PADDING: [u8; u8::MAX as usize] = [0; u8::MAX as usize];
        &PADDING[..usize::from(self.padding_length)]
    }
}

/// Body of a `BEGIN_REQUEST` record (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    /// Role requested of the application.
    pub role: Role,
    /// Flag bits; only [`KEEP_CONN`] is defined.
    pub flags: u8,
}

impl BeginRequestBody {
    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&(self.role as u16).to_be_bytes());
        buf[2] = self.flags;
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(FastgateError::Protocol("short BEGIN_REQUEST body".into()));
        }
        Ok(Self {
            role: Role::from_u16(u16::from_be_bytes([buf[0], buf[1]]))?,
            flags: buf[2],
        })
    }

    /// Whether the application should keep the connection open afterwards.
    #[inline]
    pub fn keep_conn(&self) -> bool {
        self.flags & KEEP_CONN != 0
    }
}

/// Body of an `END_REQUEST` record (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    /// CGI exit status of the application for this request.
    pub app_status: u32,
    /// Protocol-level completion status.
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        buf[4] = self.protocol_status as u8;
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(FastgateError::Protocol("short END_REQUEST body".into()));
        }
        Ok(Self {
            app_status: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            protocol_status: ProtocolStatus::from_u8(buf[4])?,
        })
    }
}
