//! Record struct with typed accessors.
//!
//! Represents a complete FastCGI record with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing; padding is computed
//! on encode and dropped on decode.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Header, RecordType, HEADER_SIZE, MAX_CONTENT_LEN};

/// A complete FastCGI record.
#[derive(Debug, Clone)]
pub struct Record {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes, padding excluded (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Record {
    /// Create a new record from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get the record type.
    #[inline]
    pub fn rtype(&self) -> RecordType {
        self.header.rtype
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// A zero-length stream record terminates its stream.
    #[inline]
    pub fn is_stream_end(&self) -> bool {
        self.header.rtype.is_stream() && self.payload.is_empty()
    }
}

/// Build a complete record as a single contiguous buffer.
///
/// Emits the 8-byte header, the payload, and the zero padding that rounds
/// the record out to a multiple of 8 bytes.
///
/// # Panics
/// Panics if `payload` exceeds the 65,535-byte record content limit;
/// callers fragment streams before reaching this function.
pub fn encode_record(rtype: RecordType, request_id: u16, payload: &[u8]) -> Bytes {
    assert!(payload.len() <= MAX_CONTENT_LEN, "record payload too large");
    let header = Header::for_content(rtype, request_id, payload.len() as u16);
    let mut buf =
        BytesMut::with_capacity(HEADER_SIZE + payload.len() + usize::from(header.padding_length));
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf.put_slice(header.padding_bytes());
    buf.freeze()
}
