//! Protocol module - the FastCGI wire codec.
//!
//! This module implements the binary record format:
//! - 8-byte header encoding/decoding with padding arithmetic
//! - Record buffer for accumulating partial reads
//! - Record struct with typed accessors
//! - Name-value pair streams for `PARAMS` and `GET_VALUES`

pub mod params;
mod record;
mod record_buffer;
mod wire_format;

pub use record::{encode_record, Record};
pub use record_buffer::RecordBuffer;
pub use wire_format::{
    values, BeginRequestBody, EndRequestBody, Header, ProtocolStatus, RecordType, Role,
    HEADER_SIZE, KEEP_CONN, MANAGEMENT_REQUEST_ID, MAX_CONTENT_LEN, VERSION_1,
};
