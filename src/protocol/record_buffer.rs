//! Record buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented records:
//! - `WaitingForHeader`: need at least 8 bytes
//! - `WaitingForPayload`: header parsed, need content + padding bytes
//!
//! Padding bytes are consumed and discarded; callers only ever see the
//! record content.

use bytes::{Bytes, BytesMut};

use super::record::Record;
use super::wire_format::{Header, HEADER_SIZE};
use crate::error::Result;

/// State machine for record parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header (need 8 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for content + padding bytes.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete records.
///
/// All data is stored in a single `BytesMut` buffer to minimize
/// allocations; payloads are handed out as zero-copy `Bytes` slices.
pub struct RecordBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
}

impl RecordBuffer {
    /// Create a new record buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForHeader,
        }
    }

    /// Push data into the buffer and extract all complete records.
    ///
    /// Returns a vector of complete records. If data is fragmented,
    /// partial data is buffered internally for the next push.
    ///
    /// # Errors
    /// Returns `Protocol` if a header fails validation (bad version or
    /// unknown record type).
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Record>> {
        self.buffer.extend_from_slice(data);

        let mut records = Vec::new();
        while let Some(record) = self.try_extract_one()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Try to extract a single record from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Record>> {
        match &self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header = Header::decode(&self.buffer[..HEADER_SIZE])?;
                let _ = self.buffer.split_to(HEADER_SIZE);

                self.state = State::WaitingForPayload { header };
                self.try_extract_one()
            }

            State::WaitingForPayload { header } => {
                let content = usize::from(header.content_length);
                let padding = usize::from(header.padding_length);
                if self.buffer.len() < content + padding {
                    return Ok(None);
                }

                // Extract content (zero-copy freeze), then discard padding.
                let payload: Bytes = if content == 0 {
                    Bytes::new()
                } else {
                    self.buffer.split_to(content).freeze()
                };
                let _ = self.buffer.split_to(padding);

                let header = *header;
                self.state = State::WaitingForHeader;

                Ok(Some(Record::new(header, payload)))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}
