//! Record framer: reassembles an arbitrarily-chunked byte stream into
//! complete FastCGI records.
//!
//! # Responsibilities
//! - Buffer raw chunks in arrival order and frame on record boundaries
//! - Handle headers and bodies split across any number of chunks
//! - Support pause/resume of record delivery (flow control)
//! - Report residual bytes at end of stream as a framing error
//!
//! # Design Decisions
//! - Chunks are kept in a queue and only joined when a header straddles the
//!   first two; a chunk extending past a record boundary is split and the
//!   remainder pushed back as the new queue head
//! - Delivery is a pull (`next_record`), gated by the pause flag, so
//!   completed records queue internally while the consumer is busy

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use super::codec::decode_header;
use super::record::{RecordHeader, HEADER_LEN};

/// Error type for framing.
#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("truncated record at end of stream: {buffered} unconsumed bytes")]
    TruncatedRecord { buffered: usize },
}

/// Stateful reassembler from raw chunks to `(header, body)` records.
#[derive(Debug, Default)]
pub struct RecordFramer {
    /// Not-yet-consumed chunks, in arrival order.
    chunks: VecDeque<Bytes>,
    /// Running total of bytes across `chunks`.
    buffered: usize,
    /// Completed records awaiting delivery.
    ready: VecDeque<(RecordHeader, Bytes)>,
    paused: bool,
}

impl RecordFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk. Completes as many records as the buffered bytes
    /// allow; an empty chunk is a no-op.
    pub fn write(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.buffered += chunk.len();
            self.chunks.push_back(chunk);
        }
        self.build_records();
    }

    /// Pop the next completed record, oldest first. Returns `None` while
    /// paused or when no record is complete.
    pub fn next_record(&mut self) -> Option<(RecordHeader, Bytes)> {
        if self.paused {
            return None;
        }
        self.ready.pop_front()
    }

    /// Hold completed records instead of delivering them.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume delivery in the original order.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Signal end of input. Residual unconsumed bytes mean the stream died
    /// mid-record.
    pub fn finish(&self) -> Result<(), FramerError> {
        if self.buffered > 0 {
            Err(FramerError::TruncatedRecord {
                buffered: self.buffered,
            })
        } else {
            Ok(())
        }
    }

    /// Number of records completed but not yet delivered.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    fn build_records(&mut self) {
        loop {
            if self.buffered < HEADER_LEN {
                return;
            }

            // The first chunk must hold a complete header before its fields
            // can be read; join the head chunks until it does.
            while self.chunks.len() > 1 && self.chunks[0].len() < HEADER_LEN {
                let first = self.chunks.pop_front().expect("head chunk");
                let second = self.chunks.pop_front().expect("second chunk");
                let mut joined = BytesMut::with_capacity(first.len() + second.len());
                joined.extend_from_slice(&first);
                joined.extend_from_slice(&second);
                self.chunks.push_front(joined.freeze());
            }

            let header = decode_header(&self.chunks[0]);
            let record_len = header.wire_len();
            if self.buffered < record_len {
                // Wait for the rest of this record.
                return;
            }

            // A full record's worth of bytes is queued; consume exactly
            // record_len across as many chunks as needed.
            let mut record = BytesMut::with_capacity(record_len);
            while record.len() < record_len {
                let needed = record_len - record.len();
                let chunk = self.chunks.pop_front().expect("buffered bytes");
                if chunk.len() <= needed {
                    record.extend_from_slice(&chunk);
                } else {
                    record.extend_from_slice(&chunk[..needed]);
                    // Remainder starts the next record.
                    self.chunks.push_front(chunk.slice(needed..));
                }
            }
            self.buffered -= record_len;

            let record = record.freeze();
            let body_end = HEADER_LEN + header.content_length as usize;
            self.ready.push_back((header, record.slice(HEADER_LEN..body_end)));
        }
    }
}
