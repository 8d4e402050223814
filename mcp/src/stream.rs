//! Stream reassembly: delivers chunks to the owner strictly in sequence
//! order, holding out-of-order arrivals in a bounded window.
//!
//! One buffer per stream, owned by the single receiving worker. Duplicates
//! are dropped; a chunk landing beyond the window fails the stream with
//! `STREAM_GAP`.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use wire::ErrorCode;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("gap in stream: expected sequence {expected}, chunk {got} is beyond window {window}")]
    Gap { expected: u64, got: u64, window: u64 },
    #[error("stream closed with {missing} chunk(s) outstanding before sequence {buffered_from}")]
    ClosedWithHoles { missing: u64, buffered_from: u64 },
    #[error("chunk after stream close: sequence {0}")]
    AfterClose(u64),
}

impl StreamError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::StreamGap
    }
}

/// Reorder buffer for one chunk stream.
///
/// Sequences must form a contiguous range from 0. Chunks in
/// `(next, next + window]` wait in the buffer; anything further out is a gap.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    next_seq: u64,
    window: u64,
    pending: BTreeMap<u64, Value>,
    closed: bool,
}

impl ReassemblyBuffer {
    pub fn new(window: u64) -> Self {
        Self {
            next_seq: 0,
            window,
            pending: BTreeMap::new(),
            closed: false,
        }
    }

    /// Next sequence the consumer is owed.
    pub fn next_expected(&self) -> u64 {
        self.next_seq
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Offers one chunk. Returns the (possibly empty) run of chunks now
    /// deliverable in order. Duplicates yield an empty run.
    pub fn accept(&mut self, sequence: u64, data: Value) -> Result<Vec<(u64, Value)>, StreamError> {
        if self.closed {
            return Err(StreamError::AfterClose(sequence));
        }
        if sequence < self.next_seq || self.pending.contains_key(&sequence) {
            // Duplicate delivery (AT_LEAST_ONCE re-sends); drop silently.
            return Ok(Vec::new());
        }
        if sequence > self.next_seq + self.window {
            return Err(StreamError::Gap {
                expected: self.next_seq,
                got: sequence,
                window: self.window,
            });
        }
        self.pending.insert(sequence, data);

        let mut ready = Vec::new();
        while let Some(data) = self.pending.remove(&self.next_seq) {
            ready.push((self.next_seq, data));
            self.next_seq += 1;
        }
        Ok(ready)
    }

    /// Seals the stream at STREAM_END. Fails when buffered chunks are still
    /// waiting on a missing predecessor.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        if let Some((&buffered_from, _)) = self.pending.iter().next() {
            return Err(StreamError::ClosedWithHoles {
                missing: buffered_from - self.next_seq,
                buffered_from,
            });
        }
        self.closed = true;
        Ok(())
    }
}
