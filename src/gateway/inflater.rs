//! Persistent zlib-stream inflater for compressed gateway links.
//!
//! When the link negotiates zlib-stream compression the server sends one
//! long deflate stream across the whole connection. Frames arrive as
//! binary chunks; a chunk ends a logical message iff it carries the zlib
//! sync-flush suffix `00 00 FF FF`. Chunks without the suffix buffer until
//! the terminal fragment lands.

use flate2::{Decompress, FlushDecompress, Status};

/// The zlib sync-flush marker terminating each logical message.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Initial scratch allocation for inflated output.
const OUTPUT_CHUNK: usize = 32 * 1024;

#[derive(Debug)]
pub struct Inflater {
    stream: Decompress,
    /// Compressed fragments awaiting the terminal chunk.
    pending: Vec<u8>,
}

impl Inflater {
    pub fn new() -> Self {
        Self { stream: Decompress::new(true), pending: Vec::new() }
    }

    /// Feed one binary websocket chunk.
    ///
    /// Returns the inflated message when `chunk` is the terminal fragment,
    /// `None` while buffering.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<String>, InflateError> {
        self.pending.extend_from_slice(chunk);

        if !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut output = Vec::with_capacity(OUTPUT_CHUNK);
        let mut consumed = 0usize;
        loop {
            let before_in = self.stream.total_in();
            let status = self
                .stream
                .decompress_vec(&self.pending[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| InflateError::Corrupt(e.to_string()))?;
            consumed += (self.stream.total_in() - before_in) as usize;

            if status == Status::StreamEnd {
                break;
            }
            if output.len() == output.capacity() {
                // Out of output room; grow and let the stream flush the
                // rest before deciding anything.
                output.reserve(OUTPUT_CHUNK);
                continue;
            }
            if consumed >= self.pending.len() {
                break;
            }
        }
        self.pending.clear();

        String::from_utf8(output)
            .map(Some)
            .map_err(|e| InflateError::Encoding(e.to_string()))
    }

    /// Drop buffered fragments and start a fresh zlib context. Called on
    /// every reconnect because the server starts a new stream.
    pub fn reset(&mut self) {
        self.stream.reset(true);
        self.pending.clear();
    }

    /// Bytes buffered while waiting for a terminal fragment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InflateError {
    #[error("zlib stream corrupted: {0}")]
    Corrupt(String),
    #[error("inflated payload is not utf-8: {0}")]
    Encoding(String),
}
