//! Newline-delimited JSON frame decoder.
//!
//! Chunks are buffered as raw bytes and split on `\n`. A newline byte never occurs inside a
//! multi-byte UTF-8 sequence, so characters split across network chunks are reassembled before
//! a line is ever parsed.

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

/// Incremental NDJSON decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already known to hold no newline
    scanned: usize,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete frame it finishes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + pos;
            if let Some(frame) = self.parse_line(start, end) {
                frames.push(frame);
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        frames
    }

    /// Parse whatever is left once the stream has ended and clear the buffer.
    pub fn finish(&mut self) -> Option<Value> {
        let len = self.buffer.len();
        let tail = self.parse_line(0, len);
        self.buffer.clear();
        self.scanned = 0;
        tail
    }

    /// Number of non-empty lines discarded as malformed so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Bytes waiting for their terminating newline
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn parse_line(&mut self, start: usize, end: usize) -> Option<Value> {
        let line = self.buffer[start..end].trim_ascii();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => Some(value),
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(
                    "skipping malformed frame ({} bytes): {}",
                    line.len(),
                    e
                );
                None
            }
        }
    }
}

/// Item yielded by [`decode_frames`].
#[derive(Debug)]
pub enum Decoded<E> {
    /// One parsed frame
    Frame(Value),
    /// A chunk arrived without completing a frame; carries the bytes still buffered
    Pending { buffered: usize },
    /// The underlying stream failed; nothing follows
    Failed(E),
    /// Stream ended; carries the number of malformed lines skipped
    Finished { skipped: usize },
}

/// Turn a chunked byte stream into a lazy, non-restartable stream of frames.
///
/// A read error ends the sequence with [`Decoded::Failed`] and no tail parse; a clean end parses
/// any trailing unterminated line and then yields [`Decoded::Finished`]. Chunks that only extend
/// a partial line yield [`Decoded::Pending`] so consumers can track inbound activity.
pub fn decode_frames<S, E>(chunks: S) -> impl Stream<Item = Decoded<E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    stream! {
        let mut decoder = FrameDecoder::new();
        let mut chunks = std::pin::pin!(chunks);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    let frames = decoder.push(&bytes);
                    if frames.is_empty() && !bytes.is_empty() {
                        yield Decoded::Pending { buffered: decoder.pending_bytes() };
                    }
                    for frame in frames {
                        yield Decoded::Frame(frame);
                    }
                }
                Err(e) => {
                    yield Decoded::Failed(e);
                    return;
                }
            }
        }
        if let Some(tail) = decoder.finish() {
            yield Decoded::Frame(tail);
        }
        yield Decoded::Finished { skipped: decoder.skipped() };
    }
}
