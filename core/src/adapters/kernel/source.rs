//! Ordered stream of decoded kernel events.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::domain::KernelEvent;
use crate::error::Result;

use super::decode::{decode_record, DecodeError};

/// One item read from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(KernelEvent),
    /// A line that could not be decoded. Skipped by consumers.
    Malformed { line: u64, error: DecodeError },
}

/// Reads newline-delimited tracer records in arrival order.
pub struct KernelEventSource<R> {
    reader: R,
    /// Bytes of the current line, kept across cancelled reads.
    buf: Vec<u8>,
    line_no: u64,
}

impl<R: AsyncBufRead + Unpin> KernelEventSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line_no: 0,
        }
    }

    /// Read the next non-blank record. Returns `Ok(None)` at end of stream.
    ///
    /// Cancel safe: a partially read line stays buffered for the next call.
    /// Only I/O failures are errors; undecodable bytes are [`StreamItem::Malformed`].
    pub async fn next_item(&mut self) -> Result<Option<StreamItem>> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.buf).await?;
            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }

            self.line_no += 1;
            let line = std::mem::take(&mut self.buf);
            if let Some(item) = self.decode_line(&line) {
                return Ok(Some(item));
            }
        }
    }

    fn decode_line(&self, raw: &[u8]) -> Option<StreamItem> {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

        let decoded = match std::str::from_utf8(raw) {
            Ok(text) if text.trim().is_empty() => return None,
            Ok(text) => decode_record(text),
            Err(_) => Err(DecodeError::InvalidUtf8),
        };

        Some(match decoded {
            Ok(event) => StreamItem::Event(event),
            Err(error) => StreamItem::Malformed {
                line: self.line_no,
                error,
            },
        })
    }

    /// Number of lines consumed so far.
    pub fn lines_read(&self) -> u64 {
        self.line_no
    }
}
