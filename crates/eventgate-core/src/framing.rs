//! Record framing inside a read unit.
//!
//! A datagram may carry one record or several packed records, depending on
//! what the writing peers agreed on. The strategy is configured per
//! endpoint through [`FrameSplitter`]; no delimiter byte is assumed.
//!
//! Stream endpoints have no message boundaries at all, so they use a
//! [`RecordAssembler`] that carries partial records across reads.

use std::fmt;
use std::sync::Arc;

use eventgate_config::EndpointConfig;

/// Splits one read unit into candidate event payloads.
pub trait FrameSplitter: Send + Sync + fmt::Debug {
    /// Segments in their original order. Empty segments are not returned.
    fn split<'a>(&self, unit: &'a [u8]) -> Vec<&'a [u8]>;

    /// Whether `unit` ends exactly on a record boundary, so cutting the
    /// read unit there left every returned segment whole.
    fn ends_on_boundary(&self, _unit: &[u8]) -> bool {
        false
    }
}

/// The whole read unit is one record.
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeMessage;

impl FrameSplitter for WholeMessage {
    fn split<'a>(&self, unit: &'a [u8]) -> Vec<&'a [u8]> {
        if unit.is_empty() {
            Vec::new()
        } else {
            vec![unit]
        }
    }
}

/// Records separated by a single delimiter byte.
#[derive(Debug, Clone, Copy)]
pub struct Delimited {
    delimiter: u8,
}

impl Delimited {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

impl FrameSplitter for Delimited {
    fn split<'a>(&self, unit: &'a [u8]) -> Vec<&'a [u8]> {
        unit.split(|b| *b == self.delimiter)
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    fn ends_on_boundary(&self, unit: &[u8]) -> bool {
        unit.last() == Some(&self.delimiter)
    }
}

/// Build the splitter an endpoint config asks for.
///
/// The config is expected to be validated; an unknown framing or a missing
/// delimiter yields `None`.
pub fn splitter_for(config: &EndpointConfig) -> Option<Arc<dyn FrameSplitter>> {
    match config.framing.as_str() {
        "whole" => Some(Arc::new(WholeMessage)),
        "delimited" => {
            let delimiter = config.delimiter_byte().ok()??;
            Some(Arc::new(Delimited::new(delimiter)))
        }
        _ => None,
    }
}

/// A complete record produced by a [`RecordAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub payload: Vec<u8>,
    pub truncated: bool,
}

/// Reassembles delimiter-terminated records from a byte stream.
///
/// Records longer than `max_len` keep their first `max_len` bytes and are
/// flagged truncated; the rest of that record is discarded up to the next
/// delimiter.
#[derive(Debug)]
pub struct RecordAssembler {
    delimiter: u8,
    max_len: usize,
    buf: Vec<u8>,
    truncated: bool,
}

impl RecordAssembler {
    pub fn new(delimiter: u8, max_len: usize) -> Self {
        Self {
            delimiter,
            max_len,
            buf: Vec::new(),
            truncated: false,
        }
    }

    /// Feed bytes read from the stream, appending finished records to `out`.
    pub fn push(&mut self, mut bytes: &[u8], out: &mut Vec<Record>) {
        while let Some(pos) = bytes.iter().position(|b| *b == self.delimiter) {
            self.extend(&bytes[..pos]);
            self.complete(out);
            bytes = &bytes[pos + 1..];
        }
        self.extend(bytes);
    }

    /// Flush the unterminated tail at end of stream.
    pub fn finish(&mut self) -> Option<Record> {
        let mut out = Vec::with_capacity(1);
        self.complete(&mut out);
        out.pop()
    }

    /// Bytes buffered for the record in progress.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn extend(&mut self, part: &[u8]) {
        if self.truncated {
            return;
        }
        let room = self.max_len - self.buf.len();
        if part.len() > room {
            self.buf.extend_from_slice(&part[..room]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(part);
        }
    }

    fn complete(&mut self, out: &mut Vec<Record>) {
        if !self.buf.is_empty() {
            out.push(Record {
                payload: std::mem::take(&mut self.buf),
                truncated: self.truncated,
            });
        }
        self.truncated = false;
    }
}
