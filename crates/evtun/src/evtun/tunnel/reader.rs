use std::num::NonZeroUsize;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub const DEFAULT_DELIMITER: &[u8] = b"\n";
pub const DEFAULT_BUFFER_CAP: usize = 1 << 20; // 1 MiB

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReaderError {
    #[error("buffer cap exceeded: {buffered} unconsumed bytes > {cap}")]
    BufferOverflow { buffered: usize, cap: usize },
    #[error("reader closed")]
    Closed,
}

/// How the next unit is cut out of the buffered byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Everything up to (not including) the next delimiter.
    Delimited,
    /// Exactly `n` bytes.
    FixedSize(NonZeroUsize),
}

/// Reassembles a byte stream into units.
///
/// Bytes are pushed in with [`ChunkedReader::feed`] and pulled out one unit at a time
/// with [`ChunkedReader::next_unit`]. The owner may switch [`ReadMode`] between two
/// pulls; already buffered bytes are then cut with the new mode.
///
/// Unconsumed bytes are bounded by `cap`. The bound is checked once no further unit can
/// be cut, so a feed that completes a pending unit is fine as long as what is left over
/// fits. Exceeding it poisons the reader: the caller is expected to close the connection
/// and no further units are produced.
#[derive(Debug)]
pub struct ChunkedReader {
    buf: BytesMut,
    mode: ReadMode,
    delimiter: Bytes,
    cap: usize,
    // Bytes at the front of `buf` already known not to start a delimiter.
    scanned: usize,
    closed: bool,
}

impl ChunkedReader {
    pub fn new(delimiter: impl Into<Bytes>, cap: usize) -> Self {
        let mut delimiter = delimiter.into();
        if delimiter.is_empty() {
            delimiter = Bytes::from_static(DEFAULT_DELIMITER);
        }
        Self {
            buf: BytesMut::new(),
            mode: ReadMode::Delimited,
            delimiter,
            cap: cap.max(1),
            scanned: 0,
            closed: false,
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_delimited(&mut self) {
        self.mode = ReadMode::Delimited;
    }

    pub fn set_fixed_size(&mut self, n: NonZeroUsize) {
        self.mode = ReadMode::FixedSize(n);
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<(), ReaderError> {
        if self.is_closed() {
            return Err(ReaderError::Closed);
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Cuts the next unit in the current mode.
    ///
    /// `Ok(None)` means more bytes are needed. At that point the leftover must fit the cap,
    /// otherwise the reader is poisoned and `BufferOverflow` is returned.
    pub fn next_unit(&mut self) -> Result<Option<Bytes>, ReaderError> {
        if self.is_closed() {
            return Ok(None);
        }
        let unit = match self.mode() {
            ReadMode::Delimited => self.next_delimited(),
            ReadMode::FixedSize(n) if self.buf.len() >= n.get() => {
                self.scanned = 0;
                Some(self.buf.split_to(n.get()).freeze())
            }
            ReadMode::FixedSize(_) => None,
        };
        if unit.is_none() && self.buffered() > self.cap {
            let err = ReaderError::BufferOverflow {
                buffered: self.buffered(),
                cap: self.cap,
            };
            self.close();
            return Err(err);
        }
        Ok(unit)
    }

    /// Drops everything buffered; every later call yields nothing.
    pub fn close(&mut self) {
        self.closed = true;
        self.buf.clear();
        self.scanned = 0;
    }

    fn next_delimited(&mut self) -> Option<Bytes> {
        let dl = self.delimiter.len();
        if self.buf.len() < dl {
            return None;
        }
        let start = self.scanned.min(self.buf.len());
        let found = self.buf[start..]
            .windows(dl)
            .position(|w| w == &self.delimiter[..])
            .map(|i| start + i);

        match found {
            Some(i) => {
                let unit = self.buf.split_to(i).freeze();
                let _ = self.buf.split_to(dl);
                self.scanned = 0;
                Some(unit)
            }
            None => {
                // A delimiter may still straddle the tail.
                self.scanned = self.buf.len() + 1 - dl;
                None
            }
        }
    }
}

impl Default for ChunkedReader {
    fn default() -> Self {
        Self::new(Bytes::from_static(DEFAULT_DELIMITER), DEFAULT_BUFFER_CAP)
    }
}
