// src/decoder/resync.rs

//! Frame boundary recovery.
//!
//! The bus carries no delimiters, so frames are found by looking for a
//! plausible header (address bytes in the ranges used by bus participants)
//! and bounding the candidate with its length byte. Every candidate is
//! either committed (cursor moves past it) or rejected (cursor moves one
//! byte past its start). Bytes that are skipped are dropped from the buffer
//! and never scanned again. A candidate that would span a transport gap is
//! skipped without reaching the validator.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::common::{
    frame::{DEST_OFFSET, LENGTH_OFFSET, SOURCE_OFFSET},
    BusAddr, FrameChecksum, MAX_FRAME_LEN, MIN_FRAME_LEN,
};

/// A byte range proposed as a frame. Consumed by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFrame {
    /// Absolute stream offset of the first byte.
    pub start: u64,
    /// Absolute stream offset one past the last byte.
    pub end: u64,
    /// Payload length taken from the length byte.
    pub declared_len: usize,
    /// Whether the trailing checksum matched when the candidate was bounded.
    pub checksum_ok: bool,
    pub bytes: Bytes,
}

impl CandidateFrame {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ScanState {
    /// Looking for a plausible frame start at the head of the buffer.
    Scanning,
    /// Start found, waiting until `total` bytes are buffered.
    Bounded { total: usize },
    /// Candidate handed out, waiting for commit or reject.
    Offered { total: usize },
}

/// Counters kept by the resynchronizer.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ResyncCounters {
    pub bytes_received: u64,
    pub bytes_skipped: u64,
    pub candidates: u64,
    pub desyncs: u64,
}

pub struct Resynchronizer {
    buffer: BytesMut,
    /// Absolute stream offset of `buffer[0]`.
    cursor: u64,
    state: ScanState,
    checksum: Arc<dyn FrameChecksum>,
    strict_addresses: bool,
    window: usize,
    /// Bytes skipped or rejected since the last committed frame.
    noise_run: usize,
    synchronized: bool,
    ever_synchronized: bool,
    closing: bool,
    /// Absolute offsets where the transport lost bytes, ascending.
    gaps: VecDeque<u64>,
    counters: ResyncCounters,
}

impl Resynchronizer {
    /// # Arguments
    ///
    /// * `checksum` - Scheme used to flag candidates.
    /// * `window` - Noise bytes tolerated before the stream counts as desynchronized.
    /// * `strict_addresses` - Only accept frame starts whose address bytes fall
    ///   in the ranges reserved for bus participants.
    pub fn new(checksum: Arc<dyn FrameChecksum>, window: usize, strict_addresses: bool) -> Self {
        Resynchronizer {
            buffer: BytesMut::with_capacity(4 * MAX_FRAME_LEN),
            cursor: 0,
            state: ScanState::Scanning,
            checksum,
            strict_addresses,
            window: window.max(MIN_FRAME_LEN),
            noise_run: 0,
            synchronized: false,
            ever_synchronized: false,
            closing: false,
            gaps: VecDeque::new(),
            counters: ResyncCounters::default(),
        }
    }

    /// Appends raw bytes from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.counters.bytes_received += data.len() as u64;
    }

    /// Marks the end of the buffered bytes as a gap: bytes were lost there.
    pub fn mark_gap(&mut self) {
        let at = self.cursor + self.buffer.len() as u64;
        if self.gaps.back().map_or(true, |&last| last < at) {
            self.gaps.push_back(at);
        }
    }

    /// Produces the next candidate, or `WouldBlock` when more bytes are needed.
    ///
    /// Calling this again before `commit` or `reject` hands out the same candidate.
    pub fn next_candidate(&mut self) -> nb::Result<CandidateFrame, Infallible> {
        loop {
            while self.gaps.front().is_some_and(|&gap| gap <= self.cursor) {
                self.gaps.pop_front();
            }
            if let ScanState::Bounded { total } = self.state {
                if self.spans_gap(total) {
                    self.skip(1);
                    self.state = ScanState::Scanning;
                    continue;
                }
            }
            match self.state {
                ScanState::Bounded { total } | ScanState::Offered { total }
                    if self.buffer.len() >= total =>
                {
                    let bytes = Bytes::copy_from_slice(&self.buffer[..total]);
                    let checksum_ok = self.checksum.verify(&bytes).is_ok();
                    if self.state == (ScanState::Bounded { total }) {
                        self.counters.candidates += 1;
                    }
                    self.state = ScanState::Offered { total };
                    return Ok(CandidateFrame {
                        start: self.cursor,
                        end: self.cursor + total as u64,
                        declared_len: total - MIN_FRAME_LEN,
                        checksum_ok,
                        bytes,
                    });
                }
                ScanState::Bounded { .. } | ScanState::Offered { .. } => {
                    if self.closing {
                        // The stream ended inside this candidate.
                        self.skip(1);
                        self.state = ScanState::Scanning;
                        continue;
                    }
                    return Err(nb::Error::WouldBlock);
                }
                ScanState::Scanning => {
                    if self.buffer.len() <= LENGTH_OFFSET {
                        if self.closing && !self.buffer.is_empty() {
                            let rest = self.buffer.len();
                            self.skip(rest);
                        }
                        return Err(nb::Error::WouldBlock);
                    }
                    if !self.plausible_start() {
                        self.skip(1);
                        continue;
                    }
                    let total = self.buffer[LENGTH_OFFSET] as usize + MIN_FRAME_LEN;
                    if self.spans_gap(total) {
                        self.skip(1);
                        continue;
                    }
                    self.state = ScanState::Bounded { total };
                }
            }
        }
    }

    /// Consumes an accepted candidate.
    pub fn commit(&mut self, candidate: &CandidateFrame) {
        if candidate.start != self.cursor {
            debug!(start = candidate.start, cursor = self.cursor, "Stale candidate ignored");
            return;
        }
        self.buffer.advance(candidate.len());
        self.cursor = candidate.end;
        self.state = ScanState::Scanning;
        self.noise_run = 0;
        if !self.synchronized {
            if self.ever_synchronized {
                info!(offset = self.cursor, "Bus resynchronized");
            } else {
                info!(offset = self.cursor, "Bus synchronized");
            }
            self.synchronized = true;
            self.ever_synchronized = true;
        }
    }

    /// Treats the candidate's start byte as noise and resumes one byte later.
    pub fn reject(&mut self, candidate: &CandidateFrame) {
        if candidate.start != self.cursor {
            debug!(start = candidate.start, cursor = self.cursor, "Stale candidate ignored");
            return;
        }
        self.skip(1);
        self.state = ScanState::Scanning;
    }

    /// Stream ended: buffered bytes are still decoded, but partial
    /// candidates are given up instead of waited for.
    pub fn close(&mut self) {
        self.closing = true;
    }

    /// Starts a new byte stream after `close`, e.g. on reconnect. Bytes left
    /// over from the previous stream are dropped.
    pub fn reopen(&mut self) -> usize {
        self.closing = false;
        self.discard()
    }

    /// Drops everything buffered. Returns the number of bytes dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.cursor += dropped as u64;
        self.buffer.clear();
        self.state = ScanState::Scanning;
        self.gaps.clear();
        dropped
    }

    /// Absolute stream offset of the next unconsumed byte.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn ever_synchronized(&self) -> bool {
        self.ever_synchronized
    }

    pub fn counters(&self) -> ResyncCounters {
        self.counters
    }

    fn plausible_start(&self) -> bool {
        if !self.strict_addresses {
            return true;
        }
        let dest = BusAddr::from_bytes(&self.buffer[DEST_OFFSET..]);
        let source = BusAddr::from_bytes(&self.buffer[SOURCE_OFFSET..]);
        match (dest, source) {
            (Some(d), Some(s)) => {
                BusAddr::is_reserved_range(d.class_byte()) && BusAddr::is_reserved_range(s.class_byte())
            }
            _ => false,
        }
    }

    /// Whether a frame of `total` bytes at the cursor would cross lost bytes.
    fn spans_gap(&self, total: usize) -> bool {
        self.gaps.front().is_some_and(|&gap| self.cursor + total as u64 > gap)
    }

    fn skip(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        self.buffer.advance(n);
        self.cursor += n as u64;
        self.counters.bytes_skipped += n as u64;
        self.noise_run += n;
        if self.synchronized && self.noise_run >= self.window {
            self.synchronized = false;
            self.counters.desyncs += 1;
            warn!(
                offset = self.cursor,
                skipped = self.noise_run,
                "Bus desynchronized, resynchronizing"
            );
        }
    }
}
