// src/decoder/mod.rs

//! The decode pipeline: resynchronize, validate, classify.
//!
//! `BusDecoder` is a plain state machine. It does no I/O of its own; bytes
//! are pushed in (or pumped from a [`BusSerial`]) and records are polled out
//! with `nb` semantics, `WouldBlock` meaning "feed me more bytes".

pub mod classify;
pub mod registers;
pub mod resync;
pub mod validator;

pub use classify::{Classifier, DecodedField, DecodedRecord, RecordKind};
pub use registers::{ByteOrder, DecodeTable, FieldKind, FieldSpec, RegisterInfo};
pub use resync::{CandidateFrame, Resynchronizer};
pub use validator::FrameValidator;

use std::convert::Infallible;
use std::sync::Arc;

use arrayvec::ArrayVec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::common::{AbcdError, BusSerial, Frame, MonitorConfig, RejectReason, Result};

/// Bytes moved from a serial source per `pump` batch.
const PUMP_BATCH: usize = 64;

/// Aggregate decode statistics. Individual frame failures are only counted.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct DecoderStats {
    pub bytes_received: u64,
    pub bytes_skipped: u64,
    pub frames: u64,
    pub opaque_frames: u64,
    pub rejected_checksum: u64,
    pub rejected_length: u64,
    pub rejected_address: u64,
    pub desyncs: u64,
    pub transport_gaps: u64,
    pub bytes_lost: u64,
}

impl DecoderStats {
    pub fn rejected(&self) -> u64 {
        self.rejected_checksum + self.rejected_length + self.rejected_address
    }
}

pub struct BusDecoder {
    resync: Resynchronizer,
    validator: FrameValidator,
    classifier: Classifier,
    stats: DecoderStats,
}

impl BusDecoder {
    /// Builds a decoder from configuration, loading the configured table version.
    pub fn new(config: &MonitorConfig) -> Result<Self> {
        let table = DecodeTable::for_version(&config.decode_table)?;
        Ok(Self::with_table(config, table))
    }

    /// Builds a decoder with an explicit decode table.
    pub fn with_table(config: &MonitorConfig, table: DecodeTable) -> Self {
        let checksum = config.checksum.build();
        BusDecoder {
            resync: Resynchronizer::new(Arc::clone(&checksum), config.resync_window, config.strict_addresses),
            validator: FrameValidator::new(checksum, config.strict_addresses),
            classifier: Classifier::new(table),
            stats: DecoderStats::default(),
        }
    }

    /// Appends raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.resync.push(bytes);
    }

    /// Records bytes the transport reports as lost after everything pushed
    /// so far. Candidates that would span the gap are dropped unvalidated.
    pub fn note_gap(&mut self, lost: usize) {
        self.stats.transport_gaps += 1;
        self.stats.bytes_lost += lost as u64;
        self.resync.mark_gap();
        let gap = AbcdError::TransportGap { skipped: lost };
        debug!(offset = self.resync.cursor() + self.resync.buffered() as u64, "{}", gap);
    }

    /// Next validated frame, or `WouldBlock` when more bytes are needed.
    pub fn poll_frame(&mut self) -> nb::Result<Frame, Infallible> {
        loop {
            let candidate = self.resync.next_candidate()?;
            match self.validator.validate(&candidate) {
                Ok(frame) => {
                    self.resync.commit(&candidate);
                    self.stats.frames += 1;
                    return Ok(frame);
                }
                Err(reason) => {
                    self.count_rejection(reason);
                    debug!(
                        start = candidate.start,
                        reason = reason.label(),
                        checksum_ok = candidate.checksum_ok,
                        "Candidate rejected"
                    );
                    self.resync.reject(&candidate);
                }
            }
        }
    }

    /// Next decoded record, stamped with `now`.
    pub fn poll_record(&mut self, now: DateTime<Utc>) -> nb::Result<DecodedRecord, Infallible> {
        let frame = self.poll_frame()?;
        let record = self.classifier.classify(frame, now);
        if record.is_opaque() {
            self.stats.opaque_frames += 1;
        }
        debug!(frame = %record.frame, fields = record.fields().len(), "Frame decoded");
        Ok(record)
    }

    /// Moves every byte currently available from `serial` into the decoder.
    ///
    /// # Returns
    ///
    /// * `Ok(n)` with the number of bytes moved once `serial` would block.
    /// * `Err(e)` if the source failed. Bytes read before the failure are kept.
    pub fn pump<S: BusSerial>(&mut self, serial: &mut S) -> core::result::Result<usize, S::Error> {
        let mut total = 0;
        let mut batch = ArrayVec::<u8, PUMP_BATCH>::new();
        let outcome = loop {
            if let Some(lost) = serial.take_gap() {
                self.push(&batch);
                total += batch.len();
                batch.clear();
                self.note_gap(lost);
            }
            match serial.read_byte() {
                Ok(byte) => {
                    batch.push(byte);
                    if batch.is_full() {
                        self.push(&batch);
                        total += batch.len();
                        batch.clear();
                    }
                }
                Err(nb::Error::WouldBlock) => break Ok(()),
                Err(nb::Error::Other(e)) => break Err(e),
            }
        };
        self.push(&batch);
        total += batch.len();
        if let Some(lost) = serial.take_gap() {
            self.note_gap(lost);
        }
        outcome.map(|_| total)
    }

    /// The byte source ended. Remaining bytes are still decoded; a trailing
    /// partial frame is dropped as noise.
    pub fn close(&mut self) {
        self.resync.close();
    }

    /// Begins a new byte stream after `close`. Returns bytes dropped from the old one.
    pub fn reopen(&mut self) -> usize {
        self.resync.reopen()
    }

    /// Drops buffered bytes without decoding them. Returns how many.
    pub fn discard(&mut self) -> usize {
        self.resync.discard()
    }

    pub fn is_synchronized(&self) -> bool {
        self.resync.is_synchronized()
    }

    pub fn ever_synchronized(&self) -> bool {
        self.resync.ever_synchronized()
    }

    pub fn buffered(&self) -> usize {
        self.resync.buffered()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn stats(&self) -> DecoderStats {
        let counters = self.resync.counters();
        DecoderStats {
            bytes_received: counters.bytes_received,
            bytes_skipped: counters.bytes_skipped,
            desyncs: counters.desyncs,
            ..self.stats
        }
    }

    fn count_rejection(&mut self, reason: RejectReason) {
        match reason {
            RejectReason::ChecksumMismatch { .. } => self.stats.rejected_checksum += 1,
            RejectReason::LengthMismatch { .. } => self.stats.rejected_length += 1,
            RejectReason::UnknownAddress(_) => self.stats.rejected_address += 1,
        }
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BusAddr, FieldValue, Function, ReplaySerial};

    const AIR_HANDLER: BusAddr = BusAddr::new(0x40, 0x01);

    fn decoder() -> BusDecoder {
        BusDecoder::new(&MonitorConfig::default()).unwrap()
    }

    fn blower_ack(rpm: u16) -> Vec<u8> {
        let [hi, lo] = rpm.to_be_bytes();
        let payload = [0x00, 0x03, 0x06, 0x00, hi, lo, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08];
        Frame::new(BusAddr::THERMOSTAT, AIR_HANDLER, Function::Ack06, &payload)
            .unwrap()
            .encode()
            .to_vec()
    }

    fn drain(decoder: &mut BusDecoder) -> Vec<DecodedRecord> {
        let mut out = Vec::new();
        while let Ok(record) = decoder.poll_record(Utc::now()) {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_frame_found_after_noise() {
        let mut dec = decoder();
        dec.push(&[0x00, 0x13, 0x37, 0xfe, 0xff, 0x01]);
        dec.push(&blower_ack(402));
        let records = drain(&mut dec);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("blower_rpm"), Some(&FieldValue::Unsigned(402)));
        assert!(dec.stats().bytes_skipped >= 6);
        assert!(dec.is_synchronized());
    }

    #[test]
    fn test_bogus_header_in_noise_is_outlived() {
        let mut dec = decoder();
        // Noise that parses as a header announcing a 64 byte payload.
        dec.push(&[0x20, 0x01, 0x20, 0x01, 0x40]);
        dec.push(&blower_ack(402));
        assert!(drain(&mut dec).is_empty());
        for _ in 0..4 {
            dec.push(&blower_ack(560));
        }
        let records = drain(&mut dec);
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].field("blower_rpm"), Some(&FieldValue::Unsigned(402)));
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let mut dec = decoder();
        let mut records = Vec::new();
        for byte in blower_ack(402).into_iter().chain(blower_ack(560)) {
            dec.push(&[byte]);
            records.extend(drain(&mut dec));
        }
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].field("blower_rpm"), Some(&FieldValue::Unsigned(560)));
    }

    #[test]
    fn test_corrupted_frame_skipped_next_kept() {
        let mut dec = decoder();
        let mut bad = blower_ack(402);
        bad[12] ^= 0x10;
        dec.push(&bad);
        dec.push(&blower_ack(560));
        // The checksum bytes of the bad frame look like a header with a long
        // length; nothing more arrives, so the stream is closed to flush it.
        dec.close();
        let records = drain(&mut dec);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("blower_rpm"), Some(&FieldValue::Unsigned(560)));
        assert_eq!(dec.stats().rejected_checksum, 1);
        assert_eq!(dec.stats().frames, 1);
    }

    #[test]
    fn test_pump_from_replay_with_gap() {
        let mut dec = decoder();
        let mut capture = blower_ack(402);
        capture.extend(blower_ack(560));
        let mut serial = ReplaySerial::new(&capture);
        serial.inject_gap(capture.len(), 3);
        assert_eq!(dec.pump(&mut serial), Ok(capture.len()));
        assert_eq!(drain(&mut dec).len(), 2);
        serial.close();
        assert!(dec.pump(&mut serial).is_err());
        let stats = dec.stats();
        assert_eq!(stats.transport_gaps, 1);
        assert_eq!(stats.bytes_lost, 3);
        assert_eq!(stats.bytes_received, capture.len() as u64);
    }

    #[test]
    fn test_gap_inside_frame_skips_without_validation() {
        let mut dec = decoder();
        let first = blower_ack(100);
        let second = blower_ack(200);
        let mut capture = first.clone();
        capture.extend_from_slice(&second[..8]);
        capture.extend(blower_ack(300));
        let mut serial = ReplaySerial::new(&capture);
        serial.inject_gap(first.len() + 8, second.len() - 8);
        assert_eq!(dec.pump(&mut serial), Ok(capture.len()));

        let rpms: Vec<_> = drain(&mut dec).iter().filter_map(|r| r.field("blower_rpm").cloned()).collect();
        assert_eq!(rpms, vec![FieldValue::Unsigned(100), FieldValue::Unsigned(300)]);
        let stats = dec.stats();
        assert_eq!(stats.rejected_checksum, 0);
        assert_eq!(stats.bytes_skipped, 8);
        assert_eq!(stats.transport_gaps, 1);
    }

    #[test]
    fn test_close_drains_buffer() {
        let mut dec = decoder();
        let frame = blower_ack(402);
        dec.push(&frame);
        dec.push(&frame[..9]);
        assert_eq!(drain(&mut dec).len(), 1);
        assert_eq!(dec.buffered(), 9);
        dec.close();
        assert!(drain(&mut dec).is_empty());
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_reopen_after_close_waits_for_split_frames() {
        let mut dec = decoder();
        dec.push(&blower_ack(402));
        dec.close();
        assert_eq!(drain(&mut dec).len(), 1);
        assert_eq!(dec.reopen(), 0);
        let frame = blower_ack(560);
        dec.push(&frame[..9]);
        assert!(drain(&mut dec).is_empty());
        assert_eq!(dec.buffered(), 9);
        dec.push(&frame[9..]);
        assert_eq!(drain(&mut dec).len(), 1);
    }

    #[test]
    fn test_discard() {
        let mut dec = decoder();
        dec.push(&blower_ack(402)[..9]);
        assert_eq!(dec.discard(), 9);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let config = MonitorConfig { decode_table: "v0".into(), ..MonitorConfig::default() };
        assert!(BusDecoder::new(&config).is_err());
    }
}
