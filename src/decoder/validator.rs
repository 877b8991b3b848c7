// src/decoder/validator.rs

use std::sync::Arc;

use super::resync::CandidateFrame;
use crate::common::{
    AbcdError, BusAddr, Frame, FrameChecksum, Function, RejectReason, MIN_FRAME_LEN,
};

/// Turns candidates into frames, or says why not.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    checksum: Arc<dyn FrameChecksum>,
    strict_addresses: bool,
}

impl FrameValidator {
    pub fn new(checksum: Arc<dyn FrameChecksum>, strict_addresses: bool) -> Self {
        FrameValidator { checksum, strict_addresses }
    }

    pub fn checksum(&self) -> &Arc<dyn FrameChecksum> {
        &self.checksum
    }

    /// Checks, in order: declared length against the candidate size, the
    /// trailing checksum, the length rule for the frame kind, and (in
    /// strict mode) that both addresses belong to known device classes.
    pub fn validate(&self, candidate: &CandidateFrame) -> Result<Frame, RejectReason> {
        let bytes = &candidate.bytes[..];
        if bytes.len() < MIN_FRAME_LEN || candidate.declared_len + MIN_FRAME_LEN != bytes.len() {
            return Err(RejectReason::LengthMismatch {
                declared: candidate.declared_len,
                rule: "frame length does not match length byte",
            });
        }

        if let Err(AbcdError::ChecksumMismatch { expected, calculated }) = self.checksum.verify(bytes) {
            return Err(RejectReason::ChecksumMismatch { expected, calculated });
        }

        let frame = Frame::from_wire(bytes).map_err(|_| RejectReason::LengthMismatch {
            declared: candidate.declared_len,
            rule: "frame length does not match length byte",
        })?;

        if let Some(rule) = length_rule_violation(frame.function, frame.payload.len()) {
            return Err(RejectReason::LengthMismatch { declared: frame.payload.len(), rule });
        }

        if self.strict_addresses {
            if let Some(addr) = unknown_address(&frame) {
                return Err(RejectReason::UnknownAddress(addr));
            }
        }

        Ok(frame)
    }
}

/// Returns the rule broken by a payload of `len` bytes for `function`, if any.
pub fn length_rule_violation(function: Function, len: usize) -> Option<&'static str> {
    match function {
        Function::Read if len != 3 => Some("READ payload must be 3 bytes"),
        Function::Write if len < 3 => Some("WRITE payload must hold a register id"),
        Function::Ack06 if len < 3 => Some("ACK06 payload must hold a register id"),
        Function::Ack02 if len > 1 => Some("ACK02 payload must be at most 1 byte"),
        Function::Nack if len > 1 => Some("NACK payload must be at most 1 byte"),
        _ => None,
    }
}

fn unknown_address(frame: &Frame) -> Option<BusAddr> {
    [frame.source, frame.dest].into_iter().find(|addr| !addr.is_known())
}
