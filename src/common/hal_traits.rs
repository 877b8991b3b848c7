// src/common/hal_traits.rs

use core::fmt::Debug;
use std::collections::VecDeque;

/// Abstraction for a receive-only, non-blocking bus connection.
///
/// The decoder never transmits, so there is no write side.
pub trait BusSerial {
    /// Associated error type for communication errors.
    type Error: Debug;

    /// Attempts to read a single byte from the bus.
    ///
    /// Returns `Ok(byte)` if a byte was read, or `Err(nb::Error::WouldBlock)`
    /// if no byte is available yet. Other errors are returned as `Err(nb::Error::Other(Self::Error))`.
    fn read_byte(&mut self) -> nb::Result<u8, Self::Error>;

    /// Number of bytes the source knows it lost since the last call
    /// (UART overruns, dropped proxy packets). Defaults to none.
    fn take_gap(&mut self) -> Option<usize> {
        None
    }
}

/// Error returned once a [`ReplaySerial`] has played back everything.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReplayExhausted;

/// Plays back a captured byte log through [`BusSerial`].
///
/// Gaps can be injected at byte positions to simulate lost bytes; once the
/// bytes up to the gap are delivered, `take_gap` reports the loss once.
/// After the last byte, reads return `WouldBlock` until the replay is
/// closed, then `Other(ReplayExhausted)`.
#[derive(Debug, Default, Clone)]
pub struct ReplaySerial {
    bytes: VecDeque<u8>,
    gaps: VecDeque<(usize, usize)>,
    delivered: usize,
    closed: bool,
}

impl ReplaySerial {
    pub fn new(capture: &[u8]) -> Self {
        ReplaySerial { bytes: capture.iter().copied().collect(), ..Default::default() }
    }

    /// Parses a hex capture. Whitespace between bytes is ignored.
    pub fn from_hex(capture: &str) -> Result<Self, hex::FromHexError> {
        let compact: String = capture.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Self::new(&hex::decode(compact)?))
    }

    /// Appends more captured bytes.
    pub fn feed(&mut self, more: &[u8]) {
        self.bytes.extend(more.iter().copied());
    }

    /// Reports `lost` dropped bytes once `after` bytes have been delivered.
    pub fn inject_gap(&mut self, after: usize, lost: usize) {
        self.gaps.push_back((after, lost));
    }

    /// Marks the capture as complete.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }
}

impl BusSerial for ReplaySerial {
    type Error = ReplayExhausted;

    fn read_byte(&mut self) -> nb::Result<u8, Self::Error> {
        match self.bytes.pop_front() {
            Some(b) => {
                self.delivered += 1;
                Ok(b)
            }
            None if self.closed => Err(nb::Error::Other(ReplayExhausted)),
            None => Err(nb::Error::WouldBlock),
        }
    }

    fn take_gap(&mut self) -> Option<usize> {
        let mut lost = None;
        while let Some(&(after, n)) = self.gaps.front() {
            if after > self.delivered {
                break;
            }
            self.gaps.pop_front();
            lost = Some(lost.unwrap_or(0) + n);
        }
        lost
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_plays_back_in_order() {
        let mut serial = ReplaySerial::new(&[0x20, 0x01]);
        assert_eq!(serial.read_byte(), Ok(0x20));
        assert_eq!(serial.read_byte(), Ok(0x01));
        assert_eq!(serial.read_byte(), Err(nb::Error::WouldBlock));
        serial.feed(&[0x40]);
        assert_eq!(serial.read_byte(), Ok(0x40));
        serial.close();
        assert_eq!(serial.read_byte(), Err(nb::Error::Other(ReplayExhausted)));
    }

    #[test]
    fn test_replay_from_hex() {
        let mut serial = ReplaySerial::from_hex("4001 2001\n03").unwrap();
        assert_eq!(serial.remaining(), 5);
        assert_eq!(serial.read_byte(), Ok(0x40));
        assert!(ReplaySerial::from_hex("4g").is_err());
    }

    #[test]
    fn test_injected_gap_reported_once() {
        let mut serial = ReplaySerial::new(&[1, 2, 3, 4]);
        serial.inject_gap(2, 7);
        serial.inject_gap(2, 1);
        assert_eq!(serial.read_byte(), Ok(1));
        assert_eq!(serial.take_gap(), None);
        assert_eq!(serial.read_byte(), Ok(2));
        assert_eq!(serial.take_gap(), Some(8));
        assert_eq!(serial.take_gap(), None);
        assert_eq!(serial.read_byte(), Ok(3));
    }
}
