// src/common/frame.rs

use super::address::BusAddr;
use super::crc::{calculate_crc16, decode_crc, encode_crc};
use super::error::AbcdError;
use arrayvec::ArrayVec;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// === Wire layout ===
// dest[2] source[2] length[1] pid[1] ext[1] function[1] payload[length] crc[2]

/// Bytes preceding the payload.
pub const HEADER_LEN: usize = 8;
/// Trailing checksum bytes.
pub const CRC_LEN: usize = 2;
/// Length of a frame with an empty payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CRC_LEN;
/// The length byte caps the payload.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_PAYLOAD_LEN;

pub const DEST_OFFSET: usize = 0;
pub const SOURCE_OFFSET: usize = 2;
pub const LENGTH_OFFSET: usize = 4;
pub const PID_OFFSET: usize = 5;
pub const EXT_OFFSET: usize = 6;
pub const FUNCTION_OFFSET: usize = 7;

/// Raw payload storage. Never reallocates.
pub type Payload = ArrayVec<u8, MAX_PAYLOAD_LEN>;

/// The function byte, i.e. the kind of frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Function {
    /// Acknowledgement without data.
    Ack02,
    /// Acknowledgement carrying register data (reply to READ or WRITE).
    Ack06,
    /// Register read request. This is the bus poll.
    Read,
    /// Register write carrying data.
    Write,
    /// Change table name.
    ChangeTableName,
    Nack,
    Alarm,
    ReadObject,
    ReadVariable,
    Force,
    Auto,
    List,
    /// Anything not in the table above, kept verbatim.
    Other(u8),
}

impl Function {
    pub const fn name(&self) -> &'static str {
        match self {
            Function::Ack02 => "ACK02",
            Function::Ack06 => "ACK06",
            Function::Read => "READ",
            Function::Write => "WRITE",
            Function::ChangeTableName => "CHGTBN",
            Function::Nack => "NACK",
            Function::Alarm => "ALARM",
            Function::ReadObject => "RDOBJ",
            Function::ReadVariable => "RDVAR",
            Function::Force => "FORCE",
            Function::Auto => "AUTO",
            Function::List => "LIST",
            Function::Other(_) => "OTHER",
        }
    }

    pub const fn as_u8(&self) -> u8 {
        match self {
            Function::Ack02 => 0x02,
            Function::Ack06 => 0x06,
            Function::Read => 0x0b,
            Function::Write => 0x0c,
            Function::ChangeTableName => 0x10,
            Function::Nack => 0x15,
            Function::Alarm => 0x1e,
            Function::ReadObject => 0x22,
            Function::ReadVariable => 0x62,
            Function::Force => 0x63,
            Function::Auto => 0x64,
            Function::List => 0x75,
            Function::Other(b) => *b,
        }
    }

    /// WRITE and ACK06 frames go to the archive side channel.
    pub const fn is_archived(&self) -> bool {
        matches!(self, Function::Write | Function::Ack06)
    }

    /// Whether the payload starts with a three byte register id.
    pub const fn carries_register(&self) -> bool {
        matches!(self, Function::Read | Function::Write | Function::Ack06)
    }
}

impl From<u8> for Function {
    fn from(b: u8) -> Self {
        match b {
            0x02 => Function::Ack02,
            0x06 => Function::Ack06,
            0x0b => Function::Read,
            0x0c => Function::Write,
            0x10 => Function::ChangeTableName,
            0x15 => Function::Nack,
            0x1e => Function::Alarm,
            0x22 => Function::ReadObject,
            0x62 => Function::ReadVariable,
            0x63 => Function::Force,
            0x64 => Function::Auto,
            0x75 => Function::List,
            other => Function::Other(other),
        }
    }
}

impl From<Function> for u8 {
    fn from(f: Function) -> u8 {
        f.as_u8()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.as_u8())
    }
}

impl Serialize for Function {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Register id: `00 TT RR` (table, register). Printed as `TTRR`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegisterId(pub [u8; 3]);

impl RegisterId {
    pub const fn new(table: u8, register: u8) -> Self {
        RegisterId([0x00, table, register])
    }

    pub const fn table(&self) -> u8 {
        self.0[1]
    }

    pub const fn register(&self) -> u8 {
        self.0[2]
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            [a, b, c, ..] => Some(RegisterId([*a, *b, *c])),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0[0] != 0 {
            write!(f, "{:02x}", self.0[0])?;
        }
        write!(f, "{:02x}{:02x}", self.0[1], self.0[2])
    }
}

impl FromStr for RegisterId {
    type Err = AbcdError;

    /// Accepts `"3b02"` or the full `"003b02"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        let bytes = hex::decode(digits).map_err(|_| AbcdError::InvalidRegister(s.to_string()))?;
        match bytes.as_slice() {
            [t, r] => Ok(RegisterId::new(*t, *r)),
            [a, t, r] => Ok(RegisterId([*a, *t, *r])),
            _ => Err(AbcdError::InvalidRegister(s.to_string())),
        }
    }
}

impl Serialize for RegisterId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RegisterId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A validated frame. Immutable once built.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub dest: BusAddr,
    pub source: BusAddr,
    pub pid: u8,
    pub ext: u8,
    pub function: Function,
    pub payload: Payload,
    /// Checksum as carried on the wire (already verified).
    pub crc: u16,
}

impl Frame {
    /// Builds a frame and computes its checksum.
    ///
    /// # Arguments
    ///
    /// * `dest` - Destination address.
    /// * `source` - Source address.
    /// * `function` - Frame kind.
    /// * `payload` - Payload bytes, at most `MAX_PAYLOAD_LEN`.
    ///
    /// # Returns
    ///
    /// The frame, or `BufferOverflow` if the payload is too long.
    pub fn new(
        dest: BusAddr,
        source: BusAddr,
        function: Function,
        payload: &[u8],
    ) -> Result<Self, AbcdError> {
        let mut buf = Payload::new();
        buf.try_extend_from_slice(payload).map_err(|_| AbcdError::BufferOverflow {
            needed: payload.len(),
            got: MAX_PAYLOAD_LEN,
        })?;
        let mut frame = Frame { dest, source, pid: 0, ext: 0, function, payload: buf, crc: 0 };
        let bytes = frame.encode();
        frame.crc = calculate_crc16(&bytes[..bytes.len() - CRC_LEN]);
        Ok(frame)
    }

    /// Builds a frame from wire bytes whose checksum has already been verified.
    ///
    /// Only the structural layout is checked here: the header must be present
    /// and the declared length must match `bytes.len()`.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, AbcdError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(AbcdError::BufferOverflow { needed: MIN_FRAME_LEN, got: bytes.len() });
        }
        let declared = bytes[LENGTH_OFFSET] as usize;
        if declared + MIN_FRAME_LEN != bytes.len() {
            return Err(AbcdError::LengthMismatch {
                declared,
                rule: "frame length does not match length byte",
            });
        }
        let mut payload = Payload::new();
        // Cannot fail, `declared` is a u8.
        let _ = payload.try_extend_from_slice(&bytes[HEADER_LEN..HEADER_LEN + declared]);

        Ok(Frame {
            dest: BusAddr::new(bytes[DEST_OFFSET], bytes[DEST_OFFSET + 1]),
            source: BusAddr::new(bytes[SOURCE_OFFSET], bytes[SOURCE_OFFSET + 1]),
            pid: bytes[PID_OFFSET],
            ext: bytes[EXT_OFFSET],
            function: Function::from(bytes[FUNCTION_OFFSET]),
            payload,
            crc: decode_crc([bytes[bytes.len() - CRC_LEN], bytes[bytes.len() - 1]]),
        })
    }

    /// Serializes the frame, checksum included, into wire bytes.
    pub fn encode(&self) -> ArrayVec<u8, MAX_FRAME_LEN> {
        let mut out = ArrayVec::<u8, MAX_FRAME_LEN>::new();
        out.extend(self.dest.to_bytes());
        out.extend(self.source.to_bytes());
        out.push(self.payload.len() as u8);
        out.push(self.pid);
        out.push(self.ext);
        out.push(self.function.as_u8());
        out.extend(self.payload.iter().copied());
        out.extend(encode_crc(self.crc));
        out
    }

    /// Length on the wire, header and checksum included.
    pub fn wire_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len()
    }

    /// Register id for READ, WRITE and ACK06 frames.
    pub fn register(&self) -> Option<RegisterId> {
        if self.function.carries_register() {
            RegisterId::from_payload(&self.payload)
        } else {
            None
        }
    }

    /// Payload bytes after the register id (the register data itself).
    pub fn register_data(&self) -> &[u8] {
        if self.register().is_some() {
            &self.payload[3..]
        } else {
            &[]
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "to {} from {} len {} {}",
            self.dest,
            self.source,
            self.payload.len(),
            self.function
        )?;
        match self.register() {
            Some(reg) => {
                write!(f, " reg {}", reg)?;
                if !self.register_data().is_empty() {
                    write!(f, " {}", hex::encode(self.register_data()))?;
                }
            }
            None if !self.payload.is_empty() => write!(f, " {}", hex::encode(&self.payload))?,
            None => {}
        }
        Ok(())
    }
}
