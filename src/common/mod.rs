// src/common/mod.rs

// --- Declare all public modules within common ---
pub mod address;
pub mod config;
pub mod crc;
pub mod error;
pub mod frame;
pub mod hal_traits;
pub mod timing;
pub mod types;

// --- Re-export key types/traits/functions for easier access ---

// From address.rs
pub use address::{BusAddr, DeviceClass};

// From config.rs
pub use config::{ChecksumScheme, MonitorConfig};

// From crc.rs
pub use crc::{
    calculate_crc16, decode_crc, encode_crc, Crc16Arc, FrameChecksum,
};

// From error.rs
pub use error::{AbcdError, RejectReason, Result};

// From frame.rs
pub use frame::{
    Frame, Function, Payload, RegisterId, CRC_LEN, HEADER_LEN, MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
    MIN_FRAME_LEN,
};

// From hal_traits.rs
pub use hal_traits::{BusSerial, ReplaySerial};

// From types.rs
pub use types::{FanMode, FieldValue, HvacMode, ZoneSet};
