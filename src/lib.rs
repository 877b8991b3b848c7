// src/lib.rs

//! Decoder for the ABCD bus, the RS-485 link between the modules of
//! Carrier Infinity / Bryant Evolution HVAC systems.
//!
//! The crate never transmits. It listens to the bus, re-finds frame
//! boundaries in the raw byte stream, validates and classifies each frame,
//! and folds decoded register values into a queryable equipment state that
//! can be rendered as line-oriented metrics.

pub mod common;
pub mod decoder;
pub mod monitor;

// Re-export key types for convenience
pub use common::{AbcdError, BusAddr, Frame, Function};
pub use decoder::BusDecoder;
pub use monitor::{BusMonitor, MetricsExporter, StateAggregator};
