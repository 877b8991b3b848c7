// src/monitor/mod.rs

//! Async service layer around the decoder.
//!
//! One [`BusMonitor`] task owns the transport and feeds records, in arrival
//! order, to a shared [`StateAggregator`]. The [`MetricsExporter`] and the
//! archive writer only read from it and never hold up decoding.

pub mod aggregator;
pub mod archive;
pub mod exporter;
pub mod pipeline;
pub mod transport;

pub use aggregator::{DeviceDirectory, DeviceEntry, EquipmentState, FieldEntry, StateAggregator};
pub use archive::{archive_channel, spawn_archive_writer, ArchiveRecord, ArchiveSender};
pub use exporter::MetricsExporter;
pub use pipeline::{BusMonitor, Health, PipelineStatus};
pub use transport::{open_transport, Transport, TransportUri};
