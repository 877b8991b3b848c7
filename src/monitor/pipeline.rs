// src/monitor/pipeline.rs

//! The decode task: one sequential loop owning the transport.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::StateAggregator;
use super::exporter::MetricsExporter;
use crate::common::timing::READ_CHUNK;
use crate::common::{AbcdError, MonitorConfig, Result};
use crate::decoder::{BusDecoder, DecodeTable, DecodedRecord, DecoderStats};

/// Health of the decode task as seen from outside.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum Health {
    /// Reading, no frame found yet.
    #[default]
    Starting,
    Synchronized,
    /// Lost frame alignment after having had it.
    Resynchronizing,
    /// Shut down on request.
    Stopped,
    /// The transport failed or closed.
    Failed(String),
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Starting => "starting",
            Health::Synchronized => "synchronized",
            Health::Resynchronizing => "resynchronizing",
            Health::Stopped => "stopped",
            Health::Failed(_) => "failed",
        }
    }

    /// Whether the decode task is still consuming bytes.
    pub fn is_running(&self) -> bool {
        matches!(self, Health::Starting | Health::Synchronized | Health::Resynchronizing)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Decoder statistics and health, published by the decode task after each
/// transport read and readable from any thread.
#[derive(Debug, Default)]
pub struct PipelineStatus {
    health: RwLock<Health>,
    bytes_received: AtomicU64,
    bytes_skipped: AtomicU64,
    frames: AtomicU64,
    opaque_frames: AtomicU64,
    rejected_checksum: AtomicU64,
    rejected_length: AtomicU64,
    rejected_address: AtomicU64,
    desyncs: AtomicU64,
    transport_gaps: AtomicU64,
    bytes_lost: AtomicU64,
    reconnects: AtomicU64,
}

impl PipelineStatus {
    pub fn health(&self) -> Health {
        self.health.read().clone()
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            opaque_frames: self.opaque_frames.load(Ordering::Relaxed),
            rejected_checksum: self.rejected_checksum.load(Ordering::Relaxed),
            rejected_length: self.rejected_length.load(Ordering::Relaxed),
            rejected_address: self.rejected_address.load(Ordering::Relaxed),
            desyncs: self.desyncs.load(Ordering::Relaxed),
            transport_gaps: self.transport_gaps.load(Ordering::Relaxed),
            bytes_lost: self.bytes_lost.load(Ordering::Relaxed),
        }
    }

    /// Times the transport was reopened after a failure.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn publish(&self, stats: &DecoderStats) {
        self.bytes_received.store(stats.bytes_received, Ordering::Relaxed);
        self.bytes_skipped.store(stats.bytes_skipped, Ordering::Relaxed);
        self.frames.store(stats.frames, Ordering::Relaxed);
        self.opaque_frames.store(stats.opaque_frames, Ordering::Relaxed);
        self.rejected_checksum.store(stats.rejected_checksum, Ordering::Relaxed);
        self.rejected_length.store(stats.rejected_length, Ordering::Relaxed);
        self.rejected_address.store(stats.rejected_address, Ordering::Relaxed);
        self.desyncs.store(stats.desyncs, Ordering::Relaxed);
        self.transport_gaps.store(stats.transport_gaps, Ordering::Relaxed);
        self.bytes_lost.store(stats.bytes_lost, Ordering::Relaxed);
    }

    /// Returns true if the health changed.
    fn set_health(&self, health: Health) -> bool {
        let mut current = self.health.write();
        if *current == health {
            return false;
        }
        *current = health;
        true
    }
}

type RecordHook = Box<dyn FnMut(&DecodedRecord) + Send>;

/// Runs the decode pipeline over one transport connection at a time.
pub struct BusMonitor {
    config: Arc<MonitorConfig>,
    decoder: BusDecoder,
    aggregator: Arc<StateAggregator>,
    status: Arc<PipelineStatus>,
    on_record: Option<RecordHook>,
}

impl BusMonitor {
    pub fn new(config: Arc<MonitorConfig>, aggregator: Arc<StateAggregator>) -> Result<Self> {
        let decoder = BusDecoder::new(&config)?;
        Ok(Self::from_decoder(config, decoder, aggregator))
    }

    pub fn with_table(config: Arc<MonitorConfig>, table: DecodeTable, aggregator: Arc<StateAggregator>) -> Self {
        let decoder = BusDecoder::with_table(&config, table);
        Self::from_decoder(config, decoder, aggregator)
    }

    fn from_decoder(config: Arc<MonitorConfig>, decoder: BusDecoder, aggregator: Arc<StateAggregator>) -> Self {
        BusMonitor { config, decoder, aggregator, status: Arc::default(), on_record: None }
    }

    /// Calls `hook` with every decoded record, including records from
    /// devices outside the configured address list.
    pub fn on_record(mut self, hook: impl FnMut(&DecodedRecord) + Send + 'static) -> Self {
        self.on_record = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &Arc<MonitorConfig> {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<StateAggregator> {
        &self.aggregator
    }

    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// Exporter over this monitor's state, health and statistics.
    pub fn exporter(&self) -> MetricsExporter {
        MetricsExporter::new(Arc::clone(&self.aggregator), self.config.staleness())
            .with_status(self.status())
            .with_listener(self.config.name.clone())
    }

    /// Reads `reader` until it ends, fails, or `cancel` fires.
    ///
    /// # Returns
    ///
    /// * `Ok(())` after cancellation. Buffered bytes are dropped undecoded.
    /// * `Err(AbcdError::TransportClosed)` when the transport reaches end of
    ///   stream. Buffered bytes are decoded first.
    /// * `Err(AbcdError::Io(_))` when a read fails. Buffered bytes are decoded first.
    ///
    /// Decoder state is kept across calls, so the caller may reconnect and
    /// run again with a new transport.
    pub async fn run<R>(&mut self, mut reader: R, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        info!(listener = %self.config.name, "Decode task started");
        let leftover = self.decoder.reopen();
        if leftover > 0 {
            debug!(leftover, "Dropped bytes from previous connection");
        }
        self.refresh_health();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let dropped = self.decoder.discard();
                    self.finish(Health::Stopped);
                    info!(listener = %self.config.name, dropped, "Decode task cancelled");
                    return Ok(());
                }
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    self.decoder.close();
                    self.drain();
                    self.finish(Health::Failed(AbcdError::TransportClosed.to_string()));
                    warn!(listener = %self.config.name, "Transport closed");
                    return Err(AbcdError::TransportClosed);
                }
                Ok(n) => {
                    self.decoder.push(&buf[..n]);
                    self.drain();
                    self.status.publish(&self.decoder.stats());
                    self.refresh_health();
                }
                Err(e) => {
                    self.decoder.close();
                    self.drain();
                    self.finish(Health::Failed(e.to_string()));
                    warn!(listener = %self.config.name, error = %e, "Transport read failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn drain(&mut self) {
        loop {
            match self.decoder.poll_record(Utc::now()) {
                Ok(record) => {
                    if let Some(hook) = self.on_record.as_mut() {
                        hook(&record);
                    }
                    if self.config.is_of_interest(record.frame.source) {
                        self.aggregator.apply(&record);
                    }
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(never)) => match never {},
            }
        }
    }

    fn refresh_health(&self) {
        let health = if self.decoder.is_synchronized() {
            Health::Synchronized
        } else if self.decoder.ever_synchronized() {
            Health::Resynchronizing
        } else {
            Health::Starting
        };
        if self.status.set_health(health.clone()) {
            debug!(listener = %self.config.name, %health, "Health changed");
        }
    }

    fn finish(&self, health: Health) {
        self.status.publish(&self.decoder.stats());
        self.status.set_health(health);
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BusAddr, FieldValue, Frame, Function};
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    const AIR_HANDLER: BusAddr = BusAddr::new(0x40, 0x01);

    fn blower_ack(rpm: u16) -> Vec<u8> {
        let [hi, lo] = rpm.to_be_bytes();
        let payload = [0x00, 0x03, 0x06, 0x00, hi, lo, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08];
        Frame::new(BusAddr::THERMOSTAT, AIR_HANDLER, Function::Ack06, &payload)
            .unwrap()
            .encode()
            .to_vec()
    }

    fn monitor(config: MonitorConfig) -> BusMonitor {
        BusMonitor::new(Arc::new(config), Arc::new(StateAggregator::new())).unwrap()
    }

    #[test]
    fn test_health_display() {
        assert_eq!(Health::Synchronized.to_string(), "synchronized");
        assert_eq!(Health::Failed("Transport closed".into()).to_string(), "failed: Transport closed");
        assert!(Health::Resynchronizing.is_running());
        assert!(!Health::Stopped.is_running());
    }

    #[tokio::test]
    async fn test_end_of_stream_drains_and_fails() {
        let mut mon = monitor(MonitorConfig::default());
        let mut bytes = vec![0x00, 0xff, 0x13];
        bytes.extend(blower_ack(402));
        bytes.extend(blower_ack(560));

        let result = mon.run(&bytes[..], CancellationToken::new()).await;
        assert!(matches!(result, Err(AbcdError::TransportClosed)));
        assert_eq!(mon.status().health(), Health::Failed("Transport closed".into()));
        assert_eq!(
            mon.aggregator().snapshot().value(AIR_HANDLER, "blower_rpm"),
            Some(&FieldValue::Unsigned(560))
        );
        let stats = mon.status().stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.bytes_received, bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_addresses_of_interest_filter_aggregation() {
        let config = MonitorConfig { addresses: vec![BusAddr::THERMOSTAT], ..MonitorConfig::default() };
        let seen = Arc::new(Mutex::new(0));
        let mut mon = monitor(config).on_record({
            let seen = Arc::clone(&seen);
            move |_: &DecodedRecord| *seen.lock().unwrap() += 1
        });
        let bytes = blower_ack(402);
        let _ = mon.run(&bytes[..], CancellationToken::new()).await;
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(mon.aggregator().snapshot().is_empty());
        assert_eq!(mon.aggregator().devices().len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_frame() {
        let mut mon = monitor(MonitorConfig::default());
        let status = mon.status();
        let (mut tx, rx) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let frame = blower_ack(402);
        tx.write_all(&frame).await.unwrap();
        tx.write_all(&frame[..7]).await.unwrap();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = mon.run(rx, cancel).await;
                (mon, result)
            })
        };
        while status.stats().frames < 1 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let (mon, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(status.health(), Health::Stopped);
        assert_eq!(mon.aggregator().snapshot().len(), 2);
        drop(tx);
    }

    #[test]
    fn test_reconnects_counted() {
        let status = PipelineStatus::default();
        assert_eq!(status.reconnects(), 0);
        status.note_reconnect();
        status.note_reconnect();
        assert_eq!(status.reconnects(), 2);
    }

    #[tokio::test]
    async fn test_exporter_labels_listener() {
        let config = MonitorConfig { name: "attic".to_string(), ..MonitorConfig::default() };
        let mut mon = monitor(config);
        let bytes = blower_ack(402);
        let _ = mon.run(&bytes[..], CancellationToken::new()).await;
        mon.status().note_reconnect();
        let text = mon.exporter().render().unwrap();
        let value_of = |prefix: &str, label: &str| {
            text.lines()
                .find(|line| line.starts_with(prefix) && line.contains(label) && line.contains("name=\"attic\""))
                .and_then(|line| line.rsplit_once(' '))
                .and_then(|(_, value)| value.parse::<f64>().ok())
        };
        assert_eq!(value_of("abcd_reconnects_total{", ""), Some(1.0));
        assert_eq!(value_of("abcd_blower_rpm{", "device=\"4001\""), Some(402.0));
        assert!(!text.contains("name=\"abcd\""));
    }

    #[tokio::test]
    async fn test_run_again_after_reconnect() {
        let mut mon = monitor(MonitorConfig::default());
        let first = blower_ack(402);
        assert!(mon.run(&first[..], CancellationToken::new()).await.is_err());
        let second = blower_ack(560);
        assert!(mon.run(&second[..], CancellationToken::new()).await.is_err());
        assert_eq!(mon.status().stats().frames, 2);
        assert_eq!(
            mon.aggregator().snapshot().value(AIR_HANDLER, "blower_rpm"),
            Some(&FieldValue::Unsigned(560))
        );
    }
}
