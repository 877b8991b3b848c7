// src/monitor/archive.rs

//! Side channel carrying WRITE and ACK06 frames to external storage.
//!
//! The decode task only ever calls [`ArchiveSender::offer`], which never
//! waits. A full queue drops the record; a closed queue means the consumer is
//! gone. Both are counted and neither reaches the decoder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{AbcdError, BusAddr, Function, RegisterId, Result};
use crate::decoder::DecodedRecord;

/// Serializable copy of one archived frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveRecord {
    pub timestamp: DateTime<Utc>,
    pub dest: BusAddr,
    pub source: BusAddr,
    pub function: Function,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<RegisterId>,
    /// Payload as lower-case hex, register id included.
    pub payload: String,
    pub crc: u16,
}

impl ArchiveRecord {
    /// Builds the archive copy of `record`, or `None` for frame kinds that
    /// are not archived.
    pub fn from_record(record: &DecodedRecord) -> Option<Self> {
        let frame = &record.frame;
        if !frame.function.is_archived() {
            return None;
        }
        Some(ArchiveRecord {
            timestamp: record.received_at,
            dest: frame.dest,
            source: frame.source,
            function: frame.function,
            register: frame.register(),
            payload: hex::encode(&frame.payload),
            crc: frame.crc,
        })
    }
}

#[derive(Debug, Default)]
struct ArchiveCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    unavailable: AtomicU64,
}

/// Producer half of the archive channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ArchiveSender {
    tx: mpsc::Sender<ArchiveRecord>,
    counters: Arc<ArchiveCounters>,
}

/// Creates a bounded archive channel holding at most `capacity` records.
pub fn archive_channel(capacity: usize) -> (ArchiveSender, mpsc::Receiver<ArchiveRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ArchiveSender { tx, counters: Arc::default() }, rx)
}

impl ArchiveSender {
    /// Queues `record` without waiting.
    ///
    /// # Returns
    ///
    /// * `Ok(())` if the record was queued, or dropped because the queue is full.
    /// * `Err(AbcdError::ArchiveUnavailable)` if the consumer has gone away.
    pub fn offer(&self, record: ArchiveRecord) -> Result<()> {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(record)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if dropped == 0 {
                    warn!(source = %record.source, "Archive queue full, dropping records");
                } else {
                    debug!(source = %record.source, "Archive record dropped");
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                let lost = self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
                if lost == 0 {
                    warn!("Archive consumer gone, records are no longer archived");
                }
                Err(AbcdError::ArchiveUnavailable)
            }
        }
    }

    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Records lost because the consumer was gone.
    pub fn unavailable(&self) -> u64 {
        self.counters.unavailable.load(Ordering::Relaxed)
    }
}

/// Spawns a task writing each archive record as one JSON line to `writer`.
///
/// The task ends when every sender is dropped, returning the number of
/// records written. A write failure ends it early; later offers then see
/// `ArchiveUnavailable`.
pub fn spawn_archive_writer<W>(rx: mpsc::Receiver<ArchiveRecord>, writer: W) -> JoinHandle<Result<u64>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(write_archive(rx, writer))
}

async fn write_archive<W>(mut rx: mpsc::Receiver<ArchiveRecord>, mut writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(record) = rx.recv().await {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        if let Err(e) = write_line(&mut writer, &line).await {
            warn!(error = %e, written, "Archive write failed, closing archive");
            rx.close();
            return Err(e.into());
        }
        written += 1;
    }
    writer.flush().await?;
    info!(written, "Archive writer finished");
    Ok(written)
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}
