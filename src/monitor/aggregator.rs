// src/monitor/aggregator.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::archive::{ArchiveRecord, ArchiveSender};
use crate::common::{BusAddr, FieldValue, Function, HvacMode};
use crate::decoder::DecodedRecord;

/// Latest value of one field and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldEntry {
    pub value: FieldValue,
    pub updated_at: DateTime<Utc>,
}

/// Last known value of every field ever observed, keyed by
/// `(source address, field name)`. Entries are overwritten, never removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquipmentState {
    fields: BTreeMap<(BusAddr, String), FieldEntry>,
}

impl EquipmentState {
    pub fn get(&self, device: BusAddr, field: &str) -> Option<&FieldEntry> {
        self.fields.get(&(device, field.to_string()))
    }

    pub fn value(&self, device: BusAddr, field: &str) -> Option<&FieldValue> {
        self.get(device, field).map(|entry| &entry.value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields ordered by device, then name.
    pub fn iter(&self) -> impl Iterator<Item = (BusAddr, &str, &FieldEntry)> {
        self.fields.iter().map(|((addr, name), entry)| (*addr, name.as_str(), entry))
    }

    /// Fields reported by one device.
    pub fn device(&self, device: BusAddr) -> impl Iterator<Item = (&str, &FieldEntry)> {
        self.iter().filter(move |(addr, _, _)| *addr == device).map(|(_, name, entry)| (name, entry))
    }

    /// Operating state derived from the `mode` and `stage` fields: the stage
    /// number, negated while cooling. Stamped with the older of the two.
    pub fn hvac_state(&self, device: BusAddr) -> Option<FieldEntry> {
        let mode = self.get(device, "mode")?;
        let stage = self.get(device, "stage")?;
        let (FieldValue::Mode(hvac_mode), FieldValue::Unsigned(stage_number)) = (&mode.value, &stage.value) else {
            return None;
        };
        let stage_number = *stage_number as i64;
        let state = if *hvac_mode == HvacMode::Cool { -stage_number } else { stage_number };
        Some(FieldEntry {
            value: FieldValue::Signed(state),
            updated_at: mode.updated_at.min(stage.updated_at),
        })
    }

    fn update(&mut self, device: BusAddr, name: &str, value: FieldValue, updated_at: DateTime<Utc>) {
        match self.fields.get_mut(&(device, name.to_string())) {
            Some(entry) => {
                entry.value = value;
                entry.updated_at = updated_at;
            }
            None => {
                self.fields.insert((device, name.to_string()), FieldEntry { value, updated_at });
            }
        }
    }
}

/// What the bus has seen of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEntry {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Frames sent by the device, per function.
    pub frames: BTreeMap<Function, u64>,
}

impl DeviceEntry {
    pub fn total_frames(&self) -> u64 {
        self.frames.values().sum()
    }
}

/// Every device that has sent a frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDirectory {
    devices: BTreeMap<BusAddr, DeviceEntry>,
}

impl DeviceDirectory {
    pub fn get(&self, device: BusAddr) -> Option<&DeviceEntry> {
        self.devices.get(&device)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BusAddr, &DeviceEntry)> {
        self.devices.iter().map(|(addr, entry)| (*addr, entry))
    }

    fn observe(&mut self, device: BusAddr, function: Function, at: DateTime<Utc>) {
        let entry = self.devices.entry(device).or_insert_with(|| DeviceEntry {
            first_seen: at,
            last_seen: at,
            frames: BTreeMap::new(),
        });
        entry.last_seen = at;
        *entry.frames.entry(function).or_insert(0) += 1;
    }
}

#[derive(Debug, Default)]
struct Store {
    state: EquipmentState,
    devices: DeviceDirectory,
}

/// Single-writer store of equipment state.
///
/// The decode task calls [`apply`](Self::apply); any number of readers call
/// [`snapshot`](Self::snapshot). Each record is applied under one write lock,
/// so a snapshot reflects whole records only.
#[derive(Debug, Default)]
pub struct StateAggregator {
    store: RwLock<Store>,
    archive: Option<ArchiveSender>,
    applied: AtomicU64,
}

impl StateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregator that also forwards WRITE and ACK06 records to `archive`.
    pub fn with_archive(archive: ArchiveSender) -> Self {
        StateAggregator { archive: Some(archive), ..Self::default() }
    }

    /// Merges every field of `record` into the state under the frame's
    /// source address, then offers archived frame kinds to the archive.
    pub fn apply(&self, record: &DecodedRecord) {
        let source = record.frame.source;
        {
            let mut store = self.store.write();
            for field in record.fields() {
                store.state.update(source, &field.name, field.value.clone(), record.received_at);
            }
            store.devices.observe(source, record.frame.function, record.received_at);
        }
        self.applied.fetch_add(1, Ordering::Relaxed);

        if let (Some(archive), Some(archived)) = (&self.archive, ArchiveRecord::from_record(record)) {
            if let Err(e) = archive.offer(archived) {
                debug!(error = %e, %source, "Archive offer failed");
            }
        }
    }

    /// Point-in-time copy of the equipment state.
    pub fn snapshot(&self) -> EquipmentState {
        self.store.read().state.clone()
    }

    pub fn devices(&self) -> DeviceDirectory {
        self.store.read().devices.clone()
    }

    pub fn archive(&self) -> Option<&ArchiveSender> {
        self.archive.as_ref()
    }

    /// Records applied since creation.
    pub fn records_applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Frame, MonitorConfig};
    use crate::decoder::{BusDecoder, DecodeTable, FieldKind, FieldSpec, RegisterInfo};
    use crate::monitor::archive::archive_channel;
    use chrono::Duration;
    use std::sync::Arc;

    const AIR_HANDLER: BusAddr = BusAddr::new(0x40, 0x01);

    fn blower_record(rpm: u16, at: DateTime<Utc>) -> DecodedRecord {
        let [hi, lo] = rpm.to_be_bytes();
        let payload = [0x00, 0x03, 0x06, 0x00, hi, lo, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08];
        let bytes = Frame::new(BusAddr::THERMOSTAT, AIR_HANDLER, Function::Ack06, &payload)
            .unwrap()
            .encode();
        let mut dec = BusDecoder::new(&MonitorConfig::default()).unwrap();
        dec.push(&bytes);
        dec.poll_record(at).unwrap()
    }

    #[test]
    fn test_apply_keys_by_source() {
        let agg = StateAggregator::new();
        let now = Utc::now();
        agg.apply(&blower_record(402, now));
        let state = agg.snapshot();
        assert_eq!(state.value(AIR_HANDLER, "blower_rpm"), Some(&FieldValue::Unsigned(402)));
        assert_eq!(state.value(AIR_HANDLER, "blower_state"), Some(&FieldValue::Unsigned(8)));
        assert_eq!(state.get(AIR_HANDLER, "blower_rpm").unwrap().updated_at, now);
        assert!(state.value(BusAddr::THERMOSTAT, "blower_rpm").is_none());
        assert_eq!(state.device(AIR_HANDLER).count(), 2);
    }

    #[test]
    fn test_apply_is_idempotent_except_timestamp() {
        let first = Utc::now();
        let once = StateAggregator::new();
        once.apply(&blower_record(402, first));

        let twice = StateAggregator::new();
        let record = blower_record(402, first);
        twice.apply(&record);
        let later = DecodedRecord { received_at: first + Duration::seconds(5), ..record };
        twice.apply(&later);

        let a = once.snapshot();
        let b = twice.snapshot();
        assert_eq!(a.len(), b.len());
        for (addr, name, entry) in a.iter() {
            let other = b.get(addr, name).unwrap();
            assert_eq!(entry.value, other.value);
            assert_eq!(other.updated_at, later.received_at);
        }
    }

    #[test]
    fn test_last_write_wins() {
        let agg = StateAggregator::new();
        let start = Utc::now();
        for (i, rpm) in [100u16, 250, 402, 560].into_iter().enumerate() {
            agg.apply(&blower_record(rpm, start + Duration::seconds(i as i64)));
        }
        let state = agg.snapshot();
        assert_eq!(state.value(AIR_HANDLER, "blower_rpm"), Some(&FieldValue::Unsigned(560)));
        assert_eq!(state.get(AIR_HANDLER, "blower_rpm").unwrap().updated_at, start + Duration::seconds(3));
        assert_eq!(agg.records_applied(), 4);
    }

    #[test]
    fn test_write_from_unlisted_device() {
        let mut table = DecodeTable::empty("probe");
        table.insert(RegisterInfo::new(0x05, 0x01, "Probe", vec![FieldSpec::u8("temperature")]));
        let config = MonitorConfig { strict_addresses: false, ..MonitorConfig::default() };
        let mut dec = BusDecoder::with_table(&config, table);
        let probe = BusAddr::new(0x05, 0x0f);
        let frame = Frame::new(BusAddr::THERMOSTAT, probe, Function::Write, &[0x00, 0x05, 0x01, 0x42]).unwrap();
        dec.push(&frame.encode());

        let agg = StateAggregator::new();
        agg.apply(&dec.poll_record(Utc::now()).unwrap());
        assert_eq!(agg.snapshot().value(probe, "temperature"), Some(&FieldValue::Unsigned(66)));
    }

    fn mode_record(raw: u8, at: DateTime<Utc>) -> DecodedRecord {
        let mut table = DecodeTable::empty("probe");
        table.insert(RegisterInfo::new(0x05, 0x03, "Mode", vec![FieldSpec::new("mode", FieldKind::ModeStage)]));
        let mut dec = BusDecoder::with_table(&MonitorConfig::default(), table);
        let frame = Frame::new(AIR_HANDLER, BusAddr::THERMOSTAT, Function::Write, &[0x00, 0x05, 0x03, raw]).unwrap();
        dec.push(&frame.encode());
        dec.poll_record(at).unwrap()
    }

    #[test]
    fn test_hvac_state_signed_by_mode() {
        let agg = StateAggregator::new();
        let start = Utc::now();
        assert!(agg.snapshot().hvac_state(BusAddr::THERMOSTAT).is_none());

        // Cool (1), stage 2.
        agg.apply(&mode_record(0x41, start));
        let state = agg.snapshot().hvac_state(BusAddr::THERMOSTAT).unwrap();
        assert_eq!(state.value, FieldValue::Signed(-2));
        assert_eq!(state.updated_at, start);

        // Heat (0), stage 1.
        agg.apply(&mode_record(0x20, start + Duration::seconds(1)));
        let state = agg.snapshot().hvac_state(BusAddr::THERMOSTAT).unwrap();
        assert_eq!(state.value, FieldValue::Signed(1));

        // Off (5), stage 0.
        agg.apply(&mode_record(0x05, start + Duration::seconds(2)));
        let state = agg.snapshot().hvac_state(BusAddr::THERMOSTAT).unwrap();
        assert_eq!(state.value, FieldValue::Signed(0));
        assert!(agg.snapshot().hvac_state(AIR_HANDLER).is_none());
    }

    #[test]
    fn test_device_directory_counts_frames() {
        let agg = StateAggregator::new();
        let now = Utc::now();
        agg.apply(&blower_record(402, now));
        agg.apply(&blower_record(402, now + Duration::seconds(1)));
        let devices = agg.devices();
        assert_eq!(devices.len(), 1);
        let entry = devices.get(AIR_HANDLER).unwrap();
        assert_eq!(entry.frames.get(&Function::Ack06), Some(&2));
        assert_eq!(entry.total_frames(), 2);
        assert_eq!(entry.first_seen, now);
        assert_eq!(entry.last_seen, now + Duration::seconds(1));
    }

    #[test]
    fn test_archive_forwarding() {
        let (sender, mut rx) = archive_channel(4);
        let agg = StateAggregator::with_archive(sender);
        agg.apply(&blower_record(402, Utc::now()));
        let archived = rx.try_recv().unwrap();
        assert_eq!(archived.function, Function::Ack06);
        assert_eq!(archived.source, AIR_HANDLER);

        drop(rx);
        agg.apply(&blower_record(560, Utc::now()));
        assert_eq!(agg.snapshot().value(AIR_HANDLER, "blower_rpm"), Some(&FieldValue::Unsigned(560)));
        assert_eq!(agg.archive().unwrap().unavailable(), 1);
    }

    #[test]
    fn test_snapshot_while_applying() {
        let agg = Arc::new(StateAggregator::new());
        let writer = {
            let agg = Arc::clone(&agg);
            std::thread::spawn(move || {
                for rpm in 0..500u16 {
                    agg.apply(&blower_record(rpm, Utc::now()));
                }
            })
        };
        for _ in 0..100 {
            let state = agg.snapshot();
            // Both fields of a record land together.
            assert!(state.is_empty() || state.len() == 2);
        }
        writer.join().unwrap();
        assert_eq!(agg.snapshot().value(AIR_HANDLER, "blower_rpm"), Some(&FieldValue::Unsigned(499)));
    }
}
