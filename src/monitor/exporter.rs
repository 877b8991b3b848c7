// src/monitor/exporter.rs

//! Prometheus exposition of the equipment state.
//!
//! Each fresh field becomes `abcd_<field>{device="<addr>"}`. Text fields
//! become `abcd_<field>_info{device="<addr>",value="<text>"} 1`. Fields
//! older than the staleness threshold are left out entirely. Every series
//! carries the listener `name` label.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::debug;

use super::aggregator::{EquipmentState, FieldEntry, StateAggregator};
use super::pipeline::{Health, PipelineStatus};
use crate::common::{AbcdError, BusAddr, FieldValue, Function, Result};

const NAMESPACE: &str = "abcd";

/// Renders snapshots of a [`StateAggregator`] on demand.
///
/// A fresh [`Registry`] is built per render, so series for fields that went
/// stale simply disappear.
#[derive(Debug, Clone)]
pub struct MetricsExporter {
    aggregator: Arc<StateAggregator>,
    staleness: Duration,
    status: Option<Arc<PipelineStatus>>,
    listener: String,
}

impl MetricsExporter {
    pub fn new(aggregator: Arc<StateAggregator>, staleness: Duration) -> Self {
        MetricsExporter { aggregator, staleness, status: None, listener: "abcd".to_string() }
    }

    /// Also export decoder health and statistics.
    pub fn with_status(mut self, status: Arc<PipelineStatus>) -> Self {
        self.status = Some(status);
        self
    }

    /// Value of the `name` label on every series.
    pub fn with_listener(mut self, name: impl Into<String>) -> Self {
        self.listener = name.into();
        self
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    pub fn render(&self) -> Result<String> {
        self.render_at(Utc::now())
    }

    /// Renders with staleness judged against `now`.
    pub fn render_at(&self, now: DateTime<Utc>) -> Result<String> {
        let labels = HashMap::from([("name".to_string(), self.listener.clone())]);
        let registry = Registry::new_custom(None, Some(labels))?;
        if let Some(status) = &self.status {
            register_status(&registry, status)?;
        }
        self.register_archive(&registry)?;
        self.register_devices(&registry)?;

        let snapshot = self.aggregator.snapshot();
        self.register_fields(&registry, &snapshot, now);
        self.register_hvac_state(&registry, &snapshot, now)?;

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| AbcdError::Metrics(prometheus::Error::Msg(e.to_string())))
    }

    /// Whether `entry` is recent enough to export. Timestamps in the future
    /// count as fresh.
    pub fn is_fresh(&self, entry: &FieldEntry, now: DateTime<Utc>) -> bool {
        match (now - entry.updated_at).to_std() {
            Ok(age) => age <= self.staleness,
            Err(_) => true,
        }
    }

    fn register_archive(&self, registry: &Registry) -> Result<()> {
        let Some(archive) = self.aggregator.archive() else {
            return Ok(());
        };
        let records = IntCounterVec::new(
            Opts::new("archive_records_total", "Records offered to the archive").namespace(NAMESPACE),
            &["outcome"],
        )?;
        for (outcome, count) in [
            ("queued", archive.sent()),
            ("dropped", archive.dropped()),
            ("unavailable", archive.unavailable()),
        ] {
            records.get_metric_with_label_values(&[outcome])?.inc_by(count);
        }
        registry.register(Box::new(records))?;
        Ok(())
    }

    fn register_devices(&self, registry: &Registry) -> Result<()> {
        let devices = self.aggregator.devices();
        if devices.is_empty() {
            return Ok(());
        }
        let frames = IntCounterVec::new(
            Opts::new("device_frames_total", "Frames sent per device and function").namespace(NAMESPACE),
            &["device", "class", "function"],
        )?;
        for (addr, entry) in devices.iter() {
            let device = addr.to_string();
            let class = device_class(addr);
            for (function, count) in &entry.frames {
                let function = function_label(*function);
                frames.get_metric_with_label_values(&[device.as_str(), class, function.as_str()])?.inc_by(*count);
            }
        }
        registry.register(Box::new(frames))?;
        Ok(())
    }

    fn register_fields(&self, registry: &Registry, snapshot: &EquipmentState, now: DateTime<Utc>) {
        // One vector per metric name, so each name is declared once.
        let mut families: BTreeMap<String, GaugeVec> = BTreeMap::new();
        for (addr, name, entry) in snapshot.iter() {
            if !self.is_fresh(entry, now) {
                continue;
            }
            let device = addr.to_string();
            let base = metric_name(name);
            let (family, labels, value) = match entry.value.as_metric() {
                Some(value) => (base, vec![device], value),
                None => {
                    let text = entry.value.as_text().unwrap_or_default();
                    (format!("{}_info", base), vec![device, text], 1.0)
                }
            };
            if !families.contains_key(&family) {
                let label_names: &[&str] = if labels.len() == 1 { &["device"] } else { &["device", "value"] };
                let opts = Opts::new(family.clone(), format!("Last reported {}", name)).namespace(NAMESPACE);
                match GaugeVec::new(opts, label_names) {
                    Ok(gauges) => {
                        families.insert(family.clone(), gauges);
                    }
                    Err(e) => {
                        debug!(field = name, error = %e, "Field not exported");
                        continue;
                    }
                }
            }
            let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
            match families[&family].get_metric_with_label_values(&labels) {
                Ok(gauge) => gauge.set(value),
                Err(e) => debug!(field = name, device = %addr, error = %e, "Field not exported"),
            }
        }
        for (family, gauges) in families {
            if let Err(e) = registry.register(Box::new(gauges)) {
                debug!(family = %family, error = %e, "Field family not exported");
            }
        }
    }

    /// Signed operating state per device, plus one `state` series per
    /// possible value with the current one set to 1.
    fn register_hvac_state(&self, registry: &Registry, snapshot: &EquipmentState, now: DateTime<Utc>) -> Result<()> {
        let mut states = Vec::new();
        for (addr, name, _) in snapshot.iter() {
            if name != "mode" {
                continue;
            }
            if let Some(entry) = snapshot.hvac_state(addr) {
                if let (FieldValue::Signed(state), true) = (&entry.value, self.is_fresh(&entry, now)) {
                    states.push((addr, *state));
                }
            }
        }
        if states.is_empty() {
            return Ok(());
        }

        let signed = GaugeVec::new(
            Opts::new("hvac_state", "Operating stage, negative while cooling").namespace(NAMESPACE),
            &["device"],
        )?;
        let named = GaugeVec::new(
            Opts::new("hvac_state_enum", "Operating state of the system").namespace(NAMESPACE),
            &["device", "state"],
        )?;
        for (addr, state) in states {
            let device = addr.to_string();
            signed.get_metric_with_label_values(&[device.as_str()])?.set(state as f64);
            let current = hvac_state_name(state);
            for candidate in ["off", "heat", "cool"] {
                let gauge = named.get_metric_with_label_values(&[device.as_str(), candidate])?;
                gauge.set(if candidate == current { 1.0 } else { 0.0 });
            }
        }
        registry.register(Box::new(signed))?;
        registry.register(Box::new(named))?;
        Ok(())
    }
}

fn register_status(registry: &Registry, status: &PipelineStatus) -> Result<()> {
    let health = status.health();
    let stats = status.stats();

    let up = IntGauge::with_opts(
        Opts::new("decoder_up", "Whether the decode task is consuming bytes").namespace(NAMESPACE),
    )?;
    up.set(i64::from(health.is_running()));
    registry.register(Box::new(up))?;

    let synchronized = IntGauge::with_opts(
        Opts::new("synchronized", "Whether the byte stream is frame aligned").namespace(NAMESPACE),
    )?;
    synchronized.set(i64::from(health == Health::Synchronized));
    registry.register(Box::new(synchronized))?;

    for (name, help, value) in [
        ("bytes_received_total", "Bytes read from the transport", stats.bytes_received),
        ("bytes_skipped_total", "Bytes discarded as noise", stats.bytes_skipped),
        ("frames_total", "Frames that passed validation", stats.frames),
        ("opaque_frames_total", "Valid frames with no decode table entry", stats.opaque_frames),
        ("desyncs_total", "Times frame alignment was lost", stats.desyncs),
        ("transport_gaps_total", "Gaps reported by the transport", stats.transport_gaps),
        ("bytes_lost_total", "Bytes lost in transport gaps", stats.bytes_lost),
        ("reconnects_total", "Times the transport was reopened", status.reconnects()),
    ] {
        let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
        counter.inc_by(value);
        registry.register(Box::new(counter))?;
    }

    let rejected = IntCounterVec::new(
        Opts::new("frames_rejected_total", "Candidates rejected by the validator").namespace(NAMESPACE),
        &["reason"],
    )?;
    for (reason, count) in [
        ("checksum", stats.rejected_checksum),
        ("length", stats.rejected_length),
        ("address", stats.rejected_address),
    ] {
        rejected.get_metric_with_label_values(&[reason])?.inc_by(count);
    }
    registry.register(Box::new(rejected))?;
    Ok(())
}

/// Field names reduced to `[a-z0-9_]`.
fn metric_name(field: &str) -> String {
    field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn device_class(addr: BusAddr) -> &'static str {
    addr.device_class().map_or("unknown", |class| class.as_str())
}

fn hvac_state_name(state: i64) -> &'static str {
    match state {
        0 => "off",
        s if s < 0 => "cool",
        _ => "heat",
    }
}

fn function_label(function: Function) -> String {
    match function {
        Function::Other(code) => format!("{:#04x}", code),
        known => known.name().to_string(),
    }
}
