// src/decoder/registers.rs

//! Versioned register layouts.
//!
//! Every register the bus is known to carry data for is described as a list
//! of fields at fixed offsets after the three byte register id, optionally
//! followed by a group of fields that repeats until the payload ends.
//! Layouts were worked out from captured traffic, so the table is data, not
//! code: it can be swapped by version or extended at runtime.

use std::collections::BTreeMap;

use crate::common::{AbcdError, RegisterId, Result};

/// Byte order of multi-byte integers.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// How the bytes of one field are interpreted.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FieldKind {
    U8,
    I8,
    U16,
    I16,
    /// Signed 16-bit value in sixteenths of a degree.
    Times16,
    /// NUL-padded UTF-8 of the given width.
    Text(usize),
    /// Thermostat mode byte: low five bits are the mode, the rest the stage.
    ModeStage,
    Fan,
    Zones,
    /// Damper opening 0..=15, reported as a percentage. 0xff = zone not present.
    DamperPosition,
    /// Stage number stored shifted left by one.
    StageShift1,
    /// Unknown bytes. Skipped, no field produced.
    Skip(usize),
}

impl FieldKind {
    /// Bytes taken from the payload.
    pub const fn width(&self) -> usize {
        match self {
            FieldKind::U8
            | FieldKind::I8
            | FieldKind::ModeStage
            | FieldKind::Fan
            | FieldKind::Zones
            | FieldKind::DamperPosition
            | FieldKind::StageShift1 => 1,
            FieldKind::U16 | FieldKind::I16 | FieldKind::Times16 => 2,
            FieldKind::Text(n) | FieldKind::Skip(n) => *n,
        }
    }
}

/// Whether a field appears once or once per zone.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Repeat {
    #[default]
    Once,
    /// Eight consecutive values named `zone1_<name>` .. `zone8_<name>`.
    PerZone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub repeat: Repeat,
    pub order: ByteOrder,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        FieldSpec { name: name.to_string(), kind, repeat: Repeat::Once, order: ByteOrder::Big }
    }

    pub fn u8(name: &str) -> Self {
        Self::new(name, FieldKind::U8)
    }

    pub fn i8(name: &str) -> Self {
        Self::new(name, FieldKind::I8)
    }

    pub fn u16(name: &str) -> Self {
        Self::new(name, FieldKind::U16)
    }

    pub fn times16(name: &str) -> Self {
        Self::new(name, FieldKind::Times16)
    }

    pub fn text(name: &str, width: usize) -> Self {
        Self::new(name, FieldKind::Text(width))
    }

    pub fn skip(width: usize) -> Self {
        Self::new("", FieldKind::Skip(width))
    }

    pub fn per_zone(mut self) -> Self {
        self.repeat = Repeat::PerZone;
        self
    }

    pub fn little_endian(mut self) -> Self {
        self.order = ByteOrder::Little;
        self
    }

    /// Total bytes covered, repetition included.
    pub fn span(&self) -> usize {
        match self.repeat {
            Repeat::Once => self.kind.width(),
            Repeat::PerZone => 8 * self.kind.width(),
        }
    }
}

/// Fields that repeat until the payload runs out, named `<prefix><n>_<field>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatingGroup {
    pub prefix: String,
    pub fields: Vec<FieldSpec>,
}

impl RepeatingGroup {
    pub fn record_len(&self) -> usize {
        self.fields.iter().map(FieldSpec::span).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    pub id: RegisterId,
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub group: Option<RepeatingGroup>,
}

impl RegisterInfo {
    pub fn new(table: u8, register: u8, name: &str, fields: Vec<FieldSpec>) -> Self {
        RegisterInfo { id: RegisterId::new(table, register), name: name.to_string(), fields, group: None }
    }

    pub fn repeating(mut self, prefix: &str, fields: Vec<FieldSpec>) -> Self {
        self.group = Some(RepeatingGroup { prefix: prefix.to_string(), fields });
        self
    }

    /// Bytes covered by the fixed part of the layout.
    pub fn fixed_len(&self) -> usize {
        self.fields.iter().map(FieldSpec::span).sum()
    }
}

/// Register layouts of one version, keyed by register id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeTable {
    version: String,
    registers: BTreeMap<RegisterId, RegisterInfo>,
}

impl DecodeTable {
    pub const VERSIONS: &'static [&'static str] = &["v1"];

    pub fn empty(version: &str) -> Self {
        DecodeTable { version: version.to_string(), registers: BTreeMap::new() }
    }

    /// Looks up a table by version name.
    pub fn for_version(version: &str) -> Result<Self> {
        match version {
            "v1" => Ok(Self::v1()),
            other => Err(AbcdError::Config(format!(
                "unknown decode table version '{}', expected one of {:?}",
                other,
                Self::VERSIONS
            ))),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Adds or replaces a register layout.
    pub fn insert(&mut self, info: RegisterInfo) -> Option<RegisterInfo> {
        self.registers.insert(info.id, info)
    }

    pub fn get(&self, id: &RegisterId) -> Option<&RegisterInfo> {
        self.registers.get(id)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterInfo> {
        self.registers.values()
    }

    /// The registers understood well enough to decode.
    pub fn v1() -> Self {
        use FieldKind::*;
        let mut table = DecodeTable::empty("v1");

        // Table 01: device configuration.
        table.insert(RegisterInfo::new(0x01, 0x02, "AddressInfo", vec![
            FieldSpec::u8("device_class"),
            FieldSpec::u8("device_bus"),
            FieldSpec::skip(1),
        ]));
        table.insert(RegisterInfo::new(0x01, 0x04, "DeviceInfo", vec![
            FieldSpec::text("module", 48),
            FieldSpec::text("firmware", 16),
            FieldSpec::text("model", 20),
            FieldSpec::text("serial", 36),
        ]));

        // Table 02: system time, broadcast by the thermostat every minute.
        table.insert(RegisterInfo::new(0x02, 0x02, "SysTime", vec![
            FieldSpec::u8("hour"),
            FieldSpec::u8("minute"),
            FieldSpec::u8("day_of_week"),
        ]));
        table.insert(RegisterInfo::new(0x02, 0x03, "SysDate", vec![
            FieldSpec::u8("day"),
            FieldSpec::u8("month"),
            FieldSpec::u8("year"),
        ]));

        // Table 03: equipment state.
        table.insert(RegisterInfo::new(0x03, 0x02, "Temperatures", vec![]).repeating("sensor", vec![
            FieldSpec::u8("state"),
            FieldSpec::u8("type"),
            FieldSpec::times16("temp"),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x06, "AirHandler06", vec![
            FieldSpec::skip(1),
            FieldSpec::u16("blower_rpm"),
            FieldSpec::skip(1),
            FieldSpec::skip(2),
            FieldSpec::skip(2),
            FieldSpec::skip(1),
            FieldSpec::u8("blower_state"),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x08, "DamperControl", vec![
            FieldSpec::new("damper_target", DamperPosition).per_zone(),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x0e, "UnknownOneByte", vec![]).repeating("one_byte", vec![
            FieldSpec::u8("tag"),
            FieldSpec::u8("value"),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x0f, "UnknownTwoByte", vec![]).repeating("two_byte", vec![
            FieldSpec::u8("tag"),
            FieldSpec::u16("value"),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x10, "UnknownThreeByte", vec![]).repeating("three_byte", vec![
            FieldSpec::u8("tag"),
            FieldSpec::skip(1),
            FieldSpec::u16("value"),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x11, "UnknownThreeByteBookend", vec![]).repeating("bookend", vec![
            FieldSpec::u8("tag"),
            FieldSpec::skip(1),
            FieldSpec::u16("value"),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x16, "AirHandler16", vec![
            FieldSpec::u8("heat_state"),
            FieldSpec::skip(3),
            FieldSpec::u16("airflow_cfm"),
            FieldSpec::skip(2),
            FieldSpec::skip(2),
            FieldSpec::skip(2),
            FieldSpec::skip(1),
            FieldSpec::u8("fan_speed"),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x19, "DamperState", vec![
            FieldSpec::new("damper_position", DamperPosition).per_zone(),
        ]));
        table.insert(RegisterInfo::new(0x03, 0x1c, "LastStatus", vec![
            FieldSpec::u8("status_code"),
            FieldSpec::u8("status_severity"),
            FieldSpec::text("status_message", 38),
        ]));

        // Table 34: damper control / NIM.
        table.insert(RegisterInfo::new(0x34, 0x04, "HRVState", vec![FieldSpec::u8("hrv_speed")]));

        // Table 3b: thermostat.
        table.insert(RegisterInfo::new(0x3b, 0x02, "TStatCurrentParams", vec![
            FieldSpec::skip(1),
            FieldSpec::skip(2),
            FieldSpec::u8("current_temp").per_zone(),
            FieldSpec::u8("current_humidity").per_zone(),
            FieldSpec::skip(1),
            FieldSpec::i8("outdoor_air_temp"),
            FieldSpec::new("zones_unoccupied", Zones),
            FieldSpec::new("mode", ModeStage),
            FieldSpec::skip(5),
            FieldSpec::u8("displayed_zone"),
        ]));
        table.insert(RegisterInfo::new(0x3b, 0x03, "TStatZoneParams", vec![
            FieldSpec::skip(1),
            FieldSpec::skip(2),
            FieldSpec::new("fan_mode", Fan).per_zone(),
            FieldSpec::new("zones_holding", Zones),
            FieldSpec::u8("heat_setpoint").per_zone(),
            FieldSpec::u8("cool_setpoint").per_zone(),
            FieldSpec::u8("humidity_target").per_zone(),
            FieldSpec::u8("fan_auto_config"),
            FieldSpec::skip(1),
            FieldSpec::u16("hold_duration").per_zone(),
            FieldSpec::text("name", 12).per_zone(),
        ]));
        table.insert(RegisterInfo::new(0x3b, 0x04, "TStatVacationParams", vec![
            FieldSpec::u8("vacation_active"),
            FieldSpec::u16("vacation_hours"),
            FieldSpec::u8("vacation_min_temp"),
            FieldSpec::u8("vacation_max_temp"),
            FieldSpec::u8("vacation_min_humidity"),
            FieldSpec::u8("vacation_max_humidity"),
            FieldSpec::new("vacation_fan_mode", Fan),
        ]));
        table.insert(RegisterInfo::new(0x3b, 0x06, "TStatDealer", vec![
            FieldSpec::new("valid_zones", Zones),
            FieldSpec::skip(11),
            FieldSpec::text("dealer_name", 20),
            FieldSpec::text("dealer_phone", 20),
        ]));

        // Table 3e: legacy heat pump.
        table.insert(RegisterInfo::new(0x3e, 0x01, "LegacyHeatPumpTemperatures", vec![
            FieldSpec::times16("outside_temp"),
            FieldSpec::times16("coil_temp"),
        ]));
        table.insert(RegisterInfo::new(0x3e, 0x02, "LegacyHeatPumpStage", vec![
            FieldSpec::new("heat_pump_stage", StageShift1),
        ]));

        table
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_v1_layout_sizes() {
        let table = DecodeTable::v1();
        let len = |t, r| table.get(&RegisterId::new(t, r)).unwrap().fixed_len();
        assert_eq!(len(0x01, 0x04), 120);
        assert_eq!(len(0x03, 0x06), 10);
        assert_eq!(len(0x03, 0x08), 8);
        assert_eq!(len(0x03, 0x16), 14);
        assert_eq!(len(0x03, 0x1c), 40);
        assert_eq!(len(0x3b, 0x02), 1 + 2 + 8 + 8 + 1 + 1 + 1 + 1 + 5 + 1);
        assert_eq!(len(0x3b, 0x03), 1 + 2 + 8 + 1 + 8 + 8 + 8 + 1 + 1 + 16 + 96);
        assert_eq!(len(0x3b, 0x06), 52);
        let temps = table.get(&RegisterId::new(0x03, 0x02)).unwrap();
        assert_eq!(temps.group.as_ref().unwrap().record_len(), 4);
    }

    #[test]
    fn test_v1_field_names_unique_per_register() {
        for info in DecodeTable::v1().iter() {
            let mut seen = HashSet::new();
            for field in info.fields.iter().filter(|f| !matches!(f.kind, FieldKind::Skip(_))) {
                assert!(seen.insert(field.name.clone()), "{} repeats {}", info.name, field.name);
                assert!(field.name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            }
        }
    }

    #[test]
    fn test_for_version() {
        assert_eq!(DecodeTable::for_version("v1").unwrap().version(), "v1");
        assert!(matches!(DecodeTable::for_version("v9"), Err(AbcdError::Config(_))));
    }

    #[test]
    fn test_insert_extends_table() {
        let mut table = DecodeTable::empty("test");
        assert!(table.is_empty());
        let info = RegisterInfo::new(0x05, 0x01, "Probe", vec![FieldSpec::u8("temperature")]);
        assert!(table.insert(info.clone()).is_none());
        assert_eq!(table.get(&RegisterId::new(0x05, 0x01)), Some(&info));
        assert_eq!(table.len(), 1);
        assert!(table.insert(info).is_some());
    }

    #[test]
    fn test_field_spec_builders() {
        let spec = FieldSpec::u16("hold_duration").per_zone().little_endian();
        assert_eq!(spec.span(), 16);
        assert_eq!(spec.order, ByteOrder::Little);
        assert_eq!(FieldSpec::skip(5).span(), 5);
    }
}
