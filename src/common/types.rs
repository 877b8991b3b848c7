// src/common/types.rs

use core::fmt;
use serde::Serialize;

// --- Thermostat Enumerations ---

/// System mode as reported in the low five bits of the thermostat `Mode` byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Heat,
    Cool,
    Auto,
    Electric,
    HeatPump,
    Off,
    Unknown(u8),
}

impl HvacMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => HvacMode::Heat,
            1 => HvacMode::Cool,
            2 => HvacMode::Auto,
            3 => HvacMode::Electric,
            4 => HvacMode::HeatPump,
            5 => HvacMode::Off,
            other => HvacMode::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            HvacMode::Heat => 0,
            HvacMode::Cool => 1,
            HvacMode::Auto => 2,
            HvacMode::Electric => 3,
            HvacMode::HeatPump => 4,
            HvacMode::Off => 5,
            HvacMode::Unknown(v) => *v,
        }
    }
}

impl fmt::Display for HvacMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HvacMode::Heat => write!(f, "heat"),
            HvacMode::Cool => write!(f, "cool"),
            HvacMode::Auto => write!(f, "auto"),
            HvacMode::Electric => write!(f, "electric"),
            HvacMode::HeatPump => write!(f, "heat_pump"),
            HvacMode::Off => write!(f, "off"),
            HvacMode::Unknown(v) => write!(f, "unknown({})", v),
        }
    }
}

/// Per-zone fan setting.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    Auto,
    Low,
    Medium,
    High,
    Unknown(u8),
}

impl FanMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => FanMode::Auto,
            1 => FanMode::Low,
            2 => FanMode::Medium,
            3 => FanMode::High,
            other => FanMode::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            FanMode::Auto => 0,
            FanMode::Low => 1,
            FanMode::Medium => 2,
            FanMode::High => 3,
            FanMode::Unknown(v) => *v,
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanMode::Auto => write!(f, "auto"),
            FanMode::Low => write!(f, "low"),
            FanMode::Medium => write!(f, "medium"),
            FanMode::High => write!(f, "high"),
            FanMode::Unknown(v) => write!(f, "unknown({})", v),
        }
    }
}

// --- Zone Bitmaps ---

/// Up to eight zones as a bitmap, LSB = zone 1.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize)]
#[serde(into = "Vec<u8>")]
pub struct ZoneSet(pub u8);

impl ZoneSet {
    pub const MAX_ZONES: u8 = 8;

    /// Whether 1-based `zone` is set.
    pub fn contains(&self, zone: u8) -> bool {
        (1..=Self::MAX_ZONES).contains(&zone) && self.0 & (1 << (zone - 1)) != 0
    }

    /// Active zone indices (1-based), ascending.
    pub fn active_zones(&self) -> heapless::Vec<u8, 8> {
        let mut zones = heapless::Vec::new();
        for zone in 1..=Self::MAX_ZONES {
            if self.contains(zone) {
                // Capacity equals MAX_ZONES, push cannot fail.
                let _ = zones.push(zone);
            }
        }
        zones
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl From<ZoneSet> for Vec<u8> {
    fn from(set: ZoneSet) -> Self {
        set.active_zones().to_vec()
    }
}

impl fmt::Display for ZoneSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let zones = self.active_zones();
        for (i, zone) in zones.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", zone)?;
        }
        Ok(())
    }
}

// --- Decoded Values ---

/// A typed value pulled out of a frame payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    /// Raw integer after scale/offset (e.g. `*Times16` temperatures).
    Scaled(f64),
    /// 0..=100.
    Percent(f64),
    Text(String),
    Mode(HvacMode),
    Fan(FanMode),
    Zones(ZoneSet),
}

impl FieldValue {
    /// Numeric form for metrics output. `None` for text.
    pub fn as_metric(&self) -> Option<f64> {
        match self {
            FieldValue::Unsigned(v) => Some(*v as f64),
            FieldValue::Signed(v) => Some(*v as f64),
            FieldValue::Scaled(v) | FieldValue::Percent(v) => Some(*v),
            FieldValue::Text(_) => None,
            FieldValue::Mode(m) => Some(m.as_u8() as f64),
            FieldValue::Fan(m) => Some(m.as_u8() as f64),
            FieldValue::Zones(z) => Some(z.0 as f64),
        }
    }

    /// Label-friendly text for non-numeric values.
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Unsigned(v) => write!(f, "{}", v),
            FieldValue::Signed(v) => write!(f, "{}", v),
            FieldValue::Scaled(v) => write!(f, "{}", v),
            FieldValue::Percent(v) => write!(f, "{}%", v),
            FieldValue::Text(s) => write!(f, "{:?}", s),
            FieldValue::Mode(m) => write!(f, "{}", m),
            FieldValue::Fan(m) => write!(f, "{}", m),
            FieldValue::Zones(z) => write!(f, "[{}]", z),
        }
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hvac_mode_from_u8() {
        assert_eq!(HvacMode::from_u8(0), HvacMode::Heat);
        assert_eq!(HvacMode::from_u8(4), HvacMode::HeatPump);
        assert_eq!(HvacMode::from_u8(5), HvacMode::Off);
        assert_eq!(HvacMode::from_u8(17), HvacMode::Unknown(17));
        assert_eq!(HvacMode::Unknown(17).as_u8(), 17);
        assert_eq!(HvacMode::HeatPump.to_string(), "heat_pump");
    }

    #[test]
    fn test_fan_mode_from_u8() {
        assert_eq!(FanMode::from_u8(0), FanMode::Auto);
        assert_eq!(FanMode::from_u8(3), FanMode::High);
        assert_eq!(FanMode::from_u8(9), FanMode::Unknown(9));
        assert_eq!(FanMode::Medium.as_u8(), 2);
    }

    #[test]
    fn test_zone_set() {
        let set = ZoneSet(0b1000_0101);
        assert!(set.contains(1));
        assert!(!set.contains(2));
        assert!(set.contains(3));
        assert!(set.contains(8));
        assert!(!set.contains(0));
        assert!(!set.contains(9));
        assert_eq!(set.active_zones().as_slice(), &[1, 3, 8]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.to_string(), "1,3,8");
        assert!(ZoneSet(0).is_empty());
        assert_eq!(ZoneSet(0xff).active_zones().len(), 8);
    }

    #[test]
    fn test_field_value_metric() {
        assert_eq!(FieldValue::Unsigned(66).as_metric(), Some(66.0));
        assert_eq!(FieldValue::Signed(-4).as_metric(), Some(-4.0));
        assert_eq!(FieldValue::Scaled(71.5).as_metric(), Some(71.5));
        assert_eq!(FieldValue::Mode(HvacMode::Cool).as_metric(), Some(1.0));
        assert_eq!(FieldValue::Zones(ZoneSet(0b11)).as_metric(), Some(3.0));
        assert_eq!(FieldValue::Text("Zone 1".into()).as_metric(), None);
        assert_eq!(FieldValue::Text("Zone 1".into()).as_text().as_deref(), Some("Zone 1"));
    }

    #[test]
    fn test_field_value_serialize() {
        assert_eq!(serde_json::to_string(&FieldValue::Unsigned(402)).unwrap(), "402");
        assert_eq!(serde_json::to_string(&FieldValue::Mode(HvacMode::Heat)).unwrap(), "\"heat\"");
        assert_eq!(serde_json::to_string(&FieldValue::Zones(ZoneSet(0b101))).unwrap(), "[1,3]");
    }
}
