// src/common/address.rs

use super::error::AbcdError;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Device classes seen on the bus, keyed by the high byte of an address.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum DeviceClass {
    BootstrapController,
    Thermostat,
    SmartSensor,
    /// Tools and bridges that join the bus (including sniffers).
    ThirdParty,
    AirHandler,
    HeatPump,
    ZoneDamper,
    Accessory,
    SystemAccessModule,
    Broadcast,
}

impl DeviceClass {
    /// Maps the class byte of an address to a known device class.
    pub const fn from_class_byte(class: u8) -> Option<Self> {
        match class {
            0x1f => Some(DeviceClass::BootstrapController),
            0x20 => Some(DeviceClass::Thermostat),
            0x21..=0x28 => Some(DeviceClass::SmartSensor),
            0x30 => Some(DeviceClass::ThirdParty),
            0x40..=0x42 => Some(DeviceClass::AirHandler),
            0x50..=0x56 => Some(DeviceClass::HeatPump),
            0x60..=0x61 => Some(DeviceClass::ZoneDamper),
            0x80 => Some(DeviceClass::Accessory),
            0x92 => Some(DeviceClass::SystemAccessModule),
            0xf1 => Some(DeviceClass::Broadcast),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::BootstrapController => "bootstrap",
            DeviceClass::Thermostat => "thermostat",
            DeviceClass::SmartSensor => "smart_sensor",
            DeviceClass::ThirdParty => "third_party",
            DeviceClass::AirHandler => "air_handler",
            DeviceClass::HeatPump => "heat_pump",
            DeviceClass::ZoneDamper => "zone_damper",
            DeviceClass::Accessory => "accessory",
            DeviceClass::SystemAccessModule => "sam",
            DeviceClass::Broadcast => "broadcast",
        }
    }
}

/// A two-byte bus address: device class (high byte) and bus number (low byte).
///
/// Rendered as four lower-case hex digits, e.g. `2001` for the thermostat.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BusAddr {
    class: u8,
    bus: u8,
}

impl BusAddr {
    pub const THERMOSTAT: BusAddr = BusAddr::new(0x20, 0x01);
    pub const BROADCAST: BusAddr = BusAddr::new(0xf1, 0xf1);

    #[inline]
    pub const fn new(class: u8, bus: u8) -> Self {
        BusAddr { class, bus }
    }

    /// Reads an address from the first two bytes of `bytes`.
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [class, bus, ..] => Some(BusAddr::new(*class, *bus)),
            _ => None,
        }
    }

    #[inline]
    pub const fn class_byte(&self) -> u8 {
        self.class
    }

    #[inline]
    pub const fn bus_byte(&self) -> u8 {
        self.bus
    }

    #[inline]
    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.class, self.bus]
    }

    pub const fn device_class(&self) -> Option<DeviceClass> {
        DeviceClass::from_class_byte(self.class)
    }

    /// True when the class byte belongs to a known bus participant.
    #[inline]
    pub const fn is_known(&self) -> bool {
        self.device_class().is_some()
    }

    /// Coarse check used while hunting for a frame start: the class byte must
    /// fall in the ranges reserved for bus participants.
    #[inline]
    pub const fn is_reserved_range(class: u8) -> bool {
        matches!(class, 0x10..=0x9f | 0xf1)
    }
}

impl FromStr for BusAddr {
    type Err = AbcdError;

    /// Parses four hex digits (`"2001"`), optionally prefixed with `0x`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("0x");
        if digits.len() != 4 {
            return Err(AbcdError::InvalidAddress(s.to_string()));
        }
        let value =
            u16::from_str_radix(digits, 16).map_err(|_| AbcdError::InvalidAddress(s.to_string()))?;
        let [class, bus] = value.to_be_bytes();
        Ok(BusAddr::new(class, bus))
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}", self.class, self.bus)
    }
}

impl Serialize for BusAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BusAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: BusAddr = "2001".parse().unwrap();
        assert_eq!(addr, BusAddr::THERMOSTAT);
        assert_eq!(addr.to_string(), "2001");
        assert_eq!("0x4001".parse::<BusAddr>().unwrap(), BusAddr::new(0x40, 0x01));
        assert_eq!(BusAddr::new(0x05, 0x0f).to_string(), "050f");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!("201".parse::<BusAddr>(), Err(AbcdError::InvalidAddress(_))));
        assert!(matches!("20g1".parse::<BusAddr>(), Err(AbcdError::InvalidAddress(_))));
        assert!(matches!("".parse::<BusAddr>(), Err(AbcdError::InvalidAddress(_))));
    }

    #[test]
    fn test_device_classes() {
        assert_eq!(BusAddr::THERMOSTAT.device_class(), Some(DeviceClass::Thermostat));
        assert_eq!(BusAddr::new(0x52, 0x01).device_class(), Some(DeviceClass::HeatPump));
        assert_eq!(BusAddr::new(0x61, 0x01).device_class(), Some(DeviceClass::ZoneDamper));
        assert_eq!(BusAddr::BROADCAST.device_class(), Some(DeviceClass::Broadcast));
        assert_eq!(BusAddr::new(0x05, 0x0f).device_class(), None);
        assert!(!BusAddr::new(0x05, 0x0f).is_known());
    }

    #[test]
    fn test_reserved_range() {
        assert!(BusAddr::is_reserved_range(0x20));
        assert!(BusAddr::is_reserved_range(0x9f));
        assert!(BusAddr::is_reserved_range(0xf1));
        assert!(!BusAddr::is_reserved_range(0x00));
        assert!(!BusAddr::is_reserved_range(0xff));
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(BusAddr::from_bytes(&[0x40, 0x01, 0x99]), Some(BusAddr::new(0x40, 0x01)));
        assert_eq!(BusAddr::from_bytes(&[0x40]), None);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&BusAddr::THERMOSTAT).unwrap();
        assert_eq!(json, "\"2001\"");
        let back: BusAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BusAddr::THERMOSTAT);
    }
}
