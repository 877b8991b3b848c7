// src/decoder/classify.rs

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::registers::{ByteOrder, DecodeTable, FieldKind, FieldSpec, Repeat};
use crate::common::{
    FanMode, FieldValue, Frame, Function, HvacMode, Payload, RegisterId, ZoneSet,
};

/// Offset of register data inside a register-carrying payload.
const REGISTER_DATA_OFFSET: usize = 3;

/// One named value pulled out of a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedField {
    pub name: String,
    pub value: FieldValue,
    /// Offset of the first byte within the frame payload.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    /// Recognized function, and for register frames a register in the table.
    Known {
        register: Option<RegisterId>,
        /// Register name, or the function name for frames without a register.
        name: String,
        fields: Vec<DecodedField>,
        /// Trailing bytes the layout did not cover.
        unparsed: usize,
    },
    /// Frame kind or register not in the decode table. Payload kept verbatim.
    Opaque { raw: Payload },
}

/// Result of classifying one validated frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub received_at: DateTime<Utc>,
    pub kind: RecordKind,
    pub frame: Frame,
}

impl DecodedRecord {
    pub fn fields(&self) -> &[DecodedField] {
        match &self.kind {
            RecordKind::Known { fields, .. } => fields,
            RecordKind::Opaque { .. } => &[],
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.kind, RecordKind::Opaque { .. })
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields().iter().find(|f| f.name == name).map(|f| &f.value)
    }
}

/// Maps validated frames to decoded records using a register table.
#[derive(Debug, Clone)]
pub struct Classifier {
    table: DecodeTable,
}

impl Classifier {
    pub fn new(table: DecodeTable) -> Self {
        Classifier { table }
    }

    pub fn table(&self) -> &DecodeTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut DecodeTable {
        &mut self.table
    }

    /// Classifies `frame`. Never fails: anything not understood comes back opaque.
    pub fn classify(&self, frame: Frame, received_at: DateTime<Utc>) -> DecodedRecord {
        let kind = match (frame.function, frame.register()) {
            (Function::Other(_), _) => RecordKind::Opaque { raw: frame.payload.clone() },
            (function, None) => RecordKind::Known {
                register: None,
                name: function.name().to_string(),
                fields: Vec::new(),
                unparsed: frame.payload.len(),
            },
            (function, Some(reg)) => match self.table.get(&reg) {
                None => RecordKind::Opaque { raw: frame.payload.clone() },
                // READ only names the register; WRITE and ACK06 carry its value.
                Some(info) if function == Function::Read => RecordKind::Known {
                    register: Some(reg),
                    name: info.name.clone(),
                    fields: Vec::new(),
                    unparsed: 0,
                },
                Some(info) => {
                    let mut decoder = FieldDecoder::new(frame.register_data(), REGISTER_DATA_OFFSET);
                    decoder.decode_all(&info.fields, "");
                    if let Some(group) = &info.group {
                        let record_len = group.record_len();
                        let mut index = 1;
                        while record_len > 0 && decoder.remaining() >= record_len {
                            let prefix = format!("{}{}_", group.prefix, index);
                            decoder.decode_all(&group.fields, &prefix);
                            index += 1;
                        }
                    }
                    RecordKind::Known {
                        register: Some(reg),
                        name: info.name.clone(),
                        unparsed: decoder.remaining(),
                        fields: decoder.fields,
                    }
                }
            },
        };
        DecodedRecord { received_at, kind, frame }
    }
}

/// Walks register data field by field. Stops quietly when data runs out.
struct FieldDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
    truncated: bool,
    fields: Vec<DecodedField>,
}

impl<'a> FieldDecoder<'a> {
    fn new(data: &'a [u8], base: usize) -> Self {
        FieldDecoder { data, pos: 0, base, truncated: false, fields: Vec::new() }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn decode_all(&mut self, specs: &[FieldSpec], prefix: &str) {
        for spec in specs {
            match spec.repeat {
                Repeat::Once => self.decode_one(spec, format!("{}{}", prefix, spec.name)),
                Repeat::PerZone => {
                    for zone in 1..=ZoneSet::MAX_ZONES {
                        self.decode_one(spec, format!("{}zone{}_{}", prefix, zone, spec.name));
                    }
                }
            }
        }
    }

    fn decode_one(&mut self, spec: &FieldSpec, name: String) {
        let width = spec.kind.width();
        if self.truncated || self.remaining() < width {
            self.truncated = true;
            return;
        }
        let bytes = &self.data[self.pos..self.pos + width];
        let offset = self.base + self.pos;
        self.pos += width;

        match spec.kind {
            FieldKind::Skip(_) => {}
            FieldKind::ModeStage => {
                let raw = bytes[0];
                self.push(name, FieldValue::Mode(HvacMode::from_u8(raw & 0x1f)), offset);
                self.push("stage".to_string(), FieldValue::Unsigned((raw >> 5) as u64), offset);
            }
            FieldKind::DamperPosition if bytes[0] == 0xff => {}
            kind => {
                let value = decode_value(kind, spec.order, bytes);
                self.push(name, value, offset);
            }
        }
    }

    fn push(&mut self, name: String, value: FieldValue, offset: usize) {
        self.fields.push(DecodedField { name, value, offset });
    }
}

fn read_u16(bytes: &[u8], order: ByteOrder) -> u16 {
    let pair = [bytes[0], bytes[1]];
    match order {
        ByteOrder::Big => u16::from_be_bytes(pair),
        ByteOrder::Little => u16::from_le_bytes(pair),
    }
}

/// Interprets `bytes` (exactly `kind.width()` long) as `kind`.
pub fn decode_value(kind: FieldKind, order: ByteOrder, bytes: &[u8]) -> FieldValue {
    match kind {
        FieldKind::U8 => FieldValue::Unsigned(bytes[0] as u64),
        FieldKind::I8 => FieldValue::Signed(bytes[0] as i8 as i64),
        FieldKind::U16 => FieldValue::Unsigned(read_u16(bytes, order) as u64),
        FieldKind::I16 => FieldValue::Signed(read_u16(bytes, order) as i16 as i64),
        FieldKind::Times16 => FieldValue::Scaled(read_u16(bytes, order) as i16 as f64 / 16.0),
        FieldKind::Text(_) => FieldValue::Text(decode_text(bytes)),
        FieldKind::ModeStage => FieldValue::Mode(HvacMode::from_u8(bytes[0] & 0x1f)),
        FieldKind::Fan => FieldValue::Fan(FanMode::from_u8(bytes[0])),
        FieldKind::Zones => FieldValue::Zones(ZoneSet(bytes[0])),
        FieldKind::DamperPosition => match bytes[0] {
            v @ 0..=15 => FieldValue::Percent(v as f64 * 100.0 / 15.0),
            v => FieldValue::Unsigned(v as u64),
        },
        FieldKind::StageShift1 => FieldValue::Unsigned((bytes[0] >> 1) as u64),
        FieldKind::Skip(_) => FieldValue::Unsigned(0),
    }
}

/// NUL-padded UTF-8. Invalid sequences are dropped.
fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim_matches('\0')
        .to_string()
}
