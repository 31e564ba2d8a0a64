//! Field tables
//!
//! Uses the RabbitMQ field-value type set, which differs from the 0-9-1
//! errata in a few tags (`s` is a signed short, `l` a signed long-long).

use crate::buffers::{FieldReader, FieldWriter};
use crate::error::{ProtocolError, ProtocolResult};
use std::collections::BTreeMap;

/// Ordered key/value table; ordering keeps encodings deterministic
pub type FieldTable = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal { scale: u8, value: u32 },
    LongString(Vec<u8>),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    ByteArray(Vec<u8>),
    Void,
}

impl FieldValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::LongString(s.into().into_bytes())
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Bool(_) => b't',
            Self::I8(_) => b'b',
            Self::U8(_) => b'B',
            Self::I16(_) => b's',
            Self::U16(_) => b'u',
            Self::I32(_) => b'I',
            Self::U32(_) => b'i',
            Self::I64(_) => b'l',
            Self::F32(_) => b'f',
            Self::F64(_) => b'd',
            Self::Decimal { .. } => b'D',
            Self::LongString(_) => b'S',
            Self::Array(_) => b'A',
            Self::Timestamp(_) => b'T',
            Self::Table(_) => b'F',
            Self::ByteArray(_) => b'x',
            Self::Void => b'V',
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::LongString(raw) => std::str::from_utf8(raw).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Render scalar values as display text; nested values use their debug form
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::I8(v) => v.to_string(),
            Self::U8(v) => v.to_string(),
            Self::I16(v) => v.to_string(),
            Self::U16(v) => v.to_string(),
            Self::I32(v) => v.to_string(),
            Self::U32(v) => v.to_string(),
            Self::I64(v) => v.to_string(),
            Self::F32(v) => v.to_string(),
            Self::F64(v) => v.to_string(),
            Self::Decimal { scale, value } => {
                let divisor = 10f64.powi(*scale as i32);
                (*value as f64 / divisor).to_string()
            }
            Self::LongString(raw) | Self::ByteArray(raw) => {
                String::from_utf8_lossy(raw).into_owned()
            }
            Self::Timestamp(v) => v.to_string(),
            Self::Void => String::new(),
            Self::Array(_) | Self::Table(_) => format!("{:?}", self),
        }
    }
}

fn encode_value(value: &FieldValue, w: &mut FieldWriter) -> ProtocolResult<()> {
    w.put_u8(value.tag());
    match value {
        FieldValue::Bool(v) => w.put_u8(u8::from(*v)),
        FieldValue::I8(v) => w.put_u8(*v as u8),
        FieldValue::U8(v) => w.put_u8(*v),
        FieldValue::I16(v) => w.put_u16(*v as u16),
        FieldValue::U16(v) => w.put_u16(*v),
        FieldValue::I32(v) => w.put_u32(*v as u32),
        FieldValue::U32(v) => w.put_u32(*v),
        FieldValue::I64(v) => w.put_u64(*v as u64),
        FieldValue::F32(v) => w.put_u32(v.to_bits()),
        FieldValue::F64(v) => w.put_u64(v.to_bits()),
        FieldValue::Decimal { scale, value } => {
            w.put_u8(*scale);
            w.put_u32(*value);
        }
        FieldValue::LongString(raw) | FieldValue::ByteArray(raw) => w.put_long_bytes(raw),
        FieldValue::Array(items) => {
            let mut body = FieldWriter::new();
            for item in items {
                encode_value(item, &mut body)?;
            }
            w.put_long_bytes(body.as_slice());
        }
        FieldValue::Timestamp(v) => w.put_u64(*v),
        FieldValue::Table(table) => w.put_table(table)?,
        FieldValue::Void => {}
    }
    Ok(())
}

fn decode_value(r: &mut FieldReader<'_>, key: &str) -> ProtocolResult<FieldValue> {
    let tag = r.read_u8()?;
    let value = match tag {
        b't' => FieldValue::Bool(r.read_u8()? != 0),
        b'b' => FieldValue::I8(r.read_u8()? as i8),
        b'B' => FieldValue::U8(r.read_u8()?),
        b's' => FieldValue::I16(r.read_u16()? as i16),
        b'u' => FieldValue::U16(r.read_u16()?),
        b'I' => FieldValue::I32(r.read_u32()? as i32),
        b'i' => FieldValue::U32(r.read_u32()?),
        b'l' => FieldValue::I64(r.read_u64()? as i64),
        b'f' => FieldValue::F32(f32::from_bits(r.read_u32()?)),
        b'd' => FieldValue::F64(f64::from_bits(r.read_u64()?)),
        b'D' => FieldValue::Decimal {
            scale: r.read_u8()?,
            value: r.read_u32()?,
        },
        b'S' => FieldValue::LongString(r.read_long_bytes()?),
        b'x' => FieldValue::ByteArray(r.read_long_bytes()?),
        b'A' => {
            let len = r.read_u32()? as usize;
            let mut items = FieldReader::new(r.read_bytes(len, "field array")?);
            let mut values = Vec::new();
            while !items.is_empty() {
                values.push(decode_value(&mut items, key)?);
            }
            FieldValue::Array(values)
        }
        b'T' => FieldValue::Timestamp(r.read_u64()?),
        b'F' => FieldValue::Table(r.read_table()?),
        b'V' => FieldValue::Void,
        other => {
            return Err(ProtocolError::UnknownFieldType {
                tag: other,
                key: key.to_string(),
            })
        }
    };
    Ok(value)
}

/// Encode table entries without the outer length prefix
pub(crate) fn encode_table_body(table: &FieldTable, w: &mut FieldWriter) -> ProtocolResult<()> {
    for (key, value) in table {
        w.put_short_str(key, "field table key")?;
        encode_value(value, w)?;
    }
    Ok(())
}

/// Decode table entries from a slice that excludes the outer length prefix
pub(crate) fn decode_table_body(raw: &[u8]) -> ProtocolResult<FieldTable> {
    let mut r = FieldReader::new(raw);
    let mut table = FieldTable::new();
    while !r.is_empty() {
        let key = r.read_short_str()?;
        let value = decode_value(&mut r, &key)?;
        table.insert(key, value);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(table: &FieldTable) -> FieldTable {
        let mut w = FieldWriter::new();
        w.put_table(table).unwrap();
        let bytes = w.into_bytes();
        FieldReader::new(&bytes).read_table().unwrap()
    }

    #[test]
    fn test_nested_table_and_array() {
        let mut capabilities = FieldTable::new();
        capabilities.insert("publisher_confirms".into(), FieldValue::Bool(true));

        let mut table = FieldTable::new();
        table.insert("product".into(), FieldValue::string("RabbitMQ"));
        table.insert("capabilities".into(), FieldValue::Table(capabilities));
        table.insert(
            "x-list".into(),
            FieldValue::Array(vec![FieldValue::I64(-3), FieldValue::Void]),
        );
        table.insert("ratio".into(), FieldValue::F64(0.5));

        assert_eq!(round_trip(&table), table);
    }

    #[test]
    fn test_rabbitmq_signed_tags() {
        let mut table = FieldTable::new();
        table.insert("short".into(), FieldValue::I16(-2));
        let mut w = FieldWriter::new();
        w.put_table(&table).unwrap();
        let bytes = w.into_bytes();
        // length(4) + key len(1) + "short"(5) + tag
        assert_eq!(bytes[10], b's');
    }

    #[test]
    fn test_unknown_tag_rejected() {
        // table of length 4: key "k", tag 'Z', one byte
        let raw = [0, 0, 0, 4, 1, b'k', b'Z', 0];
        let err = FieldReader::new(&raw).read_table().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFieldType { tag: b'Z', .. }));
    }

    #[test]
    fn test_display_string() {
        assert_eq!(FieldValue::string("abc").to_display_string(), "abc");
        assert_eq!(FieldValue::I32(-7).to_display_string(), "-7");
        assert_eq!(
            FieldValue::Decimal { scale: 2, value: 150 }.to_display_string(),
            "1.5"
        );
    }
}
