//! Register value codec
//!
//! Typed binary encode/decode of register contents across widths and byte
//! orders. Byte-order suffixes on the wire bytes `A B C D` (32-bit example):
//!
//! | suffix | wire order | meaning                        |
//! |--------|------------|--------------------------------|
//! | `be`   | ABCD       | big-endian                     |
//! | `le`   | DCBA       | full reversal                  |
//! | `sw`   | CDAB       | 16-bit words swapped           |
//! | `sb`   | BADC       | bytes swapped inside each word |
//!
//! Every value surfaces as [`Value::Number`] (an `f64`), so 64-bit integers
//! are exact only within ±2^53. Outside that window the low bits are lost on
//! decode and encode rounds to the nearest representable value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, Result};
use crate::packer::{BytePacker, Endian};
use crate::value::Value;

/// Register formats understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum RegisterFormat {
    Uint8Be,
    Uint8Le,
    Int8Be,
    Int8Le,
    Uint16Be,
    Uint16Le,
    Int16Be,
    Int16Le,
    Uint32Be,
    Uint32Le,
    Uint32Sw,
    Uint32Sb,
    Int32Be,
    Int32Le,
    Int32Sw,
    Int32Sb,
    Uint64Be,
    Uint64Le,
    Int64Be,
    Int64Le,
    FloatBe,
    FloatLe,
    FloatSw,
    FloatSb,
    DoubleBe,
    DoubleLe,
    String,
    StringLe,
    String16,
    String16Le,
    RawHex,
}

const FORMAT_NAMES: &[(&str, RegisterFormat)] = &[
    ("uint8be", RegisterFormat::Uint8Be),
    ("uint8le", RegisterFormat::Uint8Le),
    ("int8be", RegisterFormat::Int8Be),
    ("int8le", RegisterFormat::Int8Le),
    ("uint16be", RegisterFormat::Uint16Be),
    ("uint16le", RegisterFormat::Uint16Le),
    ("int16be", RegisterFormat::Int16Be),
    ("int16le", RegisterFormat::Int16Le),
    ("uint32be", RegisterFormat::Uint32Be),
    ("uint32le", RegisterFormat::Uint32Le),
    ("uint32sw", RegisterFormat::Uint32Sw),
    ("uint32sb", RegisterFormat::Uint32Sb),
    ("int32be", RegisterFormat::Int32Be),
    ("int32le", RegisterFormat::Int32Le),
    ("int32sw", RegisterFormat::Int32Sw),
    ("int32sb", RegisterFormat::Int32Sb),
    ("uint64be", RegisterFormat::Uint64Be),
    ("uint64le", RegisterFormat::Uint64Le),
    ("int64be", RegisterFormat::Int64Be),
    ("int64le", RegisterFormat::Int64Le),
    ("floatbe", RegisterFormat::FloatBe),
    ("floatle", RegisterFormat::FloatLe),
    ("floatsw", RegisterFormat::FloatSw),
    ("floatsb", RegisterFormat::FloatSb),
    ("doublebe", RegisterFormat::DoubleBe),
    ("doublele", RegisterFormat::DoubleLe),
    ("string", RegisterFormat::String),
    ("stringle", RegisterFormat::StringLe),
    ("string16", RegisterFormat::String16),
    ("string16le", RegisterFormat::String16Le),
    ("rawhex", RegisterFormat::RawHex),
];

/// Wire byte permutation applied before/after a big-endian conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Be,
    Le,
    WordSwap,
    ByteSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    U8High,
    U8Low,
    I8High,
    I8Low,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl RegisterFormat {
    pub fn name(self) -> &'static str {
        FORMAT_NAMES
            .iter()
            .find(|(_, f)| *f == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }

    pub fn all() -> impl Iterator<Item = RegisterFormat> {
        FORMAT_NAMES.iter().map(|(_, f)| *f)
    }

    /// String-like formats carry an explicit length in words
    pub fn is_string(self) -> bool {
        matches!(
            self,
            RegisterFormat::String
                | RegisterFormat::StringLe
                | RegisterFormat::String16
                | RegisterFormat::String16Le
                | RegisterFormat::RawHex
        )
    }

    /// Width in 16-bit words; string formats use the configured `length`
    pub fn word_len(self, length: u16) -> u16 {
        if self.is_string() {
            return length.max(1);
        }
        match self.numeric() {
            Some((
                Kind::U8High | Kind::U8Low | Kind::I8High | Kind::I8Low | Kind::U16 | Kind::I16,
                _,
            )) => 1,
            Some((Kind::U32 | Kind::I32 | Kind::F32, _)) => 2,
            _ => 4,
        }
    }

    fn numeric(self) -> Option<(Kind, Order)> {
        use RegisterFormat::*;
        let spec = match self {
            Uint8Be => (Kind::U8Low, Order::Be),
            Uint8Le => (Kind::U8High, Order::Be),
            Int8Be => (Kind::I8Low, Order::Be),
            Int8Le => (Kind::I8High, Order::Be),
            Uint16Be => (Kind::U16, Order::Be),
            Uint16Le => (Kind::U16, Order::Le),
            Int16Be => (Kind::I16, Order::Be),
            Int16Le => (Kind::I16, Order::Le),
            Uint32Be => (Kind::U32, Order::Be),
            Uint32Le => (Kind::U32, Order::Le),
            Uint32Sw => (Kind::U32, Order::WordSwap),
            Uint32Sb => (Kind::U32, Order::ByteSwap),
            Int32Be => (Kind::I32, Order::Be),
            Int32Le => (Kind::I32, Order::Le),
            Int32Sw => (Kind::I32, Order::WordSwap),
            Int32Sb => (Kind::I32, Order::ByteSwap),
            Uint64Be => (Kind::U64, Order::Be),
            Uint64Le => (Kind::U64, Order::Le),
            Int64Be => (Kind::I64, Order::Be),
            Int64Le => (Kind::I64, Order::Le),
            FloatBe => (Kind::F32, Order::Be),
            FloatLe => (Kind::F32, Order::Le),
            FloatSw => (Kind::F32, Order::WordSwap),
            FloatSb => (Kind::F32, Order::ByteSwap),
            DoubleBe => (Kind::F64, Order::Be),
            DoubleLe => (Kind::F64, Order::Le),
            String | StringLe | String16 | String16Le | RawHex => return None,
        };
        Some(spec)
    }
}

impl FromStr for RegisterFormat {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        FORMAT_NAMES
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, f)| *f)
            .ok_or_else(|| ModbusError::invalid_type(s))
    }
}

impl TryFrom<String> for RegisterFormat {
    type Error = ModbusError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RegisterFormat> for &'static str {
    fn from(value: RegisterFormat) -> Self {
        value.name()
    }
}

impl fmt::Display for RegisterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Permute wire bytes to/from big-endian order. Each permutation is its own inverse.
fn reorder(bytes: &mut [u8], order: Order) {
    match order {
        Order::Be => {},
        Order::Le => bytes.reverse(),
        Order::WordSwap => {
            let words = bytes.len() / 2;
            for i in 0..words / 2 {
                let j = words - 1 - i;
                bytes.swap(2 * i, 2 * j);
                bytes.swap(2 * i + 1, 2 * j + 1);
            }
        },
        Order::ByteSwap => {
            for pair in bytes.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        },
    }
}

fn slice_words(buf: &[u8], word_offset: usize, words: usize) -> Result<&[u8]> {
    let start = word_offset * 2;
    let end = start + words * 2;
    buf.get(start..end).ok_or_else(|| {
        ModbusError::protocol(format!(
            "Register buffer too short: need bytes {}..{}, have {}",
            start,
            end,
            buf.len()
        ))
    })
}

/// Decode one value starting at `word_offset` (in 16-bit words) inside `buf`.
///
/// `length` is only consulted by string formats.
pub fn decode(
    format: RegisterFormat,
    buf: &[u8],
    word_offset: usize,
    length: u16,
) -> Result<Value> {
    if let Some((kind, order)) = format.numeric() {
        let words = format.word_len(length) as usize;
        let mut raw = slice_words(buf, word_offset, words)?.to_vec();
        reorder(&mut raw, order);
        let n = match kind {
            Kind::U8High => f64::from(raw[0]),
            Kind::U8Low => f64::from(raw[1]),
            Kind::I8High => f64::from(raw[0] as i8),
            Kind::I8Low => f64::from(raw[1] as i8),
            Kind::U16 => f64::from(u16::from_be_bytes([raw[0], raw[1]])),
            Kind::I16 => f64::from(i16::from_be_bytes([raw[0], raw[1]])),
            Kind::U32 => f64::from(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Kind::I32 => f64::from(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Kind::F32 => f64::from(f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            Kind::U64 => u64::from_be_bytes(to_array8(&raw)) as f64,
            Kind::I64 => i64::from_be_bytes(to_array8(&raw)) as f64,
            Kind::F64 => f64::from_be_bytes(to_array8(&raw)),
        };
        return Ok(Value::Number(n));
    }

    let available = buf.len().saturating_sub(word_offset * 2) / 2;
    let words = (length.max(1) as usize).min(available);
    let raw = slice_words(buf, word_offset, words)?;
    let text = match format {
        RegisterFormat::String => bytes_to_text(raw.iter().copied()),
        RegisterFormat::StringLe => {
            bytes_to_text(raw.chunks_exact(2).flat_map(|w| [w[1], w[0]]))
        },
        RegisterFormat::String16 => {
            units_to_text(raw.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])))
        },
        RegisterFormat::String16Le => {
            units_to_text(raw.chunks_exact(2).map(|w| u16::from_le_bytes([w[0], w[1]])))
        },
        _ => common::hex::encode_upper(raw),
    };
    Ok(Value::Text(text))
}

fn to_array8(raw: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&raw[..8]);
    out
}

fn bytes_to_text(bytes: impl Iterator<Item = u8>) -> String {
    bytes
        .take_while(|b| *b != 0)
        .map(char::from)
        .collect()
}

fn units_to_text(units: impl Iterator<Item = u16>) -> String {
    let units: Vec<u16> = units.take_while(|u| *u != 0).collect();
    String::from_utf16_lossy(&units)
}

fn numeric_input(format: RegisterFormat, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        ModbusError::validation(format!("{} expects a numeric value, got {:?}", format, value))
    })
}

fn integer_in_range(format: RegisterFormat, n: f64, min: f64, max: f64) -> Result<f64> {
    let rounded = n.round();
    if !rounded.is_finite() || rounded < min || rounded > max {
        return Err(ModbusError::validation(format!(
            "Value {} out of range for {}",
            n, format
        )));
    }
    Ok(rounded)
}

/// Encode `value` into `format`'s word width (or `length` words for strings)
pub fn encode(format: RegisterFormat, value: &Value, length: u16) -> Result<Vec<u8>> {
    if let Some((kind, order)) = format.numeric() {
        let n = numeric_input(format, value)?;
        let packer = BytePacker::with_capacity(8);
        let mut raw = match kind {
            Kind::U8High => {
                let v = integer_in_range(format, n, 0.0, 255.0)? as u8;
                packer.u8(v).u8(0).finish()
            },
            Kind::U8Low => {
                let v = integer_in_range(format, n, 0.0, 255.0)? as u8;
                packer.u8(0).u8(v).finish()
            },
            Kind::I8High => {
                let v = integer_in_range(format, n, -128.0, 127.0)? as i8;
                packer.i8(v).u8(0).finish()
            },
            Kind::I8Low => {
                let v = integer_in_range(format, n, -128.0, 127.0)? as i8;
                packer.u8(0).i8(v).finish()
            },
            Kind::U16 => {
                let v = integer_in_range(format, n, 0.0, f64::from(u16::MAX))? as u16;
                packer.u16(v, Endian::Big).finish()
            },
            Kind::I16 => {
                let v = integer_in_range(format, n, f64::from(i16::MIN), f64::from(i16::MAX))?;
                packer.i16(v as i16, Endian::Big).finish()
            },
            Kind::U32 => {
                let v = integer_in_range(format, n, 0.0, f64::from(u32::MAX))? as u32;
                packer.u32(v, Endian::Big).finish()
            },
            Kind::I32 => {
                let v = integer_in_range(format, n, f64::from(i32::MIN), f64::from(i32::MAX))?;
                packer.i32(v as i32, Endian::Big).finish()
            },
            Kind::U64 => {
                let v = integer_in_range(format, n, 0.0, u64::MAX as f64)? as u64;
                packer.u64(v, Endian::Big).finish()
            },
            Kind::I64 => {
                let v = integer_in_range(format, n, i64::MIN as f64, i64::MAX as f64)? as i64;
                packer.i64(v, Endian::Big).finish()
            },
            Kind::F32 => packer.f32(n as f32, Endian::Big).finish(),
            Kind::F64 => packer.f64(n, Endian::Big).finish(),
        };
        reorder(&mut raw, order);
        return Ok(raw);
    }

    let byte_len = length.max(1) as usize * 2;
    let text = match value {
        Value::Text(s) => s.clone(),
        other => other.to_string(),
    };
    let packer = BytePacker::with_capacity(byte_len);
    let packer = match format {
        RegisterFormat::String => packer.bytes(text.as_bytes()),
        RegisterFormat::StringLe => {
            let padded = BytePacker::new().bytes(text.as_bytes()).pad_to(byte_len).finish();
            let swapped: Vec<u8> = padded
                .chunks(2)
                .flat_map(|w| [w.get(1).copied().unwrap_or(0), w[0]])
                .collect();
            packer.bytes(&swapped)
        },
        RegisterFormat::String16 => text
            .encode_utf16()
            .fold(packer, |p, unit| p.u16(unit, Endian::Big)),
        RegisterFormat::String16Le => text
            .encode_utf16()
            .fold(packer, |p, unit| p.u16(unit, Endian::Little)),
        _ => {
            let raw = common::hex::decode(&text)
                .map_err(|e| ModbusError::validation(format!("rawhex value '{}': {}", text, e)))?;
            packer.bytes(&raw)
        },
    };
    let mut out = packer.pad_to(byte_len).finish();
    out.truncate(byte_len);
    Ok(out)
}

/// Convert bytes to big-endian register words
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// Convert register words to their wire bytes
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}
