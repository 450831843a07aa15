//! Declared embedded data types and their byte codecs.
//!
//! Type ids follow the device description format: the high nibble is
//! the category, the low nibble the size code (`1 << code` bytes).
//!
//! | Category | Id range    |
//! |----------|-------------|
//! | sint     | 0x00..=0x05 |
//! | uint     | 0x10..=0x15 |
//! | float    | 0x22, 0x23  |
//! | boolean  | 0x40        |
//!
//! 128- and 256-bit integers can be declared but have no runtime codec.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Byte order of a value in device memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddedDataType {
    Sint8,
    Sint16,
    Sint32,
    Sint64,
    Sint128,
    Sint256,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uint128,
    Uint256,
    Float32,
    Float64,
    Boolean,
}

impl EmbeddedDataType {
    pub fn id(self) -> u8 {
        match self {
            Self::Sint8 => 0x00,
            Self::Sint16 => 0x01,
            Self::Sint32 => 0x02,
            Self::Sint64 => 0x03,
            Self::Sint128 => 0x04,
            Self::Sint256 => 0x05,
            Self::Uint8 => 0x10,
            Self::Uint16 => 0x11,
            Self::Uint32 => 0x12,
            Self::Uint64 => 0x13,
            Self::Uint128 => 0x14,
            Self::Uint256 => 0x15,
            Self::Float32 => 0x22,
            Self::Float64 => 0x23,
            Self::Boolean => 0x40,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0x00 => Self::Sint8,
            0x01 => Self::Sint16,
            0x02 => Self::Sint32,
            0x03 => Self::Sint64,
            0x04 => Self::Sint128,
            0x05 => Self::Sint256,
            0x10 => Self::Uint8,
            0x11 => Self::Uint16,
            0x12 => Self::Uint32,
            0x13 => Self::Uint64,
            0x14 => Self::Uint128,
            0x15 => Self::Uint256,
            0x22 => Self::Float32,
            0x23 => Self::Float64,
            0x40 => Self::Boolean,
            _ => return None,
        })
    }

    /// Size in bytes.
    pub fn size(self) -> usize {
        1 << (self.id() & 0x0F)
    }

    pub fn bits(self) -> u32 {
        self.size() as u32 * 8
    }

    pub fn is_signed(self) -> bool {
        self.id() & 0xF0 == 0x00
    }

    pub fn is_integer(self) -> bool {
        matches!(self.id() & 0xF0, 0x00 | 0x10)
    }

    pub fn is_float(self) -> bool {
        self.id() & 0xF0 == 0x20
    }

    /// False for declared types the runtime cannot encode or decode.
    pub fn has_codec(self) -> bool {
        self.size() <= 8
    }
}

impl fmt::Display for EmbeddedDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sint8 => "sint8",
            Self::Sint16 => "sint16",
            Self::Sint32 => "sint32",
            Self::Sint64 => "sint64",
            Self::Sint128 => "sint128",
            Self::Sint256 => "sint256",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Uint128 => "uint128",
            Self::Uint256 => "uint256",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A decoded value, widened to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::UInt(v) => v as f64,
            Self::Float(v) => v,
            Self::Bool(v) => f64::from(u8::from(v)),
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Self::Int(v) => v != 0,
            Self::UInt(v) => v != 0,
            Self::Float(v) => v != 0.0,
            Self::Bool(v) => v,
        }
    }

    /// Integer view used by the integer encoders.  Floats are rounded
    /// to the nearest integer, ties away from zero.
    fn as_i128(self) -> Result<i128, CodecError> {
        match self {
            Self::Int(v) => Ok(i128::from(v)),
            Self::UInt(v) => Ok(i128::from(v)),
            Self::Bool(v) => Ok(i128::from(u8::from(v))),
            Self::Float(v) => {
                if !v.is_finite() {
                    return Err(CodecError::NotFinite);
                }
                let r = v.round();
                if r < -(2f64.powi(64)) || r > 2f64.powi(64) {
                    return Err(CodecError::OutOfRange);
                }
                Ok(r as i128)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw integer helpers
// ---------------------------------------------------------------------------

fn to_bytes(raw: u64, size: usize, endianness: Endianness) -> Vec<u8> {
    match endianness {
        Endianness::Little => raw.to_le_bytes()[..size].to_vec(),
        Endianness::Big => raw.to_be_bytes()[8 - size..].to_vec(),
    }
}

fn from_bytes(bytes: &[u8], endianness: Endianness) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
    match endianness {
        Endianness::Little => bytes.iter().rev().fold(0, fold),
        Endianness::Big => bytes.iter().fold(0, fold),
    }
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Range-check `v` against a `bits`-wide signed or unsigned integer and
/// return its two's complement bit pattern.
fn fit_integer(v: i128, bits: u32, signed: bool) -> Result<u64, CodecError> {
    let (min, max) = if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    };
    if v < min || v > max {
        return Err(CodecError::OutOfRange);
    }
    Ok((v as u64) & low_mask(bits))
}

fn check_codec(dtype: EmbeddedDataType) -> Result<(), CodecError> {
    if dtype.has_codec() {
        Ok(())
    } else {
        Err(CodecError::NoCodec(dtype))
    }
}

// ---------------------------------------------------------------------------
// Whole-value codec
// ---------------------------------------------------------------------------

pub fn encode_value(
    dtype: EmbeddedDataType,
    endianness: Endianness,
    value: Value,
) -> Result<Vec<u8>, CodecError> {
    check_codec(dtype)?;
    let size = dtype.size();
    let raw = match dtype {
        EmbeddedDataType::Float32 => {
            let v = value.as_f64();
            if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(CodecError::OutOfRange);
            }
            u64::from((v as f32).to_bits())
        }
        EmbeddedDataType::Float64 => value.as_f64().to_bits(),
        EmbeddedDataType::Boolean => u64::from(value.as_bool()),
        _ => fit_integer(value.as_i128()?, dtype.bits(), dtype.is_signed())?,
    };
    Ok(to_bytes(raw, size, endianness))
}

pub fn decode_value(
    dtype: EmbeddedDataType,
    endianness: Endianness,
    bytes: &[u8],
) -> Result<Value, CodecError> {
    check_codec(dtype)?;
    if bytes.len() != dtype.size() {
        return Err(CodecError::WrongSize {
            expected: dtype.size(),
            got: bytes.len(),
        });
    }
    let raw = from_bytes(bytes, endianness);
    Ok(match dtype {
        EmbeddedDataType::Float32 => Value::Float(f64::from(f32::from_bits(raw as u32))),
        EmbeddedDataType::Float64 => Value::Float(f64::from_bits(raw)),
        EmbeddedDataType::Boolean => Value::Bool(raw != 0),
        t if t.is_signed() => Value::Int(sign_extend(raw, t.bits())),
        _ => Value::UInt(raw),
    })
}

// ---------------------------------------------------------------------------
// Bitfields
// ---------------------------------------------------------------------------

/// A value occupying `size` bits starting at bit `offset` of its
/// declared type, counted from the least significant bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bitfield {
    pub offset: u8,
    pub size: u8,
}

impl Bitfield {
    pub const fn new(offset: u8, size: u8) -> Self {
        Self { offset, size }
    }

    pub fn validate(self, dtype: EmbeddedDataType) -> Result<(), CodecError> {
        check_codec(dtype)?;
        if dtype.is_float()
            || self.size == 0
            || u32::from(self.offset) + u32::from(self.size) > dtype.bits()
        {
            return Err(CodecError::InvalidBitfield);
        }
        Ok(())
    }

    fn field_mask(self) -> u64 {
        low_mask(u32::from(self.size)) << self.offset
    }
}

pub fn decode_bitfield(
    dtype: EmbeddedDataType,
    endianness: Endianness,
    bitfield: Bitfield,
    bytes: &[u8],
) -> Result<Value, CodecError> {
    bitfield.validate(dtype)?;
    if bytes.len() != dtype.size() {
        return Err(CodecError::WrongSize {
            expected: dtype.size(),
            got: bytes.len(),
        });
    }
    let raw = (from_bytes(bytes, endianness) & bitfield.field_mask()) >> bitfield.offset;
    Ok(match dtype {
        EmbeddedDataType::Boolean => Value::Bool(raw != 0),
        t if t.is_signed() => Value::Int(sign_extend(raw, u32::from(bitfield.size))),
        _ => Value::UInt(raw),
    })
}

/// Encode `value` into the bitfield and return `(data, mask)`, both
/// `dtype.size()` bytes long.  Bits outside the mask are zero in `data`.
pub fn encode_bitfield(
    dtype: EmbeddedDataType,
    endianness: Endianness,
    bitfield: Bitfield,
    value: Value,
) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
    bitfield.validate(dtype)?;
    let bits = match dtype {
        EmbeddedDataType::Boolean => u64::from(value.as_bool()),
        t => fit_integer(value.as_i128()?, u32::from(bitfield.size), t.is_signed())?,
    };
    let mask = bitfield.field_mask();
    let size = dtype.size();
    Ok((
        to_bytes((bits << bitfield.offset) & mask, size, endianness),
        to_bytes(mask, size, endianness),
    ))
}
