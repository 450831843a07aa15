//! Memory-backed variables and runtime published values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::protocol::{
    Bitfield, EmbeddedDataType, Endianness, Value, decode_bitfield, decode_value, encode_bitfield,
    encode_value,
};

/// Named values of an enumerated variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub values: BTreeMap<String, i64>,
}

impl EnumDef {
    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(k, _)| k.as_str())
    }
}

/// Bytes to put on the wire for one variable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedWrite {
    Plain(Vec<u8>),
    /// Partial update: only bits set in `mask` change on the device.
    Masked { data: Vec<u8>, mask: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    pub address: u64,
    pub dtype: EmbeddedDataType,
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default)]
    pub bitfield: Option<Bitfield>,
    #[serde(default)]
    pub enum_def: Option<EnumDef>,
}

impl VariableDef {
    pub fn new(address: u64, dtype: EmbeddedDataType, endianness: Endianness) -> Self {
        Self {
            address,
            dtype,
            endianness,
            bitfield: None,
            enum_def: None,
        }
    }

    pub fn with_bitfield(mut self, bitfield: Bitfield) -> Result<Self, CodecError> {
        bitfield.validate(self.dtype)?;
        self.bitfield = Some(bitfield);
        Ok(self)
    }

    #[must_use]
    pub fn with_enum(mut self, enum_def: EnumDef) -> Self {
        self.enum_def = Some(enum_def);
        self
    }

    /// Bytes occupied in device memory.
    pub fn size(&self) -> usize {
        self.dtype.size()
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        match self.bitfield {
            Some(bf) => decode_bitfield(self.dtype, self.endianness, bf, bytes),
            None => decode_value(self.dtype, self.endianness, bytes),
        }
    }

    pub fn encode(&self, value: Value) -> Result<EncodedWrite, CodecError> {
        match self.bitfield {
            Some(bf) => {
                let (data, mask) = encode_bitfield(self.dtype, self.endianness, bf, value)?;
                Ok(EncodedWrite::Masked { data, mask })
            }
            None => encode_value(self.dtype, self.endianness, value).map(EncodedWrite::Plain),
        }
    }
}

/// A device value addressed by a 16-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpvDef {
    pub id: u16,
    pub dtype: EmbeddedDataType,
}
