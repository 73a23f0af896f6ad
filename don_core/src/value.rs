//! Typed return values and their on-chain byte encodings.
//!
//! Numeric values travel as 32-byte big-endian words (two's complement for
//! `int256`); strings as raw UTF-8; bytes verbatim.

use crate::error::{DonError, Result};
use alloy_primitives::{I256, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Width of an encoded numeric word.
pub const WORD_BYTES: usize = 32;

/// The type a request expects user code to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReturnType {
    Uint256,
    Int256,
    String,
    Bytes,
}

impl ReturnType {
    /// Returns the canonical type name.
    pub fn name(&self) -> &'static str {
        match self {
            ReturnType::Uint256 => "uint256",
            ReturnType::Int256 => "int256",
            ReturnType::String => "string",
            ReturnType::Bytes => "bytes",
        }
    }

    /// Returns true for fixed-width numeric types.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ReturnType::Uint256 | ReturnType::Int256)
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            ReturnType::Uint256 => 0,
            ReturnType::Int256 => 1,
            ReturnType::String => 2,
            ReturnType::Bytes => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ReturnType::Uint256),
            1 => Some(ReturnType::Int256),
            2 => Some(ReturnType::String),
            3 => Some(ReturnType::Bytes),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReturnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReturnType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uint" | "uint256" => Ok(ReturnType::Uint256),
            "int" | "int256" => Ok(ReturnType::Int256),
            "string" => Ok(ReturnType::String),
            "bytes" | "Buffer" | "buffer" => Ok(ReturnType::Bytes),
            _ => Err(format!("Unknown return type: {}", s)),
        }
    }
}

impl TryFrom<String> for ReturnType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReturnType> for String {
    fn from(value: ReturnType) -> Self {
        value.name().to_string()
    }
}

/// A value returned by user code, or decoded from a fulfillment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnValue {
    Uint256(U256),
    Int256(I256),
    String(String),
    Bytes(Vec<u8>),
}

impl ReturnValue {
    /// Creates a `uint256` value.
    pub fn uint(value: u64) -> Self {
        ReturnValue::Uint256(U256::from(value))
    }

    /// Creates an `int256` value.
    pub fn int(value: i64) -> Self {
        let magnitude = U256::from(value.unsigned_abs());
        let raw = if value < 0 {
            magnitude.wrapping_neg()
        } else {
            magnitude
        };
        ReturnValue::Int256(I256::from_raw(raw))
    }

    /// Returns the value's type.
    pub fn return_type(&self) -> ReturnType {
        match self {
            ReturnValue::Uint256(_) => ReturnType::Uint256,
            ReturnValue::Int256(_) => ReturnType::Int256,
            ReturnValue::String(_) => ReturnType::String,
            ReturnValue::Bytes(_) => ReturnType::Bytes,
        }
    }

    /// Encodes the value for delivery in a fulfillment.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ReturnValue::Uint256(v) => v.to_be_bytes::<WORD_BYTES>().to_vec(),
            ReturnValue::Int256(v) => v.into_raw().to_be_bytes::<WORD_BYTES>().to_vec(),
            ReturnValue::String(s) => s.as_bytes().to_vec(),
            ReturnValue::Bytes(b) => b.clone(),
        }
    }

    /// Decodes raw fulfillment bytes as `expected`.
    ///
    /// Numeric types must consume exactly one word; strings must be UTF-8.
    pub fn decode(bytes: &[u8], expected: ReturnType) -> Result<Self> {
        match expected {
            ReturnType::Uint256 => Ok(ReturnValue::Uint256(U256::from_be_bytes(word(bytes, expected)?))),
            ReturnType::Int256 => {
                let raw = U256::from_be_bytes(word(bytes, expected)?);
                Ok(ReturnValue::Int256(I256::from_raw(raw)))
            }
            ReturnType::String => String::from_utf8(bytes.to_vec())
                .map(ReturnValue::String)
                .map_err(|e| DonError::type_mismatch(format!("string is not UTF-8: {}", e))),
            ReturnType::Bytes => Ok(ReturnValue::Bytes(bytes.to_vec())),
        }
    }
}

impl std::fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReturnValue::Uint256(v) => write!(f, "{}", v),
            ReturnValue::Int256(v) => write!(f, "{}", v),
            ReturnValue::String(s) => write!(f, "{:?}", s),
            ReturnValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

fn word(bytes: &[u8], expected: ReturnType) -> Result<[u8; WORD_BYTES]> {
    bytes.try_into().map_err(|_| {
        DonError::type_mismatch(format!(
            "{} needs exactly {} bytes, got {}",
            expected,
            WORD_BYTES,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_return_type_aliases() {
        assert_eq!("uint".parse::<ReturnType>().unwrap(), ReturnType::Uint256);
        assert_eq!("int256".parse::<ReturnType>().unwrap(), ReturnType::Int256);
        assert_eq!("Buffer".parse::<ReturnType>().unwrap(), ReturnType::Bytes);
        assert!("float".parse::<ReturnType>().is_err());

        let parsed: ReturnType = serde_json::from_str("\"int\"").unwrap();
        assert_eq!(parsed, ReturnType::Int256);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"int256\"");
    }

    #[test]
    fn test_round_trip_each_type() {
        let values = [
            ReturnValue::uint(40_000),
            ReturnValue::int(-42),
            ReturnValue::String("Email sent successfully.".into()),
            ReturnValue::Bytes(vec![0, 1, 2, 0xff]),
        ];
        for value in values {
            let ty = value.return_type();
            assert_eq!(ReturnValue::decode(&value.encode(), ty).unwrap(), value);
        }
    }

    #[test]
    fn test_negative_int_is_twos_complement() {
        let encoded = ReturnValue::int(-1).encode();
        assert_eq!(encoded, vec![0xff; 32]);
    }

    #[test]
    fn test_numeric_width_enforced() {
        let err = ReturnValue::decode(&[0u8; 31], ReturnType::Uint256).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        let err = ReturnValue::decode(&[0u8; 33], ReturnType::Int256).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let err = ReturnValue::decode(&[0xc3, 0x28], ReturnType::String).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }
}
