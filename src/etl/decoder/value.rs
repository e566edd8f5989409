//! Typed field values produced by the decoder.

use starknet::core::types::{Felt, U256};
use std::fmt;

/// A decoded Cairo value.
///
/// Optional members are always [`FieldValue::Option`], never a loosely
/// tagged object, so handlers can match exhaustively on presence.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `felt252`, `ContractAddress`, `ClassHash` and `EthAddress`.
    Felt(Felt),
    Bool(bool),
    /// `u8` through `u128`.
    Uint(u128),
    /// `i8` through `i128`.
    Int(i128),
    U256(U256),
    /// `ByteArray` and `bytes31`.
    String(String),
    Option(Option<Box<FieldValue>>),
    /// Any other enum, with the active variant name.
    Enum {
        variant: String,
        value: Box<FieldValue>,
    },
    Struct(Vec<(String, FieldValue)>),
    /// The unit type `()`.
    Unit,
}

impl FieldValue {
    pub fn as_felt(&self) -> Option<Felt> {
        match self {
            Self::Felt(felt) => Some(*felt),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Unsigned view of any integer value that fits in 128 bits.
    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Self::Uint(value) => Some(*value),
            Self::Int(value) => u128::try_from(*value).ok(),
            Self::U256(value) if value.high() == 0 => Some(value.low()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// `Some(None)` for a decoded `None`, `Some(Some(v))` for `Some(v)`,
    /// and `None` when the value is not an option at all.
    pub fn as_option(&self) -> Option<Option<&FieldValue>> {
        match self {
            Self::Option(inner) => Some(inner.as_deref()),
            _ => None,
        }
    }

    /// Looks up a member of a decoded struct.
    pub fn member(&self, name: &str) -> Option<&FieldValue> {
        match self {
            Self::Struct(members) => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Felt(felt) => write!(f, "{felt:#x}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::U256(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Option(None) => f.write_str("None"),
            Self::Option(Some(value)) => write!(f, "Some({value})"),
            Self::Enum { variant, value } => match value.as_ref() {
                Self::Unit => f.write_str(variant),
                value => write!(f, "{variant}({value})"),
            },
            Self::Struct(members) => {
                f.write_str("{")?;
                for (idx, (name, value)) in members.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Unit => f.write_str("()"),
        }
    }
}

/// Sequential reader over a felt slice (event keys or data).
pub(crate) struct FeltReader<'a> {
    felts: &'a [Felt],
    position: usize,
}

impl<'a> FeltReader<'a> {
    pub(crate) fn new(felts: &'a [Felt]) -> Self {
        Self { felts, position: 0 }
    }

    pub(crate) fn next(&mut self, what: &str) -> Result<Felt, String> {
        let felt = self
            .felts
            .get(self.position)
            .copied()
            .ok_or_else(|| format!("ran out of felts while reading {what} at position {}", self.position))?;
        self.position += 1;
        Ok(felt)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.felts.len().saturating_sub(self.position)
    }
}

pub(crate) fn felt_to_u128(felt: Felt, what: &str) -> Result<u128, String> {
    u128::try_from(felt).map_err(|_| format!("{what} value {felt:#x} does not fit in 128 bits"))
}

pub(crate) fn felt_to_unsigned(felt: Felt, bits: u32, what: &str) -> Result<u128, String> {
    let value = felt_to_u128(felt, what)?;
    if bits < 128 && value >> bits != 0 {
        return Err(format!("{what} value {value} does not fit in u{bits}"));
    }
    Ok(value)
}

/// Negative Cairo integers are encoded as `P - |x|`.
pub(crate) fn felt_to_signed(felt: Felt, bits: u32, what: &str) -> Result<i128, String> {
    let value = match u128::try_from(felt) {
        Ok(positive) if positive <= i128::MAX as u128 => positive as i128,
        _ => {
            let magnitude = felt_to_u128(Felt::ZERO - felt, what)?;
            0_i128
                .checked_sub_unsigned(magnitude)
                .ok_or_else(|| format!("{what} value -{magnitude} does not fit in i128"))?
        }
    };

    if bits < 128 {
        let bound = 1_i128 << (bits - 1);
        if value < -bound || value >= bound {
            return Err(format!("{what} value {value} does not fit in i{bits}"));
        }
    }
    Ok(value)
}

/// Last `len` bytes of the big-endian felt encoding.
pub(crate) fn felt_to_word_bytes(felt: Felt, len: usize, what: &str) -> Result<Vec<u8>, String> {
    if len > 31 {
        return Err(format!("{what} word length {len} exceeds 31 bytes"));
    }
    let bytes = felt.to_bytes_be();
    let (padding, word) = bytes.split_at(32 - len);
    if padding.iter().any(|b| *b != 0) {
        return Err(format!("{what} word {felt:#x} is longer than {len} bytes"));
    }
    Ok(word.to_vec())
}

/// Last `len` bytes of the big-endian felt encoding as UTF-8.
pub(crate) fn felt_to_string(felt: Felt, len: usize, what: &str) -> Result<String, String> {
    utf8(felt_to_word_bytes(felt, len, what)?, what)
}

pub(crate) fn utf8(bytes: Vec<u8>, what: &str) -> Result<String, String> {
    String::from_utf8(bytes).map_err(|e| format!("{what} is not valid UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_values_round_trip_through_field_negation() {
        let minus_five = Felt::ZERO - Felt::from(5_u64);
        assert_eq!(felt_to_signed(minus_five, 32, "i32"), Ok(-5));
        assert_eq!(felt_to_signed(Felt::from(127_u64), 8, "i8"), Ok(127));
        assert!(felt_to_signed(Felt::from(128_u64), 8, "i8").is_err());
    }

    #[test]
    fn unsigned_range_is_enforced() {
        assert_eq!(felt_to_unsigned(Felt::from(255_u64), 8, "u8"), Ok(255));
        assert!(felt_to_unsigned(Felt::from(256_u64), 8, "u8").is_err());
        assert!(felt_to_unsigned(Felt::ZERO - Felt::ONE, 128, "u128").is_err());
    }

    #[test]
    fn short_words_decode_as_utf8() {
        let felt = Felt::from_hex_unchecked("0x6869");
        assert_eq!(felt_to_string(felt, 2, "word").as_deref(), Ok("hi"));
        assert!(felt_to_string(felt, 1, "word").is_err());
    }

    #[test]
    fn option_display_is_explicit() {
        let some = FieldValue::Option(Some(Box::new(FieldValue::Uint(42))));
        assert_eq!(some.to_string(), "Some(42)");
        assert_eq!(FieldValue::Option(None).to_string(), "None");
        assert_eq!(some.as_option().flatten().and_then(FieldValue::as_u128), Some(42));
    }
}
