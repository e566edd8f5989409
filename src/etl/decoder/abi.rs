//! Sierra ABI model used to drive event decoding.
//!
//! Only the parts of the ABI relevant to events are retained: struct events with
//! their `key`/`data` members, and the struct/enum definitions those members refer to.

use serde::Deserialize;
use starknet::core::types::{Felt, U256};
use starknet::core::utils::get_selector_from_name;
use std::collections::HashMap;

use super::value::{
    felt_to_signed, felt_to_string, felt_to_u128, felt_to_unsigned, felt_to_word_bytes, utf8,
    FeltReader, FieldValue,
};
use crate::error::IndexerError;

/// Nested struct definitions deeper than this are assumed to be recursive.
const MAX_TYPE_DEPTH: usize = 16;

/// Upper bound on `ByteArray` words, to reject garbage lengths early.
const MAX_BYTE_ARRAY_WORDS: u64 = 4096;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AbiEntry {
    Event(RawEvent),
    Struct(RawStruct),
    Enum(RawEnum),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    name: String,
    kind: String,
    #[serde(default)]
    members: Vec<RawEventMember>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEventMember {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawStruct {
    name: String,
    members: Vec<RawNamedType>,
}

#[derive(Debug, Deserialize)]
struct RawEnum {
    name: String,
    variants: Vec<RawNamedType>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawNamedType {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

/// A contract ABI, parsed once and shared by every filter on that contract.
#[derive(Debug, Clone, Default)]
pub struct ContractAbi {
    events: HashMap<String, Vec<RawEventMember>>,
    structs: HashMap<String, Vec<RawNamedType>>,
    enums: HashMap<String, Vec<RawNamedType>>,
}

impl ContractAbi {
    /// Parses a Sierra ABI given as a JSON string.
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| IndexerError::Initialization(format!("invalid ABI JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Parses a Sierra ABI from an already deserialized JSON array.
    pub fn from_value(value: serde_json::Value) -> Result<Self, IndexerError> {
        let entries: Vec<AbiEntry> = serde_json::from_value(value)
            .map_err(|e| IndexerError::Initialization(format!("invalid ABI: {e}")))?;

        let mut abi = Self::default();
        for entry in entries {
            match entry {
                // Enum events only group struct events, they carry no layout of their own.
                AbiEntry::Event(event) if event.kind == "struct" => {
                    abi.events.insert(event.name, event.members);
                }
                AbiEntry::Struct(s) => {
                    abi.structs.insert(s.name, s.members);
                }
                AbiEntry::Enum(e) => {
                    abi.enums.insert(e.name, e.variants);
                }
                AbiEntry::Event(_) | AbiEntry::Other => {}
            }
        }
        Ok(abi)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.contains_key(name)
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Resolves the decoding layout of a struct event by its fully qualified name.
    pub fn event(&self, name: &str) -> Result<EventAbi, IndexerError> {
        let members = self.events.get(name).ok_or_else(|| {
            IndexerError::Initialization(format!("event {name} is not declared in the ABI"))
        })?;

        let short_name = name.rsplit("::").next().unwrap_or(name);
        let selector = get_selector_from_name(short_name).map_err(|e| {
            IndexerError::Initialization(format!("cannot compute selector of {name}: {e}"))
        })?;

        let members = members
            .iter()
            .map(|member| {
                let kind = match member.kind.as_str() {
                    "key" => MemberKind::Key,
                    "data" => MemberKind::Data,
                    other => {
                        return Err(IndexerError::Initialization(format!(
                            "member {} of {name} has unsupported kind {other}",
                            member.name
                        )))
                    }
                };
                let ty = self.resolve(&member.ty, 0).map_err(|reason| {
                    IndexerError::Initialization(format!(
                        "member {} of {name}: {reason}",
                        member.name
                    ))
                })?;
                Ok(EventMember {
                    name: member.name.clone(),
                    kind,
                    ty,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventAbi {
            name: name.to_string(),
            selector,
            members,
        })
    }

    fn resolve(&self, ty: &str, depth: usize) -> Result<CairoType, String> {
        if depth > MAX_TYPE_DEPTH {
            return Err(format!("type {ty} nests deeper than {MAX_TYPE_DEPTH} levels"));
        }

        let resolved = match ty {
            "core::felt252" => CairoType::Felt,
            "core::starknet::contract_address::ContractAddress"
            | "core::starknet::class_hash::ClassHash"
            | "core::starknet::eth_address::EthAddress" => CairoType::Felt,
            "core::bool" => CairoType::Bool,
            "core::integer::u8" => CairoType::Unsigned(8),
            "core::integer::u16" => CairoType::Unsigned(16),
            "core::integer::u32" | "core::integer::usize" => CairoType::Unsigned(32),
            "core::integer::u64" => CairoType::Unsigned(64),
            "core::integer::u128" => CairoType::Unsigned(128),
            "core::integer::i8" => CairoType::Signed(8),
            "core::integer::i16" => CairoType::Signed(16),
            "core::integer::i32" => CairoType::Signed(32),
            "core::integer::i64" => CairoType::Signed(64),
            "core::integer::i128" => CairoType::Signed(128),
            "core::integer::u256" => CairoType::U256,
            "core::byte_array::ByteArray" => CairoType::ByteArray,
            "core::bytes_31::bytes31" => CairoType::Bytes31,
            "()" => CairoType::Unit,
            _ => {
                if let Some(inner) = ty
                    .strip_prefix("core::option::Option::<")
                    .and_then(|rest| rest.strip_suffix('>'))
                {
                    CairoType::Option(Box::new(self.resolve(inner, depth + 1)?))
                } else if let Some(members) = self.structs.get(ty) {
                    let members = members
                        .iter()
                        .map(|m| Ok((m.name.clone(), self.resolve(&m.ty, depth + 1)?)))
                        .collect::<Result<Vec<_>, String>>()?;
                    CairoType::Struct(members)
                } else if let Some(variants) = self.enums.get(ty) {
                    let variants = variants
                        .iter()
                        .map(|v| Ok((v.name.clone(), self.resolve(&v.ty, depth + 1)?)))
                        .collect::<Result<Vec<_>, String>>()?;
                    CairoType::Enum(variants)
                } else {
                    return Err(format!("unsupported type {ty}"));
                }
            }
        };
        Ok(resolved)
    }
}

/// Where a member is serialized in the emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// After the selector in `keys`.
    Key,
    Data,
}

/// Resolved Cairo type of an event member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CairoType {
    Felt,
    Bool,
    Unsigned(u32),
    Signed(u32),
    U256,
    ByteArray,
    Bytes31,
    Option(Box<CairoType>),
    Enum(Vec<(String, CairoType)>),
    Struct(Vec<(String, CairoType)>),
    Unit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMember {
    pub name: String,
    pub kind: MemberKind,
    pub ty: CairoType,
}

/// Decoding layout of a single event: its name, selector and ordered members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAbi {
    name: String,
    selector: Felt,
    members: Vec<EventMember>,
}

impl EventAbi {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `sn_keccak` of the last path segment of the event name.
    pub fn selector(&self) -> Felt {
        self.selector
    }

    pub fn members(&self) -> &[EventMember] {
        &self.members
    }

    /// Decodes keys (without the selector) and data into named values.
    ///
    /// Every felt must be consumed; leftovers mean the ABI does not describe the log.
    pub(crate) fn decode_fields(
        &self,
        keys: &[Felt],
        data: &[Felt],
    ) -> Result<Vec<(String, FieldValue)>, String> {
        let mut keys = FeltReader::new(keys);
        let mut data = FeltReader::new(data);

        let mut fields = Vec::with_capacity(self.members.len());
        for member in &self.members {
            let reader = match member.kind {
                MemberKind::Key => &mut keys,
                MemberKind::Data => &mut data,
            };
            let value = decode_value(&member.ty, reader, &member.name)?;
            fields.push((member.name.clone(), value));
        }

        if keys.remaining() > 0 || data.remaining() > 0 {
            return Err(format!(
                "{} key(s) and {} data felt(s) left after decoding",
                keys.remaining(),
                data.remaining()
            ));
        }
        Ok(fields)
    }
}

fn decode_value(
    ty: &CairoType,
    reader: &mut FeltReader<'_>,
    what: &str,
) -> Result<FieldValue, String> {
    let value = match ty {
        CairoType::Felt => FieldValue::Felt(reader.next(what)?),
        CairoType::Bool => match reader.next(what)? {
            f if f == Felt::ZERO => FieldValue::Bool(false),
            f if f == Felt::ONE => FieldValue::Bool(true),
            f => return Err(format!("{what} value {f:#x} is not a bool")),
        },
        CairoType::Unsigned(bits) => {
            FieldValue::Uint(felt_to_unsigned(reader.next(what)?, *bits, what)?)
        }
        CairoType::Signed(bits) => {
            FieldValue::Int(felt_to_signed(reader.next(what)?, *bits, what)?)
        }
        CairoType::U256 => {
            let low = felt_to_u128(reader.next(what)?, what)?;
            let high = felt_to_u128(reader.next(what)?, what)?;
            FieldValue::U256(U256::from_words(low, high))
        }
        CairoType::ByteArray => FieldValue::String(decode_byte_array(reader, what)?),
        CairoType::Bytes31 => {
            let word = felt_to_string(reader.next(what)?, 31, what)?;
            FieldValue::String(word.trim_start_matches('\0').to_string())
        }
        CairoType::Option(inner) => match variant_index(reader, what)? {
            0 => FieldValue::Option(Some(Box::new(decode_value(inner, reader, what)?))),
            1 => FieldValue::Option(None),
            idx => return Err(format!("{what} has invalid Option variant {idx}")),
        },
        CairoType::Enum(variants) => {
            let idx = variant_index(reader, what)?;
            let (variant, ty) = variants
                .get(idx as usize)
                .ok_or_else(|| format!("{what} has invalid enum variant {idx}"))?;
            FieldValue::Enum {
                variant: variant.clone(),
                value: Box::new(decode_value(ty, reader, what)?),
            }
        }
        CairoType::Struct(members) => {
            let mut values = Vec::with_capacity(members.len());
            for (name, ty) in members {
                values.push((name.clone(), decode_value(ty, reader, name)?));
            }
            FieldValue::Struct(values)
        }
        CairoType::Unit => FieldValue::Unit,
    };
    Ok(value)
}

fn variant_index(reader: &mut FeltReader<'_>, what: &str) -> Result<u64, String> {
    let idx = felt_to_unsigned(reader.next(what)?, 64, what)?;
    Ok(idx as u64)
}

/// `[full_word_count, ...full_words(31 bytes), pending_word, pending_word_len]`
fn decode_byte_array(reader: &mut FeltReader<'_>, what: &str) -> Result<String, String> {
    let word_count = felt_to_unsigned(reader.next(what)?, 64, what)? as u64;
    if word_count > MAX_BYTE_ARRAY_WORDS || word_count as usize > reader.remaining() {
        return Err(format!("{what} declares {word_count} words, more than available"));
    }

    // Characters may straddle word boundaries, so UTF-8 is checked on the whole array.
    let mut bytes = Vec::with_capacity((word_count as usize + 1) * 31);
    for _ in 0..word_count {
        bytes.extend(felt_to_word_bytes(reader.next(what)?, 31, what)?);
    }

    let pending_word = reader.next(what)?;
    let pending_len = felt_to_unsigned(reader.next(what)?, 8, what)? as usize;
    if pending_len > 30 {
        return Err(format!("{what} pending word length {pending_len} exceeds 30 bytes"));
    }
    bytes.extend(felt_to_word_bytes(pending_word, pending_len, what)?);
    utf8(bytes, what)
}

#[cfg(test)]
mod tests {
    use super::*;
    use starknet::core::utils::cairo_short_string_to_felt;
    use starknet::macros::selector;

    const GREETING_ABI: &str = r#"[
        {"type": "impl", "name": "YourContractImpl", "interface_name": "contracts::YourContract::IYourContract"},
        {"type": "struct", "name": "core::integer::u256", "members": [
            {"name": "low", "type": "core::integer::u128"},
            {"name": "high", "type": "core::integer::u128"}
        ]},
        {"type": "enum", "name": "core::option::Option::<core::integer::u256>", "variants": [
            {"name": "Some", "type": "core::integer::u256"},
            {"name": "None", "type": "()"}
        ]},
        {"type": "event", "name": "contracts::YourContract::YourContract::GreetingChanged", "kind": "struct", "members": [
            {"name": "greeting_setter", "type": "core::starknet::contract_address::ContractAddress", "kind": "key"},
            {"name": "new_greeting", "type": "core::byte_array::ByteArray", "kind": "key"},
            {"name": "premium", "type": "core::bool", "kind": "data"},
            {"name": "value", "type": "core::option::Option::<core::integer::u256>", "kind": "data"}
        ]},
        {"type": "event", "name": "contracts::YourContract::YourContract::Event", "kind": "enum", "variants": [
            {"name": "GreetingChanged", "type": "contracts::YourContract::YourContract::GreetingChanged", "kind": "nested"}
        ]}
    ]"#;

    const GREETING_CHANGED: &str = "contracts::YourContract::YourContract::GreetingChanged";

    fn byte_array(s: &str) -> Vec<Felt> {
        assert!(s.len() <= 30, "test helper only encodes pending words");
        let pending = if s.is_empty() {
            Felt::ZERO
        } else {
            cairo_short_string_to_felt(s).unwrap()
        };
        vec![Felt::ZERO, pending, Felt::from(s.len() as u64)]
    }

    #[test]
    fn event_layout_resolves_from_sierra_abi() {
        let abi = ContractAbi::from_json(GREETING_ABI).unwrap();
        let event = abi.event(GREETING_CHANGED).unwrap();

        assert_eq!(event.selector(), selector!("GreetingChanged"));
        let kinds: Vec<_> = event.members().iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MemberKind::Key, MemberKind::Key, MemberKind::Data, MemberKind::Data]
        );
        assert_eq!(
            event.members()[3].ty,
            CairoType::Option(Box::new(CairoType::U256))
        );
    }

    #[test]
    fn unknown_event_is_an_initialization_error() {
        let abi = ContractAbi::from_json(GREETING_ABI).unwrap();
        let err = abi.event("contracts::YourContract::YourContract::Missing").unwrap_err();
        assert!(matches!(err, IndexerError::Initialization(_)));
    }

    #[test]
    fn decodes_keys_and_data_in_member_order() {
        let abi = ContractAbi::from_json(GREETING_ABI).unwrap();
        let event = abi.event(GREETING_CHANGED).unwrap();

        let mut keys = vec![Felt::ONE];
        keys.extend(byte_array("hi"));
        let data = vec![Felt::ONE, Felt::ZERO, Felt::from(42_u64), Felt::ZERO];

        let fields = event.decode_fields(&keys, &data).unwrap();
        assert_eq!(fields[0], ("greeting_setter".to_string(), FieldValue::Felt(Felt::ONE)));
        assert_eq!(fields[1], ("new_greeting".to_string(), FieldValue::String("hi".to_string())));
        assert_eq!(fields[2], ("premium".to_string(), FieldValue::Bool(true)));
        assert_eq!(
            fields[3].1.as_option().flatten().and_then(FieldValue::as_u128),
            Some(42)
        );
    }

    #[test]
    fn none_variant_consumes_only_the_index() {
        let abi = ContractAbi::from_json(GREETING_ABI).unwrap();
        let event = abi.event(GREETING_CHANGED).unwrap();

        let mut keys = vec![Felt::from(0xabc_u64)];
        keys.extend(byte_array(""));
        let data = vec![Felt::ZERO, Felt::ONE];

        let fields = event.decode_fields(&keys, &data).unwrap();
        assert_eq!(fields[1].1, FieldValue::String(String::new()));
        assert_eq!(fields[3].1, FieldValue::Option(None));
    }

    #[test]
    fn trailing_or_missing_felts_are_rejected() {
        let abi = ContractAbi::from_json(GREETING_ABI).unwrap();
        let event = abi.event(GREETING_CHANGED).unwrap();

        let mut keys = vec![Felt::ONE];
        keys.extend(byte_array("hi"));

        let truncated = vec![Felt::ONE, Felt::ZERO, Felt::from(42_u64)];
        assert!(event.decode_fields(&keys, &truncated).is_err());

        let trailing = vec![Felt::ONE, Felt::ONE, Felt::from(7_u64)];
        let err = event.decode_fields(&keys, &trailing).unwrap_err();
        assert!(err.contains("left after decoding"));
    }

    #[test]
    fn multi_word_byte_array() {
        let long = "a".repeat(31);
        let mut felts = vec![Felt::ONE, cairo_short_string_to_felt(&long).unwrap()];
        felts.extend([cairo_short_string_to_felt("bc").unwrap(), Felt::from(2_u64)]);

        let mut reader = FeltReader::new(&felts);
        let decoded = decode_byte_array(&mut reader, "greeting").unwrap();
        assert_eq!(decoded, format!("{long}bc"));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn multi_byte_char_split_across_words() {
        // 30 x 'a' then "é" (0xC3 0xA9): the full word ends on 0xC3, the pending word holds 0xA9.
        let mut full = [0_u8; 32];
        full[1..31].fill(b'a');
        full[31] = 0xC3;
        let felts = vec![
            Felt::ONE,
            Felt::from_bytes_be(&full),
            Felt::from(0xA9_u64),
            Felt::ONE,
        ];

        let mut reader = FeltReader::new(&felts);
        let decoded = decode_byte_array(&mut reader, "greeting").unwrap();
        assert_eq!(decoded, format!("{}é", "a".repeat(30)));
    }

    #[test]
    fn invalid_utf8_across_the_whole_array_is_rejected() {
        let felts = vec![Felt::ZERO, Felt::from(0xC3_u64), Felt::ONE];
        let mut reader = FeltReader::new(&felts);
        let err = decode_byte_array(&mut reader, "greeting").unwrap_err();
        assert!(err.contains("not valid UTF-8"));
    }
}
