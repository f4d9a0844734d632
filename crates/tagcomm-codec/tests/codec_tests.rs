//! Integration tests for type resolution and the binary codec.
//!
//! These tests exercise the public API the runtime relies on.

use std::sync::Arc;
use tagcomm_codec::{
    resolve_bit_size_str, CodecError, CodecResult, OpaqueBlobCodec, TagValue, TypeName, UdtCodec,
    ValueCodec,
};
use tagcomm_common::TagError;

/// Handler for a two-field record `{ id: UDINT, DataState: INT }`.
struct OrderCodec;

impl UdtCodec for OrderCodec {
    fn decode(&self, type_name: &str, data: &[u8]) -> CodecResult<TagValue> {
        if data.len() != 6 {
            return Err(CodecError::Udt {
                type_name: type_name.to_string(),
                message: format!("expected 6 bytes, got {}", data.len()),
            });
        }
        let id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let state = i16::from_le_bytes([data[4], data[5]]);
        Ok(TagValue::Array(vec![id.into(), state.into()]))
    }

    fn encode(&self, type_name: &str, value: &TagValue, out: &mut Vec<u8>) -> CodecResult<()> {
        match value {
            TagValue::Array(items) if items.len() == 2 => {
                let id = items[0].as_i64().unwrap_or_default();
                let state = items[1].as_i64().unwrap_or_default();
                out.extend_from_slice(&u32::try_from(id).unwrap_or_default().to_le_bytes());
                out.extend_from_slice(&i16::try_from(state).unwrap_or_default().to_le_bytes());
                Ok(())
            }
            other => Err(CodecError::Udt {
                type_name: type_name.to_string(),
                message: format!("cannot encode {}", other.kind()),
            }),
        }
    }
}

#[test]
fn test_array_size_matches_element_product() {
    for (lo, hi, elem, bits) in [
        (0, 9, "INT", 16),
        (1, 4, "LREAL", 64),
        (-3, 3, "BOOL", 8),
        (0, 1, "STRING(9)", 80),
    ] {
        let ty = format!("ARRAY [{lo}..{hi}] OF {elem}");
        assert_eq!(
            resolve_bit_size_str(&ty, None).unwrap(),
            (hi - lo + 1) * bits,
            "{ty}"
        );
    }
}

#[test]
fn test_bad_bounds_lift_to_invalid_definition() {
    let err = resolve_bit_size_str("ARRAY [4..2] OF INT", None).unwrap_err();
    match err.for_tag("MAIN.values") {
        TagError::InvalidTagDefinition { tag, .. } => assert_eq!(tag, "MAIN.values"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_string_overflow_lifts_to_value_too_large() {
    let codec = ValueCodec::new();
    let ty = TypeName::parse("STRING(2)").unwrap();
    let err = codec
        .encode(&ty, 24, &TagValue::from("toolong"))
        .unwrap_err()
        .for_tag("GVL.label");
    assert!(matches!(err, TagError::ValueTooLarge { .. }));
}

#[test]
fn test_custom_udt_handler_takes_precedence() {
    let codec = ValueCodec::new();
    codec.register_udt("ST_Order", Arc::new(OrderCodec));
    let ty = TypeName::parse("ST_Order").unwrap();

    let value = TagValue::Array(vec![TagValue::U32(77), TagValue::I16(1)]);
    let encoded = codec.encode(&ty, 48, &value).unwrap();
    assert_eq!(encoded.bytes, vec![77, 0, 0, 0, 1, 0]);
    assert_eq!(codec.decode(&ty, 48, &encoded.bytes).unwrap(), Some(value));

    // Replacing the handler changes the decoded shape
    codec.register_udt("ST_ORDER", Arc::new(OpaqueBlobCodec));
    let blob = codec.decode(&ty, 48, &encoded.bytes).unwrap().unwrap();
    assert_eq!(blob.as_bytes(), Some(&encoded.bytes[..]));
}

#[test]
fn test_udt_handler_errors_surface() {
    let codec = ValueCodec::new();
    codec.register_udt("ST_Order", Arc::new(OrderCodec));
    let ty = TypeName::parse("ST_Order").unwrap();
    let err = codec.decode(&ty, 32, &[0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, CodecError::Udt { .. }));
}

#[test]
fn test_nested_array_roundtrip() {
    let codec = ValueCodec::new();
    let ty = TypeName::parse("ARRAY [0..1] OF ARRAY [0..2] OF BYTE").unwrap();
    let value = TagValue::Array(vec![
        TagValue::Array(vec![1u8.into(), 2u8.into(), 3u8.into()]),
        TagValue::Array(vec![4u8.into(), 5u8.into(), 6u8.into()]),
    ]);
    let bits = resolve_bit_size_str("ARRAY [0..1] OF ARRAY [0..2] OF BYTE", None).unwrap();
    let encoded = codec.encode(&ty, bits, &value).unwrap();
    assert_eq!(encoded.bytes, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(codec.decode(&ty, bits, &encoded.bytes).unwrap(), Some(value));
}

#[test]
fn test_array_with_unreadable_element_is_unreadable() {
    let codec = ValueCodec::new();
    let ty = TypeName::parse("ARRAY [0..1] OF ST_Unknown").unwrap();
    assert_eq!(codec.decode(&ty, 0, &[]).unwrap(), None);
}

#[test]
fn test_array_element_count_checked_on_encode() {
    let codec = ValueCodec::new();
    let ty = TypeName::parse("ARRAY [0..2] OF INT").unwrap();
    let short = TagValue::Array(vec![1i16.into()]);
    assert!(matches!(
        codec.encode(&ty, 48, &short),
        Err(CodecError::TypeMismatch { .. })
    ));
}

#[test]
fn test_default_string_roundtrip() {
    let codec = ValueCodec::new();
    let ty = TypeName::parse("STRING").unwrap();
    let bits = resolve_bit_size_str("STRING", None).unwrap();
    let text: String = "x".repeat(80);
    let encoded = codec.encode(&ty, bits, &TagValue::String(text.clone())).unwrap();
    assert_eq!(encoded.bytes.len(), 81);
    assert_eq!(
        codec.decode(&ty, bits, &encoded.bytes).unwrap(),
        Some(TagValue::String(text))
    );
}
