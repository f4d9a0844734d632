//! Binary codec for IEC 61131-3 values.
//!
//! All multi-byte values are little-endian. STRINGs are fixed-length,
//! null-terminated Latin-1 buffers; ARRAYs are contiguous fixed-stride
//! elements; UDTs are opaque records handed to a registered [`UdtCodec`].

use crate::error::{CodecError, CodecResult};
use crate::types::{PrimitiveType, TypeName, DEFAULT_STRING_LENGTH};
use crate::value::TagValue;
use crate::bitsize::string_bit_size;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::{debug, trace};

/// Upper bound on buffer space reserved up front for an encoding.
const MAX_PREALLOCATION: usize = 64 * 1024;

/// Per-type handler for user-defined types.
pub trait UdtCodec: Send + Sync {
    /// Turn a raw record into a value.
    ///
    /// # Errors
    ///
    /// Any [`CodecError`]; handlers typically report [`CodecError::Udt`].
    fn decode(&self, type_name: &str, data: &[u8]) -> CodecResult<TagValue>;

    /// Append the raw record for `value` to `out`.
    ///
    /// # Errors
    ///
    /// Any [`CodecError`]; handlers typically report [`CodecError::Udt`].
    fn encode(&self, type_name: &str, value: &TagValue, out: &mut Vec<u8>) -> CodecResult<()>;
}

/// Handler that keeps UDT records as raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueBlobCodec;

impl UdtCodec for OpaqueBlobCodec {
    fn decode(&self, type_name: &str, data: &[u8]) -> CodecResult<TagValue> {
        Ok(TagValue::Blob {
            type_name: type_name.to_string(),
            data: data.to_vec(),
        })
    }

    fn encode(&self, type_name: &str, value: &TagValue, out: &mut Vec<u8>) -> CodecResult<()> {
        let bytes = value.as_bytes().ok_or_else(|| CodecError::TypeMismatch {
            expected: type_name.to_string(),
            actual: value.kind().to_string(),
        })?;
        out.extend_from_slice(bytes);
        Ok(())
    }
}

/// Result of [`ValueCodec::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    /// Bytes to send to the PLC.
    pub bytes: Vec<u8>,
    /// The value after numeric coercion, as the PLC will hold it.
    pub value: TagValue,
}

/// Encoder/decoder with a registry of UDT handlers.
#[derive(Default)]
pub struct ValueCodec {
    udts: RwLock<HashMap<String, Arc<dyn UdtCodec>>>,
}

impl fmt::Debug for ValueCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let udts = self.udts.read();
        let mut names: Vec<&String> = udts.keys().collect();
        names.sort();
        f.debug_struct("ValueCodec").field("udts", &names).finish()
    }
}

/// Number of bytes covered by `bit_size`; non-positive sizes cover nothing.
#[must_use]
pub fn byte_len(bit_size: i64) -> usize {
    if bit_size <= 0 {
        0
    } else {
        usize::try_from((bit_size + 7) / 8).unwrap_or(usize::MAX)
    }
}

fn registry_key(type_name: &TypeName) -> String {
    type_name.to_string().to_ascii_uppercase()
}

impl ValueCodec {
    /// Create a codec with an empty UDT registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a UDT name.
    pub fn register_udt(&self, type_name: &str, handler: Arc<dyn UdtCodec>) {
        let key = type_name.trim().to_ascii_uppercase();
        debug!(udt = %key, "Registered UDT handler");
        self.udts.write().insert(key, handler);
    }

    /// Remove the handler for a UDT name.
    pub fn unregister_udt(&self, type_name: &str) -> bool {
        self.udts
            .write()
            .remove(&type_name.trim().to_ascii_uppercase())
            .is_some()
    }

    /// Whether a handler is registered for the name.
    #[must_use]
    pub fn has_udt(&self, type_name: &str) -> bool {
        self.udts
            .read()
            .contains_key(&type_name.trim().to_ascii_uppercase())
    }

    fn udt(&self, type_name: &TypeName) -> Option<Arc<dyn UdtCodec>> {
        let udts = self.udts.read();
        if udts.is_empty() {
            return None;
        }
        udts.get(&registry_key(type_name)).cloned()
    }

    /// Decode one value of `type_name` occupying `bit_size` bits.
    ///
    /// `Ok(None)` means the type has no decoding; callers treat the tag as
    /// unreadable.
    ///
    /// # Errors
    ///
    /// [`CodecError::Truncated`] when `data` is shorter than the type needs,
    /// or whatever a registered UDT handler reports.
    pub fn decode(
        &self,
        type_name: &TypeName,
        bit_size: i64,
        data: &[u8],
    ) -> CodecResult<Option<TagValue>> {
        let mut reader = Cursor::new(data);
        self.decode_from(type_name, bit_size, &mut reader)
    }

    fn decode_from(
        &self,
        type_name: &TypeName,
        bit_size: i64,
        reader: &mut Cursor<&[u8]>,
    ) -> CodecResult<Option<TagValue>> {
        if let Some(handler) = self.udt(type_name) {
            let raw = read_exact(reader, byte_len(bit_size))?;
            return handler.decode(&type_name.to_string(), &raw).map(Some);
        }

        if let TypeName::Array { element, .. } = type_name {
            let count = type_name.element_count().unwrap_or(0);
            // Every element takes at least one byte
            let available = remaining(reader);
            if count > available {
                return Err(CodecError::Truncated(format!(
                    "{type_name} declares {count} elements, {available} bytes left"
                )));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                // Every element is read with the array's own bit size
                match self.decode_from(element, bit_size, reader)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            return Ok(Some(TagValue::Array(items)));
        }

        if let Some(primitive) = type_name.primitive() {
            return decode_primitive(primitive, reader).map(Some);
        }

        if type_name.is_enum_convention() && bit_size == 16 {
            return Ok(Some(TagValue::I16(reader.read_i16::<LittleEndian>()?)));
        }

        if type_name.is_string_like() {
            let raw = read_exact(reader, byte_len(bit_size))?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            return Ok(Some(TagValue::String(
                raw[..end].iter().map(|&b| char::from(b)).collect(),
            )));
        }

        let fallback = match bit_size {
            1 | 8 => TagValue::U8(reader.read_u8()?),
            16 => TagValue::U16(reader.read_u16::<LittleEndian>()?),
            32 => TagValue::U32(reader.read_u32::<LittleEndian>()?),
            64 => TagValue::U64(reader.read_u64::<LittleEndian>()?),
            _ => {
                trace!(data_type = %type_name, bit_size, "No decoding for type");
                return Ok(None);
            }
        };
        Ok(Some(fallback))
    }

    /// Encode `value` as `type_name`.
    ///
    /// Numeric values are coerced to the target width first; the coerced
    /// value is returned alongside the bytes.
    ///
    /// # Errors
    ///
    /// * [`CodecError::ValueTooLarge`] for strings or blobs beyond capacity
    /// * [`CodecError::OutOfRange`] / [`CodecError::TypeMismatch`] from coercion
    /// * [`CodecError::UnsupportedType`] when the type has no encoding
    pub fn encode(
        &self,
        type_name: &TypeName,
        bit_size: i64,
        value: &TagValue,
    ) -> CodecResult<Encoded> {
        let mut bytes = Vec::with_capacity(byte_len(bit_size).min(MAX_PREALLOCATION));
        let value = self.encode_into(type_name, bit_size, value, &mut bytes)?;
        Ok(Encoded { bytes, value })
    }

    fn encode_into(
        &self,
        type_name: &TypeName,
        bit_size: i64,
        value: &TagValue,
        out: &mut Vec<u8>,
    ) -> CodecResult<TagValue> {
        if let Some(handler) = self.udt(type_name) {
            handler.encode(&type_name.to_string(), value, out)?;
            return Ok(value.clone());
        }

        if let TypeName::Array { element, .. } = type_name {
            let count = type_name.element_count().unwrap_or(0);
            let TagValue::Array(items) = value else {
                return Err(CodecError::TypeMismatch {
                    expected: type_name.to_string(),
                    actual: value.kind().to_string(),
                });
            };
            if items.len() != count {
                return Err(CodecError::TypeMismatch {
                    expected: format!("{count} elements"),
                    actual: format!("{} elements", items.len()),
                });
            }
            let coerced = items
                .iter()
                .map(|item| self.encode_into(element, bit_size, item, out))
                .collect::<CodecResult<Vec<_>>>()?;
            return Ok(TagValue::Array(coerced));
        }

        if let Some(primitive) = type_name.primitive() {
            let coerced = value.coerce_to(primitive)?;
            write_primitive(&coerced, out)?;
            return Ok(coerced);
        }

        if type_name.is_enum_convention() && bit_size == 16 {
            let coerced = value.coerce_to(PrimitiveType::Int)?;
            write_primitive(&coerced, out)?;
            return Ok(coerced);
        }

        if type_name.is_string_like() {
            let capacity = match (bit_size, type_name) {
                (size, _) if size > 0 => byte_len(size),
                (_, TypeName::String(len)) => {
                    byte_len(string_bit_size(len.unwrap_or(DEFAULT_STRING_LENGTH)))
                }
                _ => byte_len(string_bit_size(DEFAULT_STRING_LENGTH)),
            };
            encode_string(value, capacity, out)?;
            return Ok(value.clone());
        }

        if let TypeName::Named(_) = type_name {
            if let Some(raw) = value.as_bytes() {
                let capacity = byte_len(bit_size);
                if bit_size > 0 && raw.len() > capacity {
                    return Err(CodecError::ValueTooLarge {
                        capacity,
                        actual: raw.len(),
                    });
                }
                out.extend_from_slice(raw);
                out.resize(out.len() + capacity.saturating_sub(raw.len()), 0);
                return Ok(value.clone());
            }
        }

        let fallback = match bit_size {
            1 | 8 => PrimitiveType::Usint,
            16 => PrimitiveType::Uint,
            32 => PrimitiveType::Udint,
            64 => PrimitiveType::Ulint,
            _ => return Err(CodecError::UnsupportedType(type_name.to_string())),
        };
        let coerced = value.coerce_to(fallback)?;
        write_primitive(&coerced, out)?;
        Ok(coerced)
    }
}

fn remaining(reader: &Cursor<&[u8]>) -> usize {
    let consumed = usize::try_from(reader.position()).unwrap_or(usize::MAX);
    reader.get_ref().len().saturating_sub(consumed)
}

fn read_exact(reader: &mut Cursor<&[u8]>, len: usize) -> CodecResult<Vec<u8>> {
    let available = remaining(reader);
    if len > available {
        return Err(CodecError::Truncated(format!(
            "need {len} bytes, {available} left"
        )));
    }
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw)?;
    Ok(raw)
}

fn decode_primitive(primitive: PrimitiveType, reader: &mut Cursor<&[u8]>) -> CodecResult<TagValue> {
    use PrimitiveType as P;

    Ok(match primitive {
        P::Bool => TagValue::Bool(reader.read_u8()? != 0),
        P::Sint => TagValue::I8(reader.read_i8()?),
        P::Byte | P::Usint => TagValue::U8(reader.read_u8()?),
        P::Int => TagValue::I16(reader.read_i16::<LittleEndian>()?),
        P::Word | P::Uint => TagValue::U16(reader.read_u16::<LittleEndian>()?),
        P::Dint => TagValue::I32(reader.read_i32::<LittleEndian>()?),
        P::Dword | P::Udint | P::Time | P::TimeOfDay | P::Date | P::DateAndTime => {
            TagValue::U32(reader.read_u32::<LittleEndian>()?)
        }
        P::Lint => TagValue::I64(reader.read_i64::<LittleEndian>()?),
        P::Lword | P::Ulint | P::Ltime => TagValue::U64(reader.read_u64::<LittleEndian>()?),
        P::Real => TagValue::F32(reader.read_f32::<LittleEndian>()?),
        P::Lreal => TagValue::F64(reader.read_f64::<LittleEndian>()?),
    })
}

fn write_primitive(value: &TagValue, out: &mut Vec<u8>) -> CodecResult<()> {
    match value {
        TagValue::Bool(v) => out.write_u8(u8::from(*v))?,
        TagValue::I8(v) => out.write_i8(*v)?,
        TagValue::U8(v) => out.write_u8(*v)?,
        TagValue::I16(v) => out.write_i16::<LittleEndian>(*v)?,
        TagValue::U16(v) => out.write_u16::<LittleEndian>(*v)?,
        TagValue::I32(v) => out.write_i32::<LittleEndian>(*v)?,
        TagValue::U32(v) => out.write_u32::<LittleEndian>(*v)?,
        TagValue::I64(v) => out.write_i64::<LittleEndian>(*v)?,
        TagValue::U64(v) => out.write_u64::<LittleEndian>(*v)?,
        TagValue::F32(v) => out.write_f32::<LittleEndian>(*v)?,
        TagValue::F64(v) => out.write_f64::<LittleEndian>(*v)?,
        other => return Err(CodecError::UnsupportedType(other.kind().to_string())),
    }
    Ok(())
}

fn encode_string(value: &TagValue, capacity: usize, out: &mut Vec<u8>) -> CodecResult<()> {
    let text = value.as_str().ok_or_else(|| CodecError::TypeMismatch {
        expected: "STRING".to_string(),
        actual: value.kind().to_string(),
    })?;
    let latin1 = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| CodecError::TypeMismatch {
            expected: "Latin-1 STRING".to_string(),
            actual: "non Latin-1 text".to_string(),
        })?;
    // Room for the terminator is required
    if latin1.len() >= capacity {
        return Err(CodecError::ValueTooLarge {
            capacity,
            actual: latin1.len() + 1,
        });
    }
    out.extend_from_slice(&latin1);
    out.resize(out.len() + capacity - latin1.len(), 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(s: &str) -> TypeName {
        TypeName::parse(s).unwrap()
    }

    #[test]
    fn test_primitive_roundtrip() {
        let codec = ValueCodec::new();
        let cases = [
            ("BOOL", TagValue::Bool(true)),
            ("SINT", TagValue::I8(-7)),
            ("BYTE", TagValue::U8(0xAB)),
            ("INT", TagValue::I16(-1234)),
            ("WORD", TagValue::U16(0xBEEF)),
            ("DINT", TagValue::I32(-100_000)),
            ("UDINT", TagValue::U32(4_000_000_000)),
            ("LINT", TagValue::I64(i64::MIN)),
            ("ULINT", TagValue::U64(u64::MAX)),
            ("REAL", TagValue::F32(3.25)),
            ("LREAL", TagValue::F64(-0.125)),
            ("TIME", TagValue::U32(1500)),
        ];
        for (name, value) in cases {
            let t = ty(name);
            let bits = t.primitive().unwrap().bit_size();
            let encoded = codec.encode(&t, bits, &value).unwrap();
            assert_eq!(encoded.bytes.len(), byte_len(bits), "{name}");
            assert_eq!(codec.decode(&t, bits, &encoded.bytes).unwrap(), Some(value), "{name}");
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let codec = ValueCodec::new();
        let encoded = codec
            .encode(&ty("DINT"), 32, &TagValue::I32(0x0102_0304))
            .unwrap();
        assert_eq!(encoded.bytes, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_encode_coerces() {
        let codec = ValueCodec::new();
        let encoded = codec.encode(&ty("INT"), 16, &TagValue::I64(42)).unwrap();
        assert_eq!(encoded.value, TagValue::I16(42));
        assert!(codec.encode(&ty("INT"), 16, &TagValue::I64(70_000)).is_err());
    }

    #[test]
    fn test_string_fixed_length() {
        let codec = ValueCodec::new();
        let t = ty("STRING(5)");
        let encoded = codec.encode(&t, 48, &TagValue::from("abc")).unwrap();
        assert_eq!(encoded.bytes, b"abc\0\0\0".to_vec());
        assert_eq!(
            codec.decode(&t, 48, &encoded.bytes).unwrap(),
            Some(TagValue::from("abc"))
        );
    }

    #[test]
    fn test_string_too_large() {
        let codec = ValueCodec::new();
        let err = codec
            .encode(&ty("STRING(3)"), 32, &TagValue::from("abcd"))
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::ValueTooLarge {
                capacity: 4,
                actual: 5
            }
        );
        // Exactly N characters still fits
        assert!(codec.encode(&ty("STRING(3)"), 32, &TagValue::from("abc")).is_ok());
    }

    #[test]
    fn test_string_latin1() {
        let codec = ValueCodec::new();
        let encoded = codec.encode(&ty("STRING(4)"), 40, &TagValue::from("äö")).unwrap();
        assert_eq!(&encoded.bytes[..2], &[0xE4, 0xF6]);
        assert!(codec.encode(&ty("STRING(4)"), 40, &TagValue::from("€")).is_err());
    }

    #[test]
    fn test_array_roundtrip() {
        let codec = ValueCodec::new();
        let t = ty("ARRAY [1..3] OF INT");
        let value = TagValue::Array(vec![1i16.into(), (-2i16).into(), 300i16.into()]);
        let encoded = codec.encode(&t, 48, &value).unwrap();
        assert_eq!(encoded.bytes.len(), 6);
        assert_eq!(codec.decode(&t, 48, &encoded.bytes).unwrap(), Some(value));
    }

    #[test]
    fn test_array_of_strings_reuses_array_size() {
        // Each element is read with the whole array's size, so the data runs out
        let codec = ValueCodec::new();
        let t = ty("ARRAY [0..1] OF STRING(3)");
        let data = b"ab\0\0cd\0\0".to_vec();
        assert!(matches!(
            codec.decode(&t, 64, &data),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_enum_convention() {
        let codec = ValueCodec::new();
        let t = ty("E_Mode");
        assert_eq!(
            codec.decode(&t, 16, &[0xFE, 0xFF]).unwrap(),
            Some(TagValue::I16(-2))
        );
        // Other widths fall through to the unsigned fallback
        assert_eq!(
            codec.decode(&t, 32, &[1, 0, 0, 0]).unwrap(),
            Some(TagValue::U32(1))
        );
    }

    #[test]
    fn test_width_fallback_and_unreadable() {
        let codec = ValueCodec::new();
        let t = ty("T_Alias");
        assert_eq!(codec.decode(&t, 8, &[9]).unwrap(), Some(TagValue::U8(9)));
        assert_eq!(codec.decode(&t, 1, &[1]).unwrap(), Some(TagValue::U8(1)));
        assert_eq!(codec.decode(&t, 24, &[1, 2, 3]).unwrap(), None);
        assert_eq!(codec.decode(&t, 0, &[]).unwrap(), None);
    }

    #[test]
    fn test_oversized_declarations_are_truncated() {
        let codec = ValueCodec::new();
        assert!(matches!(
            codec.decode(&ty("ARRAY [0..99999999999] OF INT"), 16, &[1, 0, 2, 0]),
            Err(CodecError::Truncated(_))
        ));
        assert!(matches!(
            codec.decode(&ty("STRING(4000000000000)"), i64::MAX, b"abc\0"),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_truncated() {
        let codec = ValueCodec::new();
        assert!(matches!(
            codec.decode(&ty("DINT"), 32, &[1, 2]),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn test_udt_registry() {
        let codec = ValueCodec::new();
        codec.register_udt("st_order", Arc::new(OpaqueBlobCodec));
        assert!(codec.has_udt("ST_Order"));

        let t = ty("ST_Order");
        let decoded = codec.decode(&t, 32, &[1, 2, 3, 4]).unwrap().unwrap();
        assert_eq!(
            decoded,
            TagValue::Blob {
                type_name: "ST_Order".into(),
                data: vec![1, 2, 3, 4]
            }
        );
        let encoded = codec.encode(&t, 32, &decoded).unwrap();
        assert_eq!(encoded.bytes, vec![1, 2, 3, 4]);

        assert!(codec.unregister_udt("ST_ORDER"));
        assert!(!codec.has_udt("ST_Order"));
    }

    #[test]
    fn test_raw_bytes_for_named_type() {
        let codec = ValueCodec::new();
        let t = ty("ST_Unregistered");
        let encoded = codec
            .encode(&t, 48, &TagValue::Bytes(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(encoded.bytes, vec![1, 2, 3, 0, 0, 0]);
        assert!(matches!(
            codec.encode(&t, 16, &TagValue::Bytes(vec![1, 2, 3])),
            Err(CodecError::ValueTooLarge { .. })
        ));
    }
}
