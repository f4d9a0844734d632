//! IEC 61131-3 type names, bit sizes and binary value codec.
//!
//! This crate provides:
//! - [`types`] - type-name grammar and [`TypeName`]
//! - [`bitsize`] - bit-size resolution from a type name
//! - [`value`] - the [`TagValue`] variant type and numeric coercion
//! - [`codec`] - little-endian encode/decode with a UDT handler registry
//!
//! # Example
//!
//! ```
//! use tagcomm_codec::{resolve_bit_size, TagValue, TypeName, ValueCodec};
//!
//! let ty = TypeName::parse("ARRAY [0..2] OF INT").unwrap();
//! let bits = resolve_bit_size(&ty, None).unwrap();
//! assert_eq!(bits, 48);
//!
//! let codec = ValueCodec::new();
//! let value = TagValue::Array(vec![1i16.into(), 2i16.into(), 3i16.into()]);
//! let encoded = codec.encode(&ty, bits, &value).unwrap();
//! assert_eq!(codec.decode(&ty, bits, &encoded.bytes).unwrap(), Some(value));
//! ```

pub mod bitsize;
pub mod codec;
pub mod error;
pub mod types;
pub mod value;

pub use bitsize::{resolve_bit_size, resolve_bit_size_str, string_bit_size, SIZE_UNAVAILABLE};
pub use codec::{byte_len, Encoded, OpaqueBlobCodec, UdtCodec, ValueCodec};
pub use error::{CodecError, CodecResult};
pub use types::{PrimitiveType, TypeName, DEFAULT_STRING_LENGTH};
pub use value::TagValue;
