//! Decoded tag values.

use crate::error::{CodecError, CodecResult};
use crate::types::PrimitiveType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Any value the codec can produce or consume.
///
/// `PartialEq` follows IEEE semantics for floats. Change detection uses
/// [`TagValue::same_value`] instead, which compares floats by bit pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum TagValue {
    /// BOOL.
    Bool(bool),
    /// SINT.
    I8(i8),
    /// INT, or an `E_*` enum.
    I16(i16),
    /// DINT.
    I32(i32),
    /// LINT.
    I64(i64),
    /// USINT, BYTE.
    U8(u8),
    /// UINT, WORD.
    U16(u16),
    /// UDINT, DWORD, TIME, TOD, DATE, DT.
    U32(u32),
    /// ULINT, LWORD, LTIME.
    U64(u64),
    /// REAL.
    F32(f32),
    /// LREAL.
    F64(f64),
    /// STRING.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// ARRAY elements in index order.
    Array(Vec<TagValue>),
    /// UDT instance as produced by a registered handler.
    Blob {
        /// UDT name.
        type_name: String,
        /// Raw record bytes.
        data: Vec<u8>,
    },
}

impl TagValue {
    /// Short name of the variant, used in diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Blob { .. } => "blob",
        }
    }

    /// Equality used for change detection.
    ///
    /// Like `==`, except that floats compare by bit pattern: a stored `NaN`
    /// equals the same `NaN`, and `0.0` differs from `-0.0`.
    #[must_use]
    pub fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::F32(a), Self::F32(b)) => a.to_bits() == b.to_bits(),
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_value(y))
            }
            (a, b) => a == b,
        }
    }

    /// [`TagValue::same_value`] lifted to optional values.
    #[must_use]
    pub fn same_option(a: Option<&Self>, b: Option<&Self>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => a.same_value(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Integer view of integral and boolean values.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    /// Floating point view of numeric values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            other => other.as_i128().map(|v| v as f64),
        }
    }

    /// Raw bytes of `Bytes` and `Blob` values.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) | Self::Blob { data: b, .. } => Some(b),
            _ => None,
        }
    }

    /// String slice of a `String` value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Self::Bool(v) => i128::from(*v),
            Self::I8(v) => i128::from(*v),
            Self::I16(v) => i128::from(*v),
            Self::I32(v) => i128::from(*v),
            Self::I64(v) => i128::from(*v),
            Self::U8(v) => i128::from(*v),
            Self::U16(v) => i128::from(*v),
            Self::U32(v) => i128::from(*v),
            Self::U64(v) => i128::from(*v),
            _ => return None,
        })
    }

    /// Convert to the variant that represents `target` on the wire.
    ///
    /// Integers are range checked, floats are rounded half-to-even before
    /// the range check, and any non-zero number converts to `true`.
    ///
    /// # Errors
    ///
    /// [`CodecError::OutOfRange`] when the value does not fit and
    /// [`CodecError::TypeMismatch`] for non-numeric values.
    pub fn coerce_to(&self, target: PrimitiveType) -> CodecResult<TagValue> {
        use PrimitiveType as P;

        if target == P::Bool {
            return match self {
                Self::Bool(b) => Ok(Self::Bool(*b)),
                other => other
                    .as_f64()
                    .map(|v| Self::Bool(v != 0.0))
                    .ok_or_else(|| self.mismatch(target)),
            };
        }

        match target {
            P::Real => return self.to_f32().map(Self::F32),
            P::Lreal => {
                return self
                    .as_f64()
                    .map(Self::F64)
                    .ok_or_else(|| self.mismatch(target))
            }
            _ => {}
        }

        let wide = self.integral(target)?;
        let out_of_range = || CodecError::OutOfRange {
            value: self.to_string(),
            target: target.to_string(),
        };
        Ok(match target {
            P::Sint => Self::I8(i8::try_from(wide).map_err(|_| out_of_range())?),
            P::Int => Self::I16(i16::try_from(wide).map_err(|_| out_of_range())?),
            P::Dint => Self::I32(i32::try_from(wide).map_err(|_| out_of_range())?),
            P::Lint => Self::I64(i64::try_from(wide).map_err(|_| out_of_range())?),
            P::Byte | P::Usint => Self::U8(u8::try_from(wide).map_err(|_| out_of_range())?),
            P::Word | P::Uint => Self::U16(u16::try_from(wide).map_err(|_| out_of_range())?),
            P::Dword | P::Udint | P::Time | P::TimeOfDay | P::Date | P::DateAndTime => {
                Self::U32(u32::try_from(wide).map_err(|_| out_of_range())?)
            }
            P::Lword | P::Ulint | P::Ltime => {
                Self::U64(u64::try_from(wide).map_err(|_| out_of_range())?)
            }
            P::Bool | P::Real | P::Lreal => return Err(self.mismatch(target)),
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn integral(&self, target: PrimitiveType) -> CodecResult<i128> {
        if let Some(v) = self.as_i128() {
            return Ok(v);
        }
        let float = match self {
            Self::F32(v) => f64::from(*v),
            Self::F64(v) => *v,
            _ => return Err(self.mismatch(target)),
        };
        let rounded = float.round_ties_even();
        if !rounded.is_finite() {
            return Err(CodecError::OutOfRange {
                value: self.to_string(),
                target: target.to_string(),
            });
        }
        // Saturating cast; the per-target range check follows
        Ok(rounded as i128)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn to_f32(&self) -> CodecResult<f32> {
        match self {
            Self::F32(v) => Ok(*v),
            Self::F64(v) => {
                if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                    Err(CodecError::OutOfRange {
                        value: self.to_string(),
                        target: PrimitiveType::Real.to_string(),
                    })
                } else {
                    Ok(*v as f32)
                }
            }
            other => other
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| self.mismatch(PrimitiveType::Real)),
        }
    }

    fn mismatch(&self, target: PrimitiveType) -> CodecError {
        CodecError::TypeMismatch {
            expected: target.to_string(),
            actual: self.kind().to_string(),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "'{s}'"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Blob { type_name, data } => write!(f, "<{type_name}: {} bytes>", data.len()),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for TagValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from!(
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Bytes,
    Vec<TagValue> => Array,
);

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening() {
        assert_eq!(
            TagValue::I16(-5).coerce_to(PrimitiveType::Lint).unwrap(),
            TagValue::I64(-5)
        );
        assert_eq!(
            TagValue::U8(200).coerce_to(PrimitiveType::Udint).unwrap(),
            TagValue::U32(200)
        );
    }

    #[test]
    fn test_narrowing_checked() {
        assert_eq!(
            TagValue::I32(100).coerce_to(PrimitiveType::Sint).unwrap(),
            TagValue::I8(100)
        );
        assert!(matches!(
            TagValue::I32(300).coerce_to(PrimitiveType::Usint),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            TagValue::I32(-1).coerce_to(PrimitiveType::Uint),
            Err(CodecError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_float_to_int_rounds_half_even() {
        assert_eq!(
            TagValue::F64(2.5).coerce_to(PrimitiveType::Int).unwrap(),
            TagValue::I16(2)
        );
        assert_eq!(
            TagValue::F32(3.5).coerce_to(PrimitiveType::Int).unwrap(),
            TagValue::I16(4)
        );
        assert!(TagValue::F64(f64::NAN).coerce_to(PrimitiveType::Dint).is_err());
    }

    #[test]
    fn test_lreal_to_real_overflow() {
        assert!(matches!(
            TagValue::F64(1e300).coerce_to(PrimitiveType::Real),
            Err(CodecError::OutOfRange { .. })
        ));
        assert_eq!(
            TagValue::F64(1.5).coerce_to(PrimitiveType::Real).unwrap(),
            TagValue::F32(1.5)
        );
    }

    #[test]
    fn test_bool_coercion() {
        assert_eq!(
            TagValue::I32(7).coerce_to(PrimitiveType::Bool).unwrap(),
            TagValue::Bool(true)
        );
        assert_eq!(
            TagValue::Bool(true).coerce_to(PrimitiveType::Int).unwrap(),
            TagValue::I16(1)
        );
    }

    #[test]
    fn test_string_into_number_is_mismatch() {
        let err = TagValue::from("12").coerce_to(PrimitiveType::Int).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn test_same_value_compares_float_bits() {
        assert_ne!(TagValue::F32(f32::NAN), TagValue::F32(f32::NAN));
        assert!(TagValue::F32(f32::NAN).same_value(&TagValue::F32(f32::NAN)));
        assert!(TagValue::F64(f64::NAN).same_value(&TagValue::F64(f64::NAN)));
        assert!(!TagValue::F64(0.0).same_value(&TagValue::F64(-0.0)));
        assert!(!TagValue::F32(1.0).same_value(&TagValue::F64(1.0)));

        let nans = TagValue::Array(vec![TagValue::F32(1.0), TagValue::F32(f32::NAN)]);
        assert!(nans.same_value(&nans.clone()));
        assert!(!nans.same_value(&TagValue::Array(vec![TagValue::F32(1.0)])));

        assert!(TagValue::same_option(None, None));
        assert!(!TagValue::same_option(Some(&TagValue::I16(0)), None));
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&TagValue::I16(-1)).unwrap();
        assert_eq!(json, r#"{"type":"I16","value":-1}"#);
        let back: TagValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TagValue::I16(-1));
    }
}
