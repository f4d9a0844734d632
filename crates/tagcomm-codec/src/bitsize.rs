//! Bit-size resolution from type names.

use crate::error::{CodecError, CodecResult};
use crate::types::{TypeName, DEFAULT_STRING_LENGTH};
use crate::value::TagValue;

/// Bit size reported when an array element type has no known width.
pub const SIZE_UNAVAILABLE: i64 = -1;

/// Bit size of a STRING holding `chars` characters plus the terminator.
#[must_use]
pub fn string_bit_size(chars: usize) -> i64 {
    i64::try_from(chars.saturating_add(1)).unwrap_or(i64::MAX / 8) * 8
}

/// Compute the wire size of `data_type` in bits.
///
/// * Elementary types return their fixed width.
/// * `STRING` is `(80 + 1) * 8`, `STRING(N)` is `(N + 1) * 8`.
/// * `ARRAY [lo..hi] OF T` is `(hi - lo + 1) * size(T)`, or
///   [`SIZE_UNAVAILABLE`] when `T` has no known size.
/// * Other names return 0 (unresolved), unless `current` already holds a
///   byte blob, in which case its length decides.
///
/// # Errors
///
/// Returns [`CodecError::InvalidArrayBounds`] when `hi <= lo`.
pub fn resolve_bit_size(data_type: &TypeName, current: Option<&TagValue>) -> CodecResult<i64> {
    match data_type {
        TypeName::Primitive(p) => Ok(p.bit_size()),
        TypeName::String(len) => Ok(string_bit_size(len.unwrap_or(DEFAULT_STRING_LENGTH))),
        TypeName::Array {
            lower,
            upper,
            element,
        } => {
            if upper <= lower {
                return Err(CodecError::InvalidArrayBounds {
                    lower: *lower,
                    upper: *upper,
                });
            }
            let element_size = resolve_bit_size(element, None)?;
            if element_size <= 0 {
                return Ok(SIZE_UNAVAILABLE);
            }
            let count = upper
                .checked_sub(*lower)
                .and_then(|span| span.checked_add(1))
                .ok_or(CodecError::InvalidArrayBounds {
                    lower: *lower,
                    upper: *upper,
                })?;
            Ok(count.saturating_mul(element_size))
        }
        TypeName::Named(_) => Ok(current
            .and_then(TagValue::as_bytes)
            .map_or(0, |b| i64::try_from(b.len()).unwrap_or(0) * 8)),
    }
}

/// Parse `data_type` and resolve its size in one step.
///
/// # Errors
///
/// Grammar errors from [`TypeName::parse`] and bound errors from
/// [`resolve_bit_size`].
pub fn resolve_bit_size_str(data_type: &str, current: Option<&TagValue>) -> CodecResult<i64> {
    resolve_bit_size(&TypeName::parse(data_type)?, current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(ty: &str) -> i64 {
        resolve_bit_size_str(ty, None).unwrap()
    }

    #[test]
    fn test_primitive_table() {
        let table = [
            ("BOOL", 8),
            ("BYTE", 8),
            ("SINT", 8),
            ("USINT", 8),
            ("WORD", 16),
            ("INT", 16),
            ("UINT", 16),
            ("DWORD", 32),
            ("DINT", 32),
            ("UDINT", 32),
            ("REAL", 32),
            ("TIME", 32),
            ("TOD", 32),
            ("DATE", 32),
            ("DT", 32),
            ("LWORD", 64),
            ("LINT", 64),
            ("ULINT", 64),
            ("LREAL", 64),
            ("LTIME", 64),
        ];
        for (ty, bits) in table {
            assert_eq!(size(ty), bits, "{ty}");
        }
    }

    #[test]
    fn test_strings() {
        assert_eq!(size("STRING"), 648);
        assert_eq!(size("STRING(10)"), 88);
        assert_eq!(size("STRING(0)"), 8);
    }

    #[test]
    fn test_arrays() {
        assert_eq!(size("ARRAY [0..9] OF INT"), 160);
        assert_eq!(size("ARRAY [1..3] OF STRING(4)"), 120);
        assert_eq!(size("ARRAY [0..1] OF ARRAY [0..3] OF BYTE"), 64);
        assert_eq!(size("ARRAY [-5..5] OF LREAL"), 11 * 64);
    }

    #[test]
    fn test_array_bounds_rejected() {
        for ty in ["ARRAY [3..3] OF INT", "ARRAY [5..1] OF INT"] {
            assert!(matches!(
                resolve_bit_size_str(ty, None),
                Err(CodecError::InvalidArrayBounds { .. })
            ));
        }
    }

    #[test]
    fn test_extreme_bounds_rejected() {
        let declared = format!("ARRAY [{}..{}] OF BYTE", i64::MIN, i64::MAX);
        assert_eq!(
            resolve_bit_size_str(&declared, None),
            Err(CodecError::InvalidArrayBounds {
                lower: i64::MIN,
                upper: i64::MAX,
            })
        );
        assert_eq!(size("ARRAY [0..9223372036854775806] OF LINT"), i64::MAX);
    }

    #[test]
    fn test_unknown_element_unavailable() {
        assert_eq!(size("ARRAY [0..3] OF ST_Unknown"), SIZE_UNAVAILABLE);
    }

    #[test]
    fn test_unknown_type_unresolved() {
        assert_eq!(size("ST_Order"), 0);
        let blob = TagValue::Bytes(vec![0; 6]);
        assert_eq!(resolve_bit_size_str("ST_Order", Some(&blob)).unwrap(), 48);
    }
}
