//! IEC 61131-3 type names.
//!
//! Symbol tables describe every variable with a type string such as
//! `DINT`, `STRING(40)`, `ARRAY [0..9] OF REAL` or a UDT name. This module
//! parses those strings with a pest grammar into [`TypeName`].

use crate::error::{CodecError, CodecResult};
use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Parser)]
#[grammar = "type_name.pest"]
struct TypeNameParser;

/// Character count of a `STRING` declared without a length.
pub const DEFAULT_STRING_LENGTH: usize = 80;

/// Elementary types with a fixed wire width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    /// BOOL - one byte, non-zero is true.
    Bool,
    /// BYTE - 8 bits.
    Byte,
    /// WORD - 16 bits.
    Word,
    /// DWORD - 32 bits.
    Dword,
    /// LWORD - 64 bits.
    Lword,
    /// SINT - signed 8-bit integer.
    Sint,
    /// USINT - unsigned 8-bit integer.
    Usint,
    /// INT - signed 16-bit integer.
    Int,
    /// UINT - unsigned 16-bit integer.
    Uint,
    /// DINT - signed 32-bit integer.
    Dint,
    /// UDINT - unsigned 32-bit integer.
    Udint,
    /// LINT - signed 64-bit integer.
    Lint,
    /// ULINT - unsigned 64-bit integer.
    Ulint,
    /// REAL - IEEE 754 single precision.
    Real,
    /// LREAL - IEEE 754 double precision.
    Lreal,
    /// TIME - milliseconds, 32 bits.
    Time,
    /// LTIME - nanoseconds, 64 bits.
    Ltime,
    /// TIME_OF_DAY / TOD - milliseconds since midnight.
    TimeOfDay,
    /// DATE - seconds since 1970-01-01.
    Date,
    /// DATE_AND_TIME / DT - seconds since 1970-01-01.
    DateAndTime,
}

impl PrimitiveType {
    /// Look up an elementary type by its (case-insensitive) name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "BOOL" => Self::Bool,
            "BYTE" => Self::Byte,
            "WORD" => Self::Word,
            "DWORD" => Self::Dword,
            "LWORD" => Self::Lword,
            "SINT" => Self::Sint,
            "USINT" => Self::Usint,
            "INT" => Self::Int,
            "UINT" => Self::Uint,
            "DINT" => Self::Dint,
            "UDINT" => Self::Udint,
            "LINT" => Self::Lint,
            "ULINT" => Self::Ulint,
            "REAL" => Self::Real,
            "LREAL" => Self::Lreal,
            "TIME" => Self::Time,
            "LTIME" => Self::Ltime,
            "TIME_OF_DAY" | "TOD" => Self::TimeOfDay,
            "DATE" => Self::Date,
            "DATE_AND_TIME" | "DT" => Self::DateAndTime,
            _ => return None,
        })
    }

    /// Width on the wire, in bits.
    #[must_use]
    pub fn bit_size(self) -> i64 {
        match self {
            Self::Bool | Self::Byte | Self::Sint | Self::Usint => 8,
            Self::Word | Self::Int | Self::Uint => 16,
            Self::Dword
            | Self::Dint
            | Self::Udint
            | Self::Real
            | Self::Time
            | Self::TimeOfDay
            | Self::Date
            | Self::DateAndTime => 32,
            Self::Lword | Self::Lint | Self::Ulint | Self::Lreal | Self::Ltime => 64,
        }
    }

    /// Width on the wire, in bytes.
    #[must_use]
    pub fn byte_size(self) -> usize {
        match self.bit_size() {
            8 => 1,
            16 => 2,
            32 => 4,
            _ => 8,
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "BOOL",
            Self::Byte => "BYTE",
            Self::Word => "WORD",
            Self::Dword => "DWORD",
            Self::Lword => "LWORD",
            Self::Sint => "SINT",
            Self::Usint => "USINT",
            Self::Int => "INT",
            Self::Uint => "UINT",
            Self::Dint => "DINT",
            Self::Udint => "UDINT",
            Self::Lint => "LINT",
            Self::Ulint => "ULINT",
            Self::Real => "REAL",
            Self::Lreal => "LREAL",
            Self::Time => "TIME",
            Self::Ltime => "LTIME",
            Self::TimeOfDay => "TIME_OF_DAY",
            Self::Date => "DATE",
            Self::DateAndTime => "DATE_AND_TIME",
        };
        f.write_str(name)
    }
}

/// A parsed type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeName {
    /// Elementary type.
    Primitive(PrimitiveType),
    /// `STRING` or `STRING(N)`; `None` means the default length.
    String(Option<usize>),
    /// `ARRAY [lower..upper] OF element`.
    Array {
        /// Lower bound.
        lower: i64,
        /// Upper bound.
        upper: i64,
        /// Element type.
        element: Box<TypeName>,
    },
    /// Anything else: UDTs, enums, aliases. Kept verbatim.
    Named(String),
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{p}"),
            Self::String(None) => write!(f, "STRING"),
            Self::String(Some(len)) => write!(f, "STRING({len})"),
            Self::Array {
                lower,
                upper,
                element,
            } => write!(f, "ARRAY [{lower}..{upper}] OF {element}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Helper trait for extracting the next element from a pest iterator with context.
trait PairsExt<'i> {
    /// Get the next pair, returning an error with context if missing.
    fn expect_next(&mut self, input: &str, context: &str) -> CodecResult<Pair<'i, Rule>>;
}

impl<'i> PairsExt<'i> for Pairs<'i, Rule> {
    fn expect_next(&mut self, input: &str, context: &str) -> CodecResult<Pair<'i, Rule>> {
        self.next().ok_or_else(|| CodecError::Grammar {
            input: input.to_string(),
            message: format!("expected {context} but found end of input"),
        })
    }
}

impl TypeName {
    /// Parse a type name.
    ///
    /// Array declarations must match the grammar exactly. Any other string
    /// that does not parse is kept verbatim as [`TypeName::Named`], because
    /// PLC symbol tables contain types this grammar does not model
    /// (`POINTER TO INT`, `REFERENCE TO ...`).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Grammar`] for malformed array declarations.
    pub fn parse(input: &str) -> CodecResult<Self> {
        let trimmed = input.trim();
        match TypeNameParser::parse(Rule::type_name, trimmed) {
            Ok(mut pairs) => {
                let root = pairs.expect_next(trimmed, "type name")?;
                let body = root.into_inner().expect_next(trimmed, "type declaration")?;
                build(body, trimmed)
            }
            Err(e) if looks_like_array(trimmed) => Err(CodecError::Grammar {
                input: trimmed.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Ok(Self::Named(trimmed.to_string())),
        }
    }

    /// Elementary type, if this is one.
    #[must_use]
    pub fn primitive(&self) -> Option<PrimitiveType> {
        match self {
            Self::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    /// True for the `E_*` enumeration naming convention.
    #[must_use]
    pub fn is_enum_convention(&self) -> bool {
        match self {
            Self::Named(name) => name.len() > 2 && has_prefix(name, "E_"),
            _ => false,
        }
    }

    /// True when the name starts with `STRING`, parsed or not.
    #[must_use]
    pub fn is_string_like(&self) -> bool {
        match self {
            Self::String(_) => true,
            Self::Named(name) => has_prefix(name, "STRING"),
            _ => false,
        }
    }

    /// True for array declarations.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array { .. })
    }

    /// Number of array elements, if this is an array.
    #[must_use]
    pub fn element_count(&self) -> Option<usize> {
        match self {
            Self::Array { lower, upper, .. } => upper
                .checked_sub(*lower)
                .and_then(|span| span.checked_add(1))
                .and_then(|count| usize::try_from(count).ok()),
            _ => None,
        }
    }
}

/// Case-insensitive ASCII prefix test that never splits a character.
fn has_prefix(input: &str, prefix: &str) -> bool {
    input
        .as_bytes()
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix.as_bytes()))
}

fn looks_like_array(input: &str) -> bool {
    has_prefix(input, "ARRAY")
}

fn build(pair: Pair<Rule>, input: &str) -> CodecResult<TypeName> {
    match pair.as_rule() {
        Rule::array_type => {
            let mut parts = pair.into_inner();
            let lower = parse_bound(&parts.expect_next(input, "array lower bound")?, input)?;
            let upper = parse_bound(&parts.expect_next(input, "array upper bound")?, input)?;
            let element = build(parts.expect_next(input, "array element type")?, input)?;
            Ok(TypeName::Array {
                lower,
                upper,
                element: Box::new(element),
            })
        }
        Rule::string_type => {
            let length = pair
                .into_inner()
                .find(|p| p.as_rule() == Rule::length)
                .map(|p| {
                    p.as_str().parse::<usize>().map_err(|e| CodecError::Grammar {
                        input: input.to_string(),
                        message: format!("string length: {e}"),
                    })
                })
                .transpose()?;
            Ok(TypeName::String(length))
        }
        Rule::identifier => {
            let name = pair.as_str();
            Ok(PrimitiveType::from_name(name)
                .map_or_else(|| TypeName::Named(name.to_string()), TypeName::Primitive))
        }
        other => Err(CodecError::Grammar {
            input: input.to_string(),
            message: format!("unexpected rule {other:?}"),
        }),
    }
}

fn parse_bound(pair: &Pair<Rule>, input: &str) -> CodecResult<i64> {
    pair.as_str().parse::<i64>().map_err(|e| CodecError::Grammar {
        input: input.to_string(),
        message: format!("array bound '{}': {e}", pair.as_str()),
    })
}
