use tagcomm_common::TagError;
use thiserror::Error;

/// Errors produced by type resolution and the binary codec.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Type name does not match the grammar.
    #[error("malformed type name '{input}': {message}")]
    Grammar {
        /// Offending type name.
        input: String,
        /// Parser diagnostic.
        message: String,
    },

    /// Array upper bound does not exceed the lower bound.
    #[error("invalid array bounds [{lower}..{upper}]")]
    InvalidArrayBounds {
        /// Declared lower bound.
        lower: i64,
        /// Declared upper bound.
        upper: i64,
    },

    /// Value needs more bytes than the tag provides.
    #[error("value needs {actual} bytes but capacity is {capacity}")]
    ValueTooLarge {
        /// Declared capacity in bytes.
        capacity: usize,
        /// Bytes the value needs.
        actual: usize,
    },

    /// Numeric value is outside the target type's range.
    #[error("value {value} out of range for {target}")]
    OutOfRange {
        /// Rendered source value.
        value: String,
        /// Target type name.
        target: String,
    },

    /// Value kind cannot be converted to the target type.
    #[error("cannot convert {actual} to {expected}")]
    TypeMismatch {
        /// Target type name.
        expected: String,
        /// Kind of the supplied value.
        actual: String,
    },

    /// No encoding exists for this type.
    #[error("unsupported type {0}")]
    UnsupportedType(String),

    /// Raw data ended early.
    #[error("truncated data: {0}")]
    Truncated(String),

    /// A registered UDT handler failed.
    #[error("UDT handler for {type_name} failed: {message}")]
    Udt {
        /// UDT name.
        type_name: String,
        /// Handler diagnostic.
        message: String,
    },
}

impl CodecError {
    /// Lift this error into the tag error taxonomy, naming the tag.
    #[must_use]
    pub fn for_tag(self, tag: &str) -> TagError {
        match self {
            Self::Grammar { .. } | Self::InvalidArrayBounds { .. } => {
                TagError::invalid_definition(tag, self.to_string())
            }
            Self::ValueTooLarge { .. } | Self::OutOfRange { .. } => TagError::ValueTooLarge {
                tag: tag.to_string(),
                reason: self.to_string(),
            },
            Self::TypeMismatch { expected, actual } => TagError::TypeMismatch {
                tag: tag.to_string(),
                expected,
                actual,
            },
            Self::UnsupportedType(ref ty) => TagError::TypeMismatch {
                tag: tag.to_string(),
                expected: ty.clone(),
                actual: "unsupported".to_string(),
            },
            Self::Truncated(_) | Self::Udt { .. } => {
                TagError::invalid_definition(tag, self.to_string())
            }
        }
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        Self::Truncated(err.to_string())
    }
}

/// Convenience type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
