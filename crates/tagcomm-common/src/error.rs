use thiserror::Error;

/// ADS return code: target port not found.
pub const ADSERR_TARGET_PORT_NOT_FOUND: u32 = 0x6;
/// ADS return code: port not connected.
pub const ADSERR_PORT_NOT_CONNECTED: u32 = 0x18;
/// ADS return code: generic device error.
pub const ADSERR_DEVICE_ERROR: u32 = 0x700;
/// ADS return code: index group not valid.
pub const ADSERR_DEVICE_INVALIDGRP: u32 = 0x702;
/// ADS return code: index offset not valid.
pub const ADSERR_DEVICE_INVALIDOFFSET: u32 = 0x703;
/// ADS return code: parameter size not correct.
pub const ADSERR_DEVICE_INVALIDSIZE: u32 = 0x705;
/// ADS return code: symbol not found.
pub const ADSERR_DEVICE_SYMBOLNOTFOUND: u32 = 0x710;
/// ADS return code: symbol version invalid (PLC program was re-downloaded).
pub const ADSERR_DEVICE_SYMBOLVERSIONINVALID: u32 = 0x711;
/// ADS return code: notification handle is invalid.
pub const ADSERR_DEVICE_NOTIFYHNDINVALID: u32 = 0x714;
/// ADS return code: request timed out.
pub const ADSERR_DEVICE_TIMEOUT: u32 = 0x745;

/// Failures reported by the byte-stream transport.
///
/// Each variant maps onto an ADS return code so logs stay comparable with
/// vendor tooling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has no open connection.
    #[error("port not connected")]
    NotConnected,

    /// The target AMS port does not answer.
    #[error("target port {port} not found")]
    PortUnavailable {
        /// AMS port that was addressed.
        port: u16,
    },

    /// The index group is no longer valid on the device.
    #[error("invalid index group 0x{group:X}")]
    InvalidIndexGroup {
        /// Rejected index group.
        group: u32,
    },

    /// The index offset is no longer valid on the device.
    #[error("invalid index offset 0x{offset:X} in group 0x{group:X}")]
    InvalidIndexOffset {
        /// Index group of the request.
        group: u32,
        /// Rejected index offset.
        offset: u32,
    },

    /// No symbol with the given path exists.
    #[error("symbol not found: {path}")]
    SymbolNotFound {
        /// Symbolic path that failed to resolve.
        path: String,
    },

    /// The symbol table changed since addresses were resolved.
    #[error("symbol version changed")]
    SymbolVersionChanged,

    /// The request size does not match the symbol size.
    #[error("invalid size: expected {expected} bytes, got {actual}")]
    InvalidSize {
        /// Size the device expects.
        expected: usize,
        /// Size that was sent or requested.
        actual: usize,
    },

    /// The notification handle is unknown to the device.
    #[error("invalid notification handle {handle}")]
    InvalidNotificationHandle {
        /// Rejected handle.
        handle: u32,
    },

    /// The device did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// Any other ADS device error.
    #[error("device error 0x{code:X}")]
    Device {
        /// Raw ADS return code.
        code: u32,
    },
}

impl TransportError {
    /// ADS return code for this error.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::NotConnected => ADSERR_PORT_NOT_CONNECTED,
            Self::PortUnavailable { .. } => ADSERR_TARGET_PORT_NOT_FOUND,
            Self::InvalidIndexGroup { .. } => ADSERR_DEVICE_INVALIDGRP,
            Self::InvalidIndexOffset { .. } => ADSERR_DEVICE_INVALIDOFFSET,
            Self::SymbolNotFound { .. } => ADSERR_DEVICE_SYMBOLNOTFOUND,
            Self::SymbolVersionChanged => ADSERR_DEVICE_SYMBOLVERSIONINVALID,
            Self::InvalidSize { .. } => ADSERR_DEVICE_INVALIDSIZE,
            Self::InvalidNotificationHandle { .. } => ADSERR_DEVICE_NOTIFYHNDINVALID,
            Self::Timeout => ADSERR_DEVICE_TIMEOUT,
            Self::Device { code } => *code,
        }
    }

    /// Errors meaning cached hardware addresses are stale.
    ///
    /// These are always recoverable: clear the address cache and re-resolve.
    #[must_use]
    pub fn is_address_invalidation(&self) -> bool {
        matches!(
            self,
            Self::InvalidIndexGroup { .. }
                | Self::InvalidIndexOffset { .. }
                | Self::SymbolVersionChanged
        )
    }

    /// Errors meaning the port itself is gone and a reconnect is needed.
    #[must_use]
    pub fn is_port_error(&self) -> bool {
        matches!(self, Self::NotConnected | Self::PortUnavailable { .. })
    }
}

/// Error taxonomy for the Tag communication subsystem.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TagError {
    /// Transport-level failure while accessing a tag.
    #[error("communication failure on {tag}: {source}")]
    CommunicationFailure {
        /// Path of the failing tag.
        tag: String,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },

    /// Malformed type grammar or array bounds.
    #[error("invalid tag definition for {tag}: {reason}")]
    InvalidTagDefinition {
        /// Path of the offending tag.
        tag: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Value does not fit into the tag's declared capacity.
    #[error("value too large for {tag}: {reason}")]
    ValueTooLarge {
        /// Path of the target tag.
        tag: String,
        /// Capacity or range that was exceeded.
        reason: String,
    },

    /// Value cannot be converted to the tag's data type.
    #[error("type mismatch for {tag}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Path of the target tag.
        tag: String,
        /// Declared data type.
        expected: String,
        /// Kind of the supplied value.
        actual: String,
    },

    /// Notification listener is out of subscriptions.
    #[error("subscription limit of {limit} exceeded")]
    SubscriptionLimitExceeded {
        /// Configured ceiling.
        limit: usize,
    },

    /// DataChannel saw an unexpected handshake value.
    #[error("protocol violation on channel {channel}: unexpected handshake value {value}")]
    ProtocolViolation {
        /// Payload tag path of the channel.
        channel: String,
        /// Handshake value that was read.
        value: i16,
    },

    /// The component is not connected to the PLC.
    #[error("not connected")]
    NotConnected,

    /// A tag handle does not refer to a tag in the arena.
    #[error("unknown tag id {0}")]
    UnknownTag(u32),

    /// An operation exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration or setup error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl TagError {
    /// Convenience constructor for [`TagError::CommunicationFailure`].
    pub fn communication(tag: impl Into<String>, source: TransportError) -> Self {
        Self::CommunicationFailure {
            tag: tag.into(),
            source,
        }
    }

    /// Convenience constructor for [`TagError::InvalidTagDefinition`].
    pub fn invalid_definition(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTagDefinition {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    /// Returns the transport error behind a communication failure, if any.
    #[must_use]
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::CommunicationFailure { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convenience type alias for tag operations.
pub type TagResult<T> = Result<T, TagError>;

/// Convenience type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
