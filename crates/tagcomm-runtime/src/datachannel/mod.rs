//! Handshake-based reliable message channels.
//!
//! A channel is a struct tag (the payload) whose last member is an `INT`
//! named `DataState`. The sender writes the payload with `DataState = 1`,
//! then writes the handshake member; the receiver answers on the same
//! member with one of the [`DataState`] values.
//!
//! [`DataChannelWriter`] drives the host → PLC direction,
//! [`DataChannelListener`] the PLC → host direction.

mod listener;
mod writer;

pub use listener::{DataChannelEvents, DataChannelListener};
pub use writer::{DataChannelWriter, MessageKind, MessageOutcome, WriterEvents};

use crate::access::TagAccess;
use crate::tag::TagId;
use std::sync::Arc;
use tagcomm_codec::{CodecError, CodecResult, OpaqueBlobCodec, PrimitiveType, TypeName};
use tagcomm_common::{DataState, TagError, TagResult};
use tracing::debug;

/// Member name of the handshake field.
pub const DATA_STATE_FIELD: &str = "DataState";

/// Size of the trailing handshake field in bytes.
pub const DATA_STATE_LEN: usize = 2;

/// A record that travels over a DataChannel.
///
/// The encoded form is the raw PLC struct image; its last two bytes are the
/// little-endian `DataState` field.
pub trait ChannelRecord: Sized + Send + Sync + 'static {
    /// Raw struct image, including the trailing state field.
    fn encode(&self) -> Vec<u8>;

    /// Parse a raw struct image.
    ///
    /// # Errors
    ///
    /// Any [`CodecError`] for records that cannot be parsed.
    fn decode(data: &[u8]) -> CodecResult<Self>;
}

/// Record kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord(pub Vec<u8>);

impl ChannelRecord for RawRecord {
    fn encode(&self) -> Vec<u8> {
        self.0.clone()
    }

    fn decode(data: &[u8]) -> CodecResult<Self> {
        if data.len() < DATA_STATE_LEN {
            return Err(CodecError::Truncated(format!(
                "record of {} bytes has no state field",
                data.len()
            )));
        }
        Ok(Self(data.to_vec()))
    }
}

/// Read the trailing state field of a raw record.
#[must_use]
pub fn data_state_of(record: &[u8]) -> Option<i16> {
    let start = record.len().checked_sub(DATA_STATE_LEN)?;
    Some(i16::from_le_bytes([record[start], record[start + 1]]))
}

/// Overwrite the trailing state field of a raw record.
pub fn set_data_state(record: &mut [u8], state: DataState) {
    if let Some(start) = record.len().checked_sub(DATA_STATE_LEN) {
        record[start..].copy_from_slice(&state.value().to_le_bytes());
    }
}

/// Tags making up one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Payload struct tag.
    pub payload: TagId,
    /// Trailing `DataState` member.
    pub handshake: TagId,
    /// Payload type name.
    pub type_name: String,
    /// Payload size in bytes.
    pub byte_len: usize,
    /// Payload path, used in diagnostics.
    pub path: String,
}

/// Check the channel contract on a payload tag and register a raw handler
/// for its type unless one exists.
///
/// # Errors
///
/// [`TagError::InvalidTagDefinition`] when the payload is not a struct, has
/// no trailing `DataState : INT` member, or has no usable size.
pub fn validate_channel(access: &TagAccess, payload: TagId) -> TagResult<ChannelBinding> {
    let arena = access.arena();
    let tag = arena.tag(payload)?;
    let path = tag.path().to_string();

    let TypeName::Named(type_name) = tag.type_name()? else {
        return Err(TagError::invalid_definition(
            &path,
            "channel payload must be a structured type",
        ));
    };

    let handshake = tag.children().last().copied().ok_or_else(|| {
        TagError::invalid_definition(&path, "channel payload has no members")
    })?;
    let member = arena.tag(handshake)?;
    let field = member.name().rsplit('.').next().unwrap_or_default();
    if !field.eq_ignore_ascii_case(DATA_STATE_FIELD) {
        return Err(TagError::invalid_definition(
            &path,
            format!("last member must be {DATA_STATE_FIELD}, found {field}"),
        ));
    }
    if member.type_name()? != TypeName::Primitive(PrimitiveType::Int) {
        return Err(TagError::invalid_definition(
            &path,
            format!("{DATA_STATE_FIELD} must be INT, found {}", member.data_type()),
        ));
    }

    let bit_size = arena.bit_size(payload)?;
    if bit_size <= 0 || bit_size % 8 != 0 {
        return Err(TagError::invalid_definition(
            &path,
            format!("channel payload has no usable size ({bit_size} bits)"),
        ));
    }
    let byte_len = tagcomm_codec::byte_len(bit_size);
    if byte_len < DATA_STATE_LEN {
        return Err(TagError::invalid_definition(&path, "channel payload too small"));
    }

    if !access.codec().has_udt(&type_name) {
        access.codec().register_udt(&type_name, Arc::new(OpaqueBlobCodec));
    }
    debug!(channel = %path, %type_name, byte_len, "Channel validated");

    Ok(ChannelBinding {
        payload,
        handshake,
        type_name,
        byte_len,
        path,
    })
}
