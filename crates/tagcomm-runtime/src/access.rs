//! Raw tag I/O with address caching.
//!
//! A tag is read or written through its resolved numeric address. If the
//! PLC cannot resolve the path, the tag is marked unresolvable for the rest
//! of the session and accessed by name: create handle, access by handle,
//! release handle.

use crate::tag::{AddressState, Tag, TagArena, TagId};
use std::sync::Arc;
use tagcomm_codec::{byte_len, TagValue, TypeName, ValueCodec};
use tagcomm_common::{TagError, TagResult, TransportError, TransportResult};
use tagcomm_transport::{AdsTransport, SymbolAddress};
use tracing::{debug, trace, warn};

/// How a tag is reached on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTarget {
    /// Numeric address.
    Address(SymbolAddress),
    /// Name-based access through a temporary handle.
    ByName,
}

/// Type information needed to move one tag over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Parsed data type.
    pub type_name: TypeName,
    /// Size in bits.
    pub bit_size: i64,
}

impl Layout {
    /// Size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        byte_len(self.bit_size)
    }
}

/// Shared plumbing between listeners, the controller and DataChannels.
pub struct TagAccess {
    arena: Arc<TagArena>,
    transport: Arc<dyn AdsTransport>,
    codec: Arc<ValueCodec>,
}

impl std::fmt::Debug for TagAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagAccess")
            .field("port", &self.transport.port())
            .field("tags", &self.arena.len())
            .finish_non_exhaustive()
    }
}

impl TagAccess {
    /// Bundle arena, transport and codec.
    #[must_use]
    pub fn new(arena: Arc<TagArena>, transport: Arc<dyn AdsTransport>, codec: Arc<ValueCodec>) -> Self {
        Self {
            arena,
            transport,
            codec,
        }
    }

    /// Tag arena.
    #[must_use]
    pub fn arena(&self) -> &Arc<TagArena> {
        &self.arena
    }

    /// Transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn AdsTransport> {
        &self.transport
    }

    /// Value codec.
    #[must_use]
    pub fn codec(&self) -> &Arc<ValueCodec> {
        &self.codec
    }

    /// Parsed type and bit size of a tag.
    ///
    /// # Errors
    ///
    /// Definition errors for malformed types.
    pub fn layout(&self, id: TagId) -> TagResult<Layout> {
        let tag = self.arena.tag(id)?;
        Ok(Layout {
            type_name: tag.type_name()?,
            bit_size: self.arena.bit_size(id)?,
        })
    }

    /// Resolve (or recall) how to reach a tag.
    ///
    /// # Errors
    ///
    /// Transport errors other than an unknown symbol; those are remembered
    /// and answered with [`AccessTarget::ByName`].
    pub fn resolve(&self, tag: &Tag) -> TransportResult<AccessTarget> {
        match tag.address() {
            AddressState::Resolved(addr) => Ok(AccessTarget::Address(addr)),
            AddressState::Unresolvable => Ok(AccessTarget::ByName),
            AddressState::Unresolved => match self.transport.resolve_address(tag.path()) {
                Ok(addr) => {
                    trace!(tag = tag.path(), %addr, "Resolved address");
                    tag.set_address(AddressState::Resolved(addr));
                    Ok(AccessTarget::Address(addr))
                }
                Err(TransportError::SymbolNotFound { .. }) => {
                    debug!(tag = tag.path(), "Address unresolvable, using name-based access");
                    tag.set_address(AddressState::Unresolvable);
                    Ok(AccessTarget::ByName)
                }
                Err(e) => Err(e),
            },
        }
    }

    fn with_handle<T>(
        &self,
        tag: &Tag,
        op: impl FnOnce(SymbolAddress) -> TransportResult<T>,
    ) -> TransportResult<T> {
        let handle = self.transport.create_handle(tag.path())?;
        let result = op(SymbolAddress::by_handle(handle));
        if let Err(e) = self.transport.delete_handle(handle) {
            warn!(tag = tag.path(), handle, error = %e, "Failed to release symbol handle");
        }
        result
    }

    /// Read `len` raw bytes of a tag.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn read_raw(&self, tag: &Tag, len: usize) -> TransportResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match self.resolve(tag)? {
            AccessTarget::Address(addr) => self.transport.read(addr, &mut buf)?,
            AccessTarget::ByName => self.with_handle(tag, |addr| self.transport.read(addr, &mut buf))?,
        }
        Ok(buf)
    }

    /// Write raw bytes to a tag.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn write_raw(&self, tag: &Tag, data: &[u8]) -> TransportResult<()> {
        match self.resolve(tag)? {
            AccessTarget::Address(addr) => self.transport.write(addr, data),
            AccessTarget::ByName => self.with_handle(tag, |addr| self.transport.write(addr, data)),
        }
    }

    /// Read and decode a tag with a known layout.
    ///
    /// `Ok(None)` means the type has no decoding.
    ///
    /// # Errors
    ///
    /// [`TagError::CommunicationFailure`] for transport errors, codec errors
    /// lifted with [`tagcomm_codec::CodecError::for_tag`].
    pub fn read_with_layout(&self, tag: &Tag, layout: &Layout) -> TagResult<Option<TagValue>> {
        let raw = self
            .read_raw(tag, layout.byte_len())
            .map_err(|e| TagError::communication(tag.path(), e))?;
        self.codec
            .decode(&layout.type_name, layout.bit_size, &raw)
            .map_err(|e| e.for_tag(tag.path()))
    }

    /// Read and decode a tag.
    ///
    /// # Errors
    ///
    /// See [`Self::read_with_layout`].
    pub fn read_value(&self, id: TagId) -> TagResult<Option<TagValue>> {
        let layout = self.layout(id)?;
        let tag = self.arena.tag(id)?;
        self.read_with_layout(&tag, &layout)
    }

    /// Forget the resolved address of one tag and its members.
    pub fn invalidate(&self, id: TagId) {
        for member in self.arena.descendants(id) {
            if let Some(tag) = self.arena.get(member) {
                tag.invalidate_address();
            }
        }
    }
}
