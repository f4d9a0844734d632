//! Tag model.
//!
//! Tags live in a [`TagArena`] and are referenced by [`TagId`]. Parent and
//! child links are ids, so a tag never owns its relatives.
//!
//! Equality of tags is decided by [`TagIdentity`] (scope, name, port,
//! area), never by value.

use crate::events::{EventHub, SubscriptionId, TagChanged};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use tagcomm_codec::{resolve_bit_size, CodecError, TagValue, TypeName};
use tagcomm_common::{TagDefinition, TagError, TagResult};
use tagcomm_transport::SymbolAddress;
use tracing::trace;

/// Stable handle of a tag inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TagId(u32);

impl TagId {
    /// Arena slot.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The tuple tags are compared and hashed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagIdentity {
    /// POU or GVL name.
    pub scope: String,
    /// Variable path below the scope.
    pub name: String,
    /// AMS port, 0 when not yet assigned.
    pub port: u16,
    /// Memory area.
    pub area: String,
}

/// Cached hardware address of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressState {
    /// Not resolved yet.
    #[default]
    Unresolved,
    /// Resolution failed; use name-based access from now on.
    Unresolvable,
    /// Resolved numeric address.
    Resolved(SymbolAddress),
}

impl AddressState {
    /// Index group in the classic encoding: 0 unresolved, -1 failed.
    #[must_use]
    pub fn index_group(&self) -> i64 {
        match self {
            Self::Unresolved => 0,
            Self::Unresolvable => -1,
            Self::Resolved(addr) => i64::from(addr.index_group),
        }
    }
}

#[derive(Debug, Clone)]
struct TypeInfo {
    data_type: String,
    parsed: Result<TypeName, CodecError>,
    bit_size: i64,
    manual: bool,
}

impl TypeInfo {
    fn new(data_type: &str) -> Self {
        Self {
            data_type: data_type.trim().to_string(),
            parsed: TypeName::parse(data_type),
            bit_size: 0,
            manual: false,
        }
    }
}

/// One PLC variable.
pub struct Tag {
    id: TagId,
    parent: Option<TagId>,
    scope: String,
    name: String,
    path: String,
    area: String,
    port: AtomicU16,
    active: AtomicBool,
    type_info: RwLock<TypeInfo>,
    address: Mutex<AddressState>,
    value: Mutex<Option<TagValue>>,
    children: RwLock<Vec<TagId>>,
    changed: EventHub<TagChanged>,
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("data_type", &self.type_info.read().data_type)
            .field("port", &self.port())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Tag {}

impl std::hash::Hash for Tag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl Tag {
    /// Arena handle.
    #[must_use]
    pub fn id(&self) -> TagId {
        self.id
    }

    /// Parent tag, for struct members.
    #[must_use]
    pub fn parent(&self) -> Option<TagId> {
        self.parent
    }

    /// Scope (POU or GVL name).
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Name below the scope; members carry their parent's name as prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Symbol path used for name-based access, `scope.name`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Memory area.
    #[must_use]
    pub fn area(&self) -> &str {
        &self.area
    }

    /// AMS port, 0 when unassigned.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Identity tuple.
    #[must_use]
    pub fn identity(&self) -> TagIdentity {
        TagIdentity {
            scope: self.scope.clone(),
            name: self.name.clone(),
            port: self.port(),
            area: self.area.clone(),
        }
    }

    /// Whether the tag takes part in refresh cycles.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Include or exclude the tag from refresh cycles.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Declared type name.
    #[must_use]
    pub fn data_type(&self) -> String {
        self.type_info.read().data_type.clone()
    }

    /// Change the declared type.
    ///
    /// An auto-detected bit size is dropped and detected again on next use.
    /// A manually set bit size survives until it is reset to 0.
    pub fn set_data_type(&self, data_type: &str) {
        let mut info = self.type_info.write();
        let keep = info.manual && info.bit_size != 0;
        let bit_size = info.bit_size;
        *info = TypeInfo::new(data_type);
        if keep {
            info.bit_size = bit_size;
            info.manual = true;
        }
        trace!(tag = %self.path, data_type, "Data type changed");
    }

    /// Parsed type name.
    ///
    /// # Errors
    ///
    /// [`TagError::InvalidTagDefinition`] when the type name is malformed.
    pub fn type_name(&self) -> TagResult<TypeName> {
        self.type_info
            .read()
            .parsed
            .clone()
            .map_err(|e| e.for_tag(&self.path))
    }

    /// True when the declared type is an ARRAY.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(&self.type_info.read().parsed, Ok(t) if t.is_array())
    }

    /// Set the bit size manually; 0 returns to auto-detection.
    pub fn set_bit_size(&self, bit_size: i64) {
        let mut info = self.type_info.write();
        info.bit_size = bit_size;
        info.manual = bit_size != 0;
    }

    /// Cached bit size without triggering detection.
    #[must_use]
    pub fn cached_bit_size(&self) -> i64 {
        self.type_info.read().bit_size
    }

    /// Whether the bit size was set manually.
    #[must_use]
    pub fn has_manual_bit_size(&self) -> bool {
        self.type_info.read().manual
    }

    fn detect_bit_size(&self) -> TagResult<i64> {
        let mut info = self.type_info.write();
        if info.bit_size != 0 {
            return Ok(info.bit_size);
        }
        let parsed = info.parsed.clone().map_err(|e| e.for_tag(&self.path))?;
        let current = self.value.lock().clone();
        let size = resolve_bit_size(&parsed, current.as_ref()).map_err(|e| e.for_tag(&self.path))?;
        info.bit_size = size;
        Ok(size)
    }

    /// Cached hardware address.
    #[must_use]
    pub fn address(&self) -> AddressState {
        *self.address.lock()
    }

    /// Replace the cached address.
    pub fn set_address(&self, state: AddressState) {
        *self.address.lock() = state;
    }

    /// Forget a resolved address; unresolvable tags stay unresolvable.
    pub fn invalidate_address(&self) {
        let mut address = self.address.lock();
        if matches!(*address, AddressState::Resolved(_)) {
            *address = AddressState::Unresolved;
        }
    }

    /// Current value (cloned).
    #[must_use]
    pub fn value(&self) -> Option<TagValue> {
        self.value.lock().clone()
    }

    /// Assign a value; fires a change event unless it equals the current one.
    pub fn set_value(&self, value: Option<TagValue>) -> bool {
        let mut guard = self.lock_value();
        guard.set(value)
    }

    /// Lock the value for a read-modify-assign sequence.
    ///
    /// The change event, if any, fires when the guard is dropped, after the
    /// lock is released.
    pub fn lock_value(&self) -> ValueGuard<'_> {
        ValueGuard {
            tag: self,
            guard: Some(self.value.lock()),
            original: None,
        }
    }

    /// Observe changes of this tag only.
    pub fn on_change<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&TagChanged) + Send + Sync + 'static,
    {
        self.changed.subscribe(observer)
    }

    /// Stop observing.
    pub fn remove_on_change(&self, id: SubscriptionId) -> bool {
        self.changed.unsubscribe(id)
    }

    /// Struct members in declaration order.
    #[must_use]
    pub fn children(&self) -> Vec<TagId> {
        self.children.read().clone()
    }
}

/// Exclusive access to a tag's value.
pub struct ValueGuard<'a> {
    tag: &'a Tag,
    guard: Option<MutexGuard<'a, Option<TagValue>>>,
    original: Option<Option<TagValue>>,
}

impl ValueGuard<'_> {
    /// Current value.
    #[must_use]
    pub fn get(&self) -> Option<&TagValue> {
        self.guard.as_ref().and_then(|g| g.as_ref())
    }

    /// Assign a value. Returns true when it differs from the current one.
    pub fn set(&mut self, value: Option<TagValue>) -> bool {
        let Some(guard) = self.guard.as_mut() else {
            return false;
        };
        if TagValue::same_option(guard.as_ref(), value.as_ref()) {
            return false;
        }
        let previous = std::mem::replace(&mut **guard, value);
        if self.original.is_none() {
            self.original = Some(previous);
        }
        true
    }
}

impl Drop for ValueGuard<'_> {
    fn drop(&mut self) {
        let current = self.guard.as_ref().and_then(|g| (**g).clone());
        drop(self.guard.take());
        if let Some(old) = self.original.take() {
            if !TagValue::same_option(old.as_ref(), current.as_ref()) {
                self.tag.changed.emit(&TagChanged {
                    tag: self.tag.id,
                    path: self.tag.path.clone(),
                    old,
                    new: current,
                });
            }
        }
    }
}

/// Parameters of a new top-level tag.
#[derive(Debug, Clone, Default)]
pub struct TagSpec {
    /// POU or GVL name.
    pub scope: String,
    /// Variable name.
    pub name: String,
    /// IEC type name or UDT name.
    pub data_type: String,
    /// Memory area.
    pub area: String,
}

impl TagSpec {
    /// Spec with an empty area.
    #[must_use]
    pub fn new(scope: &str, name: &str, data_type: &str) -> Self {
        Self {
            scope: scope.to_string(),
            name: name.to_string(),
            data_type: data_type.to_string(),
            area: String::new(),
        }
    }
}

/// Append-only owner of all tags.
#[derive(Debug, Default)]
pub struct TagArena {
    tags: RwLock<Vec<Arc<Tag>>>,
}

fn join_path(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

impl TagArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, build: impl FnOnce(TagId) -> Tag) -> TagResult<TagId> {
        let mut tags = self.tags.write();
        let index = u32::try_from(tags.len())
            .map_err(|_| TagError::Config("tag arena is full".into()))?;
        let id = TagId(index);
        tags.push(Arc::new(build(id)));
        Ok(id)
    }

    /// Create a top-level tag.
    ///
    /// # Errors
    ///
    /// [`TagError::InvalidTagDefinition`] for an empty name.
    pub fn create_tag(&self, spec: TagSpec) -> TagResult<TagId> {
        if spec.name.trim().is_empty() {
            return Err(TagError::invalid_definition(&spec.scope, "empty tag name"));
        }
        let path = join_path(&spec.scope, &spec.name);
        self.insert(|id| Tag {
            id,
            parent: None,
            path,
            scope: spec.scope,
            name: spec.name,
            area: spec.area,
            port: AtomicU16::new(0),
            active: AtomicBool::new(true),
            type_info: RwLock::new(TypeInfo::new(&spec.data_type)),
            address: Mutex::new(AddressState::Unresolved),
            value: Mutex::new(None),
            children: RwLock::new(Vec::new()),
            changed: EventHub::new(),
        })
    }

    /// Append a struct member to `parent`.
    ///
    /// The member inherits scope, area and port and is named
    /// `parent_name.field`.
    ///
    /// # Errors
    ///
    /// [`TagError::UnknownTag`] or [`TagError::InvalidTagDefinition`].
    pub fn add_child(&self, parent: TagId, field: &str, data_type: &str) -> TagResult<TagId> {
        let parent_tag = self.tag(parent)?;
        if field.trim().is_empty() {
            return Err(TagError::invalid_definition(parent_tag.path(), "empty member name"));
        }
        let name = format!("{}.{field}", parent_tag.name);
        let path = join_path(&parent_tag.scope, &name);
        let child = self.insert(|id| Tag {
            id,
            parent: Some(parent),
            path,
            scope: parent_tag.scope.clone(),
            name,
            area: parent_tag.area.clone(),
            port: AtomicU16::new(parent_tag.port()),
            active: AtomicBool::new(true),
            type_info: RwLock::new(TypeInfo::new(data_type)),
            address: Mutex::new(AddressState::Unresolved),
            value: Mutex::new(None),
            children: RwLock::new(Vec::new()),
            changed: EventHub::new(),
        })?;
        parent_tag.children.write().push(child);
        Ok(child)
    }

    /// Build a tag and its members from a configuration entry.
    ///
    /// # Errors
    ///
    /// Definition errors from [`Self::create_tag`] and [`Self::add_child`].
    pub fn create_from_definition(&self, def: &TagDefinition) -> TagResult<TagId> {
        let id = self.create_tag(TagSpec {
            scope: def.scope.clone(),
            name: def.name.clone(),
            data_type: def.data_type.clone(),
            area: def.area.clone(),
        })?;
        for field in &def.fields {
            self.add_child(id, &field.name, &field.data_type)?;
        }
        let tag = self.tag(id)?;
        tag.set_active(def.active);
        if let Some(bits) = def.bit_size {
            tag.set_bit_size(bits);
        }
        Ok(id)
    }

    /// Look up a tag.
    #[must_use]
    pub fn get(&self, id: TagId) -> Option<Arc<Tag>> {
        self.tags.read().get(id.index()).cloned()
    }

    /// Look up a tag or fail.
    ///
    /// # Errors
    ///
    /// [`TagError::UnknownTag`].
    pub fn tag(&self, id: TagId) -> TagResult<Arc<Tag>> {
        self.get(id).ok_or(TagError::UnknownTag(id.0))
    }

    /// Find a tag by path (case-insensitive).
    #[must_use]
    pub fn find(&self, path: &str) -> Option<TagId> {
        self.tags
            .read()
            .iter()
            .find(|t| t.path.eq_ignore_ascii_case(path.trim()))
            .map(|t| t.id)
    }

    /// Members of `id`.
    #[must_use]
    pub fn children(&self, id: TagId) -> Vec<TagId> {
        self.get(id).map(|t| t.children()).unwrap_or_default()
    }

    /// Parent of `id`.
    #[must_use]
    pub fn parent(&self, id: TagId) -> Option<TagId> {
        self.get(id).and_then(|t| t.parent)
    }

    /// `id` and all its members, depth first.
    #[must_use]
    pub fn descendants(&self, id: TagId) -> Vec<TagId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.children(out[i]));
            i += 1;
        }
        out
    }

    /// Assign a port to a tag and all its members.
    pub fn set_port(&self, id: TagId, port: u16) {
        for member in self.descendants(id) {
            if let Some(tag) = self.get(member) {
                tag.port.store(port, Ordering::Release);
            }
        }
    }

    /// Bit size of a tag, detecting it on first use.
    ///
    /// A struct whose type resolves to 0 reports the sum of its members.
    ///
    /// # Errors
    ///
    /// [`TagError::InvalidTagDefinition`] for malformed types or bounds.
    pub fn bit_size(&self, id: TagId) -> TagResult<i64> {
        let tag = self.tag(id)?;
        let size = tag.detect_bit_size()?;
        if size != 0 {
            return Ok(size);
        }
        let children = tag.children();
        if children.is_empty() {
            return Ok(0);
        }
        let mut total = 0i64;
        for child in children {
            let child_size = self.bit_size(child)?;
            if child_size <= 0 {
                return Ok(child_size);
            }
            total += child_size;
        }
        Ok(total)
    }

    /// Number of tags ever created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.read().len()
    }

    /// True when no tag was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
