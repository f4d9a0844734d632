//! Tag listeners.
//!
//! A listener tracks a set of tags (deduplicated by identity) and keeps
//! their values in sync with the PLC, either by polling
//! ([`PollingTagListener`]) or through PLC-side change notifications
//! ([`NotificationTagListener`]). Both share [`ListenerCore`].

mod notification;
mod polling;

pub use notification::NotificationTagListener;
pub use polling::PollingTagListener;

use crate::access::TagAccess;
use crate::events::{
    CollectedTagsChanged, CommunicationProblem, ConnectionStateChanged, ListenerEvents,
    ProblemSource, TagChanged,
};
use crate::tag::{TagArena, TagId, TagIdentity};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tagcomm_codec::TagValue;
use tagcomm_common::{CommConfig, ListenerMode, TagError, TagResult};
use tracing::{debug, error, info, warn};

/// Serializes batch application across all listeners in the process.
///
/// Reentrant so a change observer may trigger a synchronous read on the
/// same thread.
static APPLY_LOCK: ReentrantMutex<()> = parking_lot::const_reentrant_mutex(());

/// Immutable snapshot of the tracked tags.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    ids: Vec<TagId>,
    by_identity: HashMap<TagIdentity, TagId>,
}

impl TagSet {
    /// Tracked tags in insertion order.
    #[must_use]
    pub fn ids(&self) -> &[TagId] {
        &self.ids
    }

    /// Tag tracked under `identity`.
    #[must_use]
    pub fn get(&self, identity: &TagIdentity) -> Option<TagId> {
        self.by_identity.get(identity).copied()
    }

    /// Number of tracked tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Result of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Tags read.
    pub read: usize,
    /// Tags whose value changed.
    pub changed: usize,
    /// Time spent reading and decoding.
    pub read_duration: Duration,
    /// Time spent assigning values and firing events.
    pub apply_duration: Duration,
    /// The pass stopped at a transport error and applied nothing.
    pub aborted: bool,
}

/// State and behavior shared by both listener strategies.
pub struct ListenerCore {
    access: Arc<TagAccess>,
    port: u16,
    tags: ArcSwap<TagSet>,
    tags_write: Mutex<()>,
    connected: AtomicBool,
    events: ListenerEvents,
}

impl std::fmt::Debug for ListenerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCore")
            .field("port", &self.port)
            .field("tags", &self.tags.load().len())
            .field("connected", &self.connected.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ListenerCore {
    /// Create a core over shared tag access.
    #[must_use]
    pub fn new(access: Arc<TagAccess>) -> Self {
        let port = access.transport().port();
        let connected = access.transport().is_connected();
        Self {
            access,
            port,
            tags: ArcSwap::from_pointee(TagSet::default()),
            tags_write: Mutex::new(()),
            connected: AtomicBool::new(connected),
            events: ListenerEvents::default(),
        }
    }

    /// Tag access used by this listener.
    #[must_use]
    pub fn access(&self) -> &Arc<TagAccess> {
        &self.access
    }

    /// Tag arena.
    #[must_use]
    pub fn arena(&self) -> &Arc<TagArena> {
        self.access.arena()
    }

    /// Port assigned to tags without one.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Event hubs.
    #[must_use]
    pub fn events(&self) -> &ListenerEvents {
        &self.events
    }

    /// Current snapshot of tracked tags.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TagSet> {
        self.tags.load_full()
    }

    /// Track a tag. Returns the id already tracked under the same identity,
    /// or `id` itself together with `true` when it was added.
    ///
    /// # Errors
    ///
    /// [`tagcomm_common::TagError::UnknownTag`].
    pub fn insert(&self, id: TagId) -> TagResult<(TagId, bool)> {
        self.insert_with_limit(id, None)
    }

    /// Like [`Self::insert`], but refuses to grow the set beyond `limit`.
    /// Already tracked identities are returned even when the set is full.
    ///
    /// # Errors
    ///
    /// [`tagcomm_common::TagError::UnknownTag`] and
    /// [`tagcomm_common::TagError::SubscriptionLimitExceeded`].
    pub fn insert_bounded(&self, id: TagId, limit: usize) -> TagResult<(TagId, bool)> {
        self.insert_with_limit(id, Some(limit))
    }

    fn insert_with_limit(&self, id: TagId, limit: Option<usize>) -> TagResult<(TagId, bool)> {
        let tag = self.arena().tag(id)?;
        if tag.port() == 0 {
            self.arena().set_port(id, self.port);
        }
        let identity = tag.identity();

        let _writer = self.tags_write.lock();
        let current = self.tags.load();
        if let Some(existing) = current.get(&identity) {
            return Ok((existing, false));
        }
        if let Some(limit) = limit {
            if current.len() >= limit {
                return Err(TagError::SubscriptionLimitExceeded { limit });
            }
        }
        let mut next = TagSet::clone(&current);
        next.ids.push(id);
        next.by_identity.insert(identity, id);
        self.tags.store(Arc::new(next));
        debug!(tag = tag.path(), "Tag added to listener");
        Ok((id, true))
    }

    /// Stop tracking a tag. Returns false if it was not tracked.
    pub fn remove(&self, id: TagId) -> bool {
        let _writer = self.tags_write.lock();
        let current = self.tags.load();
        if !current.ids.contains(&id) {
            return false;
        }
        let mut next = TagSet::clone(&current);
        next.ids.retain(|t| *t != id);
        next.by_identity.retain(|_, t| *t != id);
        self.tags.store(Arc::new(next));
        true
    }

    /// Last reported connection state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record the connection state, firing an event on transitions.
    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::AcqRel) != connected {
            if connected {
                info!(port = self.port, "PLC connection established");
            } else {
                warn!(port = self.port, "PLC connection lost");
            }
            self.events
                .connection_state_changed
                .emit(&ConnectionStateChanged { connected });
        }
    }

    /// Log and publish a problem.
    pub fn report_problem(&self, problem: CommunicationProblem) {
        if problem.fatal {
            error!(source = %problem.source, tag = ?problem.tag, "{}", problem.reason);
        } else {
            warn!(source = %problem.source, tag = ?problem.tag, "{}", problem.reason);
        }
        self.events.communication_problem.emit(&problem);
    }

    /// Drop every cached address so all tracked tags re-resolve.
    pub fn clear_address_cache(&self) {
        let snapshot = self.snapshot();
        for id in snapshot.ids() {
            self.access.invalidate(*id);
        }
        info!(tags = snapshot.len(), "Address cache cleared");
    }

    /// Read one tag now, outside any schedule, and assign the result.
    ///
    /// The tag's value lock is held from the read until the assignment.
    ///
    /// # Errors
    ///
    /// Transport and codec errors, returned to the caller.
    pub fn read_one_synchronously(&self, id: TagId) -> TagResult<Option<TagValue>> {
        let tag = self.arena().tag(id)?;
        let layout = self.access.layout(id)?;

        let _apply = APPLY_LOCK.lock();
        let event = {
            let mut guard = tag.lock_value();
            let value = self.access.read_with_layout(&tag, &layout)?;
            let old = guard.get().cloned();
            guard.set(value.clone()).then(|| TagChanged {
                tag: id,
                path: tag.path().to_string(),
                old,
                new: value.clone(),
            })
        };
        let value = tag.value();
        if let Some(event) = event {
            self.events.tag_changed.emit(&event);
        }
        Ok(value)
    }

    /// Assign a batch of values and fan out events.
    ///
    /// Returns the tags that changed, in batch order.
    pub fn apply_batch(&self, batch: Vec<(TagId, Option<TagValue>)>) -> Vec<TagId> {
        let _apply = APPLY_LOCK.lock();
        let mut changed = Vec::new();
        for (id, value) in batch {
            let Some(tag) = self.arena().get(id) else {
                continue;
            };
            let old = tag.value();
            if tag.set_value(value.clone()) {
                changed.push(id);
                self.events.tag_changed.emit(&TagChanged {
                    tag: id,
                    path: tag.path().to_string(),
                    old,
                    new: value,
                });
            }
        }
        if !changed.is_empty() {
            self.events
                .collected_tags_changed
                .emit(&CollectedTagsChanged {
                    tags: changed.clone(),
                });
        }
        changed
    }

    /// Read every active tracked tag, then apply the whole batch.
    ///
    /// A transport error invalidates the failing tag's address (or the
    /// whole cache for address-invalidation errors) and aborts the pass
    /// without applying anything. Codec errors skip the tag.
    pub fn run_cycle(&self, source: ProblemSource) -> CycleOutcome {
        let snapshot = self.snapshot();
        let mut outcome = CycleOutcome::default();
        let read_start = Instant::now();
        let mut batch = Vec::with_capacity(snapshot.len());

        for &id in snapshot.ids() {
            let Some(tag) = self.arena().get(id) else {
                continue;
            };
            if !tag.is_active() {
                continue;
            }
            match self.access.read_value(id) {
                Ok(value) => batch.push((id, value)),
                Err(e) => match e.transport_error() {
                    Some(transport) => {
                        if transport.is_address_invalidation() {
                            self.clear_address_cache();
                        } else {
                            self.access.invalidate(id);
                        }
                        self.report_problem(CommunicationProblem::from_error(
                            source,
                            Some(tag.path()),
                            e,
                            false,
                        ));
                        outcome.read = batch.len();
                        outcome.read_duration = read_start.elapsed();
                        outcome.aborted = true;
                        return outcome;
                    }
                    None => self.report_problem(CommunicationProblem::from_error(
                        source,
                        Some(tag.path()),
                        e,
                        false,
                    )),
                },
            }
        }

        outcome.read = batch.len();
        outcome.read_duration = read_start.elapsed();
        let apply_start = Instant::now();
        outcome.changed = self.apply_batch(batch).len();
        outcome.apply_duration = apply_start.elapsed();
        outcome
    }
}

/// Common contract of the two refresh strategies.
pub trait TagListener: Send + Sync {
    /// Shared state.
    fn core(&self) -> &ListenerCore;

    /// Begin refreshing.
    ///
    /// # Errors
    ///
    /// Setup failures such as a thread that cannot be spawned.
    fn start(&self) -> TagResult<()>;

    /// Stop refreshing; blocks until background work has finished.
    fn stop(&self);

    /// Whether refreshing is active.
    fn is_running(&self) -> bool;

    /// Track a tag, deduplicated by identity. Returns the tracked id.
    ///
    /// # Errors
    ///
    /// Strategy specific, e.g. [`tagcomm_common::TagError::SubscriptionLimitExceeded`].
    fn add_tag(&self, id: TagId) -> TagResult<TagId>;

    /// Stop tracking a tag.
    ///
    /// # Errors
    ///
    /// Strategy specific cleanup failures.
    fn remove_tag(&self, id: TagId) -> TagResult<bool>;

    /// Read a tag now and assign its value.
    ///
    /// # Errors
    ///
    /// Transport and codec errors.
    fn read_one_synchronously(&self, id: TagId) -> TagResult<Option<TagValue>> {
        self.core().read_one_synchronously(id)
    }

    /// Read all tracked tags once and apply the result.
    fn refresh_all(&self) -> CycleOutcome;

    /// Event hubs.
    fn events(&self) -> &ListenerEvents {
        self.core().events()
    }

    /// Last known connection state.
    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    /// Tracked tags.
    fn tags(&self) -> Vec<TagId> {
        self.core().snapshot().ids().to_vec()
    }

    /// Drop all cached addresses.
    fn clear_address_cache(&self) {
        self.core().clear_address_cache();
    }
}

/// Build the listener selected by `config.listener.mode`.
///
/// # Errors
///
/// Never for the built-in strategies; kept fallible for setup symmetry.
pub fn build_listener(access: Arc<TagAccess>, config: &CommConfig) -> TagResult<Arc<dyn TagListener>> {
    Ok(match config.listener.mode {
        ListenerMode::Polling => Arc::new(PollingTagListener::new(access, config.polling.clone())),
        ListenerMode::Notification => {
            Arc::new(NotificationTagListener::new(access, config.listener.clone()))
        }
    })
}
