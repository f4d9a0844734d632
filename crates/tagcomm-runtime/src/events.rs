//! Observer registries and event payloads.
//!
//! Every event category has its own [`EventHub`]. Dispatch is synchronous,
//! on the emitting thread, in registration order.

use crate::tag::TagId;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tagcomm_codec::TagValue;
use tagcomm_common::TagError;

/// Token returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered list of observers for one event type.
pub struct EventHub<E> {
    observers: RwLock<Vec<(SubscriptionId, Observer<E>)>>,
    next_id: AtomicU64,
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl<E> EventHub<E> {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Deliver `event` to every observer.
    ///
    /// Observers may subscribe or unsubscribe from inside the callback;
    /// the change applies to the next emission.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Observer<E>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            observer(event);
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// True when nobody listens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A tag's value changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagChanged {
    /// Tag that changed.
    pub tag: TagId,
    /// Full path of the tag.
    pub path: String,
    /// Value before the change.
    pub old: Option<TagValue>,
    /// Value after the change.
    pub new: Option<TagValue>,
}

/// All tags that changed during one refresh, in read order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectedTagsChanged {
    /// Changed tags.
    pub tags: Vec<TagId>,
}

/// Connection went up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStateChanged {
    /// New state.
    pub connected: bool,
}

/// Component that raised a [`CommunicationProblem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemSource {
    /// Polling refresh cycle.
    Polling,
    /// Notification callback.
    Notification,
    /// DataChannel writer.
    DataChannelWriter,
    /// DataChannel listener.
    DataChannelListener,
}

impl fmt::Display for ProblemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polling => write!(f, "polling"),
            Self::Notification => write!(f, "notification"),
            Self::DataChannelWriter => write!(f, "data_channel_writer"),
            Self::DataChannelListener => write!(f, "data_channel_listener"),
        }
    }
}

/// A failure on an asynchronous path, reported instead of returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommunicationProblem {
    /// Reporting component.
    pub source: ProblemSource,
    /// Human readable description.
    pub reason: String,
    /// Path of the tag involved, if any.
    pub tag: Option<String>,
    /// Underlying error, if any.
    #[serde(skip)]
    pub error: Option<TagError>,
    /// Whether the reporting component gave up.
    pub fatal: bool,
}

impl CommunicationProblem {
    /// Build a problem from an error.
    #[must_use]
    pub fn from_error(source: ProblemSource, tag: Option<&str>, error: TagError, fatal: bool) -> Self {
        Self {
            source,
            reason: error.to_string(),
            tag: tag.map(str::to_string),
            error: Some(error),
            fatal,
        }
    }
}

/// Event hubs exposed by every tag listener.
#[derive(Debug, Default)]
pub struct ListenerEvents {
    /// One event per changed tag.
    pub tag_changed: EventHub<TagChanged>,
    /// One event per refresh that changed at least one tag.
    pub collected_tags_changed: EventHub<CollectedTagsChanged>,
    /// Connection transitions.
    pub connection_state_changed: EventHub<ConnectionStateChanged>,
    /// Failures on the refresh path.
    pub communication_problem: EventHub<CommunicationProblem>,
}
