//! Push-based listener: one PLC-side change notification per tracked tag.

use super::{CycleOutcome, ListenerCore, TagListener};
use crate::access::{AccessTarget, Layout, TagAccess};
use crate::events::{CommunicationProblem, ProblemSource};
use crate::tag::TagId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tagcomm_common::{ListenerConfig, TagError, TagResult};
use tagcomm_transport::{NotificationCallback, SymbolAddress};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
struct Subscription {
    notification: u32,
    /// Symbol handle held for name-based tags.
    handle: Option<u32>,
}

#[derive(Debug)]
struct Inner {
    core: Arc<ListenerCore>,
    config: ListenerConfig,
    running: AtomicBool,
    subscriptions: Mutex<HashMap<TagId, Subscription>>,
}

/// Listener refreshed by PLC-side change notifications, one per tag.
///
/// Decoding happens on the transport's callback thread. A decode failure
/// stops the whole listener and is reported as a fatal problem.
#[derive(Debug)]
pub struct NotificationTagListener {
    inner: Arc<Inner>,
}

impl NotificationTagListener {
    /// Create a stopped listener.
    #[must_use]
    pub fn new(access: Arc<TagAccess>, config: ListenerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Arc::new(ListenerCore::new(access)),
                config,
                running: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Active PLC-side subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// Drop every subscription and subscribe again with fresh addresses.
    ///
    /// # Errors
    ///
    /// Subscription failures; the listener is left stopped.
    pub fn resubscribe(&self) -> TagResult<()> {
        self.stop();
        self.inner.core.clear_address_cache();
        self.start()
    }
}

impl Inner {
    fn subscribe(self: &Arc<Self>, id: TagId) -> TagResult<()> {
        let access = self.core.access();
        let tag = self.core.arena().tag(id)?;
        let layout = access.layout(id)?;
        let transport = access.transport();

        let (address, handle) = match access
            .resolve(&tag)
            .map_err(|e| TagError::communication(tag.path(), e))?
        {
            AccessTarget::Address(address) => (address, None),
            AccessTarget::ByName => {
                let handle = transport
                    .create_handle(tag.path())
                    .map_err(|e| TagError::communication(tag.path(), e))?;
                (SymbolAddress::by_handle(handle), Some(handle))
            }
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let callback_layout = layout.clone();
        let callback: NotificationCallback = Arc::new(move |data: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_notification(id, &callback_layout, data);
            }
        });

        // The first callback may arrive before this returns
        let notification = match transport.add_notification(
            address,
            layout.byte_len(),
            self.config.notification_cycle,
            callback,
        ) {
            Ok(n) => n,
            Err(e) => {
                if let Some(h) = handle {
                    if let Err(release) = transport.delete_handle(h) {
                        warn!(handle = h, error = %release, "Failed to release symbol handle");
                    }
                }
                return Err(TagError::communication(tag.path(), e));
            }
        };

        let subscription = Subscription {
            notification,
            handle,
        };
        if self.running.load(Ordering::Acquire) {
            self.subscriptions.lock().insert(id, subscription);
            debug!(tag = tag.path(), notification, "Subscribed");
        } else {
            // Stopped by a failing first callback
            self.release(subscription);
        }
        Ok(())
    }

    fn release(&self, subscription: Subscription) {
        let transport = self.core.access().transport();
        if let Err(e) = transport.delete_notification(subscription.notification) {
            warn!(notification = subscription.notification, error = %e, "Failed to delete notification");
        }
        if let Some(handle) = subscription.handle {
            if let Err(e) = transport.delete_handle(handle) {
                warn!(handle, error = %e, "Failed to release symbol handle");
            }
        }
    }

    fn unsubscribe(&self, id: TagId) {
        let removed = self.subscriptions.lock().remove(&id);
        if let Some(subscription) = removed {
            self.release(subscription);
        }
    }

    fn shutdown(&self) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        let drained: Vec<Subscription> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for subscription in drained {
            self.release(subscription);
        }
        true
    }

    fn on_notification(&self, id: TagId, layout: &Layout, data: &[u8]) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let path = self
            .core
            .arena()
            .get(id)
            .map(|t| t.path().to_string())
            .unwrap_or_default();

        match self
            .core
            .access()
            .codec()
            .decode(&layout.type_name, layout.bit_size, data)
        {
            Ok(value) => {
                self.core.apply_batch(vec![(id, value)]);
            }
            Err(e) => {
                error!(tag = %path, error = %e, "Notification decode failed, stopping listener");
                self.shutdown();
                self.core.report_problem(CommunicationProblem::from_error(
                    ProblemSource::Notification,
                    Some(&path),
                    e.for_tag(&path),
                    true,
                ));
            }
        }
    }
}

impl TagListener for NotificationTagListener {
    fn core(&self) -> &ListenerCore {
        &self.inner.core
    }

    fn start(&self) -> TagResult<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let core = &self.inner.core;
        core.set_connected(core.access().transport().is_connected());

        let snapshot = core.snapshot();
        for &id in snapshot.ids() {
            if let Err(e) = self.inner.subscribe(id) {
                self.inner.shutdown();
                return Err(e);
            }
        }
        info!(
            port = core.port(),
            subscriptions = self.subscription_count(),
            "Notification listener started"
        );
        Ok(())
    }

    fn stop(&self) {
        if self.inner.shutdown() {
            info!(port = self.inner.core.port(), "Notification listener stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn add_tag(&self, id: TagId) -> TagResult<TagId> {
        let core = &self.inner.core;
        let (tracked, added) = core.insert_bounded(id, self.inner.config.max_subscriptions)?;
        if added && self.is_running() {
            if let Err(e) = self.inner.subscribe(tracked) {
                core.remove(tracked);
                return Err(e);
            }
        }
        Ok(tracked)
    }

    fn remove_tag(&self, id: TagId) -> TagResult<bool> {
        let removed = self.inner.core.remove(id);
        self.inner.unsubscribe(id);
        Ok(removed)
    }

    fn refresh_all(&self) -> CycleOutcome {
        self.inner.core.run_cycle(ProblemSource::Notification)
    }

    fn clear_address_cache(&self) {
        if self.is_running() {
            if let Err(e) = self.resubscribe() {
                self.inner.core.report_problem(CommunicationProblem::from_error(
                    ProblemSource::Notification,
                    None,
                    e,
                    true,
                ));
            }
        } else {
            self.inner.core.clear_address_cache();
        }
    }
}

impl Drop for NotificationTagListener {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}
