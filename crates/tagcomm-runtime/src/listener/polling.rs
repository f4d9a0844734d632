use super::{CycleOutcome, ListenerCore, TagListener};
use crate::access::TagAccess;
use crate::events::ProblemSource;
use crate::polling::{PollingManager, PollingStatsSnapshot};
use crate::tag::TagId;
use parking_lot::Mutex;
use std::sync::Arc;
use tagcomm_common::{PerformanceSummary, PollingConfig, TagResult};

/// Listener refreshed by a dedicated polling thread.
#[derive(Debug)]
pub struct PollingTagListener {
    core: Arc<ListenerCore>,
    manager: Mutex<PollingManager>,
}

impl PollingTagListener {
    /// Create a stopped listener.
    #[must_use]
    pub fn new(access: Arc<TagAccess>, config: PollingConfig) -> Self {
        let core = Arc::new(ListenerCore::new(access));
        let manager = PollingManager::new(Arc::clone(&core), config);
        Self {
            core,
            manager: Mutex::new(manager),
        }
    }

    /// Polling counters.
    #[must_use]
    pub fn stats(&self) -> PollingStatsSnapshot {
        self.manager.lock().stats()
    }

    /// Most recent performance summary.
    #[must_use]
    pub fn last_summary(&self) -> Option<PerformanceSummary> {
        self.manager.lock().last_summary()
    }

    /// Whether the polling thread gave up reconnecting.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.manager.lock().has_failed()
    }
}

impl TagListener for PollingTagListener {
    fn core(&self) -> &ListenerCore {
        &self.core
    }

    fn start(&self) -> TagResult<()> {
        self.manager.lock().start()
    }

    fn stop(&self) {
        self.manager.lock().stop();
    }

    fn is_running(&self) -> bool {
        self.manager.lock().is_running()
    }

    fn add_tag(&self, id: TagId) -> TagResult<TagId> {
        // Picked up by the next cycle
        self.core.insert(id).map(|(tracked, _)| tracked)
    }

    fn remove_tag(&self, id: TagId) -> TagResult<bool> {
        Ok(self.core.remove(id))
    }

    fn refresh_all(&self) -> CycleOutcome {
        self.core.run_cycle(ProblemSource::Polling)
    }
}
