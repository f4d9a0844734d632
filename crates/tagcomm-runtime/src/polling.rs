//! Background refresh thread of the polling listener.
//!
//! Each cycle first probes the PLC. Version changes clear the address cache,
//! port errors trigger reconnect attempts, and downtime beyond the configured
//! budget stops the thread for good. A healthy cycle reads every active tag
//! and feeds the timings into a [`PerformanceBuffer`].

use crate::events::{CommunicationProblem, ProblemSource};
use crate::listener::ListenerCore;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tagcomm_common::{
    CycleSample, PerformanceBuffer, PerformanceSummary, PollingConfig, TagError, TagResult,
    TransportError,
};
use tracing::{debug, error, info, warn};

/// Longest uninterrupted sleep; bounds how long [`PollingManager::stop`]
/// waits for the thread.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Counters updated by the polling thread.
#[derive(Debug, Default)]
pub struct PollingStats {
    cycles: CachePadded<AtomicU64>,
    aborted_cycles: CachePadded<AtomicU64>,
    changed_values: CachePadded<AtomicU64>,
    reconnect_attempts: CachePadded<AtomicU64>,
}

/// Point-in-time copy of [`PollingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollingStatsSnapshot {
    /// Completed cycles.
    pub cycles: u64,
    /// Cycles stopped by a transport error.
    pub aborted_cycles: u64,
    /// Value changes applied.
    pub changed_values: u64,
    /// Reconnect attempts.
    pub reconnect_attempts: u64,
}

impl PollingStats {
    /// Copy the counters.
    #[must_use]
    pub fn snapshot(&self) -> PollingStatsSnapshot {
        PollingStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            aborted_cycles: self.aborted_cycles.load(Ordering::Relaxed),
            changed_values: self.changed_values.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    core: Arc<ListenerCore>,
    config: PollingConfig,
    stop: AtomicBool,
    failed: AtomicBool,
    stats: PollingStats,
    last_summary: Mutex<Option<PerformanceSummary>>,
}

/// Owner of the polling thread.
pub struct PollingManager {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PollingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingManager")
            .field("running", &self.is_running())
            .field("failed", &self.has_failed())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PollingManager {
    /// Create a stopped manager.
    #[must_use]
    pub fn new(core: Arc<ListenerCore>, config: PollingConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                core,
                config,
                stop: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                stats: PollingStats::default(),
                last_summary: Mutex::new(None),
            }),
            handle: None,
        }
    }

    /// Start the polling thread. Does nothing if it is already running.
    ///
    /// # Errors
    ///
    /// [`TagError::Config`] if the thread cannot be spawned.
    pub fn start(&mut self) -> TagResult<()> {
        if self.is_running() {
            return Ok(());
        }
        // Reap a thread that exited on its own
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        self.shared.stop.store(false, Ordering::Release);
        self.shared.failed.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let port = shared.core.port();

        let handle = thread::Builder::new()
            .name(format!("tagcomm-poll-{port}"))
            .spawn(move || polling_loop(&shared))
            .map_err(|e| TagError::Config(format!("Failed to spawn polling thread: {e}")))?;
        self.handle = Some(handle);

        info!(
            port,
            refresh_rate_ms = self.shared.config.refresh_rate.as_millis(),
            "Polling started"
        );
        Ok(())
    }

    /// Stop the thread and wait for it to finish its current cycle.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!(port = self.shared.core.port(), "Polling stopped");
        }
    }

    /// Whether the thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Whether the thread gave up after exceeding the reconnect budget.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> PollingStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Most recent performance summary.
    #[must_use]
    pub fn last_summary(&self) -> Option<PerformanceSummary> {
        *self.shared.last_summary.lock()
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of the pre-cycle health probe.
enum Probe {
    Healthy,
    Down(TransportError),
}

fn probe(shared: &Shared) -> Probe {
    let core = &shared.core;
    let transport = core.access().transport();
    match transport.read_state() {
        Ok(()) => Probe::Healthy,
        Err(e) if e.is_address_invalidation() => {
            info!(error = %e, "PLC symbol table changed");
            core.clear_address_cache();
            Probe::Healthy
        }
        Err(e) if e.is_port_error() => {
            core.set_connected(false);
            shared
                .stats
                .reconnect_attempts
                .fetch_add(1, Ordering::Relaxed);
            match transport.connect() {
                Ok(()) => {
                    core.clear_address_cache();
                    Probe::Healthy
                }
                Err(reconnect) => {
                    debug!(error = %reconnect, "Reconnect attempt failed");
                    Probe::Down(reconnect)
                }
            }
        }
        Err(e) => Probe::Down(e),
    }
}

fn polling_loop(shared: &Shared) {
    let core = &shared.core;
    let config = &shared.config;
    let mut performance = PerformanceBuffer::new(config.performance_samples);
    let mut down_since: Option<Instant> = None;
    let mut next_cycle = Instant::now();

    while !shared.stop.load(Ordering::Acquire) {
        match probe(shared) {
            Probe::Healthy => {
                if down_since.take().is_some() {
                    info!("PLC reachable again");
                }
                core.set_connected(true);

                let outcome = core.run_cycle(ProblemSource::Polling);
                shared.stats.cycles.fetch_add(1, Ordering::Relaxed);
                shared
                    .stats
                    .changed_values
                    .fetch_add(outcome.changed as u64, Ordering::Relaxed);
                if outcome.aborted {
                    shared.stats.aborted_cycles.fetch_add(1, Ordering::Relaxed);
                } else if let Some(summary) = performance.record(CycleSample {
                    read: outcome.read_duration,
                    apply: outcome.apply_duration,
                }) {
                    info!(
                        samples = summary.samples,
                        read_mean_us = summary.read.mean.as_micros(),
                        read_max_us = summary.read.max.as_micros(),
                        apply_mean_us = summary.apply.mean.as_micros(),
                        apply_max_us = summary.apply.max.as_micros(),
                        "Polling performance"
                    );
                    *shared.last_summary.lock() = Some(summary);
                }
            }
            Probe::Down(e) => {
                core.set_connected(false);
                let since = *down_since.get_or_insert_with(Instant::now);
                let downtime = since.elapsed();
                if downtime > config.reconnect_timeout {
                    error!(
                        downtime_ms = downtime.as_millis(),
                        error = %e,
                        "Reconnect budget exhausted, polling stopped"
                    );
                    shared.failed.store(true, Ordering::Release);
                    core.report_problem(CommunicationProblem {
                        source: ProblemSource::Polling,
                        reason: format!(
                            "PLC unreachable for {downtime:?}, giving up: {e}"
                        ),
                        tag: None,
                        error: Some(TagError::NotConnected),
                        fatal: true,
                    });
                    return;
                }
                warn!(downtime_ms = downtime.as_millis(), error = %e, "PLC unreachable");
            }
        }

        next_cycle += config.refresh_rate;
        let now = Instant::now();
        if next_cycle < now {
            // Overran; restart the schedule instead of bursting
            next_cycle = now;
        }
        sleep_until(shared, next_cycle);
    }
}

fn sleep_until(shared: &Shared, deadline: Instant) {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
