//! Unix signal handling for the daemon.
//!
//! SIGTERM and SIGINT request shutdown, SIGHUP requests a reload. The raw
//! handlers only store into static atomics; a forwarder thread moves those
//! flags into the shared [`SignalState`] polled by the main loop.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM.
    Terminate = 1,
    /// SIGINT.
    Interrupt = 2,
    /// SIGHUP.
    Hangup = 3,
}

impl SignalKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Terminate),
            2 => Some(Self::Interrupt),
            3 => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags shared between the forwarder thread and the main loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    reload_requested: AtomicBool,
    signal_count: AtomicU32,
    last_signal: AtomicU8,
}

impl SignalState {
    /// Fresh state with no pending requests.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Returns whether a reload was requested and clears the request.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Relaxed);
    }

    fn record(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        self.last_signal.store(kind as u8, Ordering::Relaxed);
        match kind {
            SignalKind::Terminate | SignalKind::Interrupt => self.request_shutdown(),
            SignalKind::Hangup => self.request_reload(),
        }
    }

    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }

    /// Most recent signal, if any arrived.
    pub fn last_signal(&self) -> Option<SignalKind> {
        SignalKind::from_code(self.last_signal.load(Ordering::Relaxed))
    }
}

static SIGTERM_SEEN: AtomicBool = AtomicBool::new(false);
static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);
static SIGHUP_SEEN: AtomicBool = AtomicBool::new(false);

/// Owner of the installed handlers.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Install the handlers and start the forwarder thread.
    ///
    /// On non-Unix targets only [`SignalHandler::request_shutdown`] stops
    /// the daemon.
    pub fn new() -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(SignalState::new()),
        };

        #[cfg(unix)]
        handler.install()?;

        Ok(handler)
    }

    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn install(&self) -> std::io::Result<()> {
        use std::os::raw::c_int;

        extern "C" fn on_sigterm(_: c_int) {
            SIGTERM_SEEN.store(true, Ordering::Relaxed);
        }

        extern "C" fn on_sigint(_: c_int) {
            SIGINT_SEEN.store(true, Ordering::Relaxed);
        }

        extern "C" fn on_sighup(_: c_int) {
            SIGHUP_SEEN.store(true, Ordering::Relaxed);
        }

        let state = Arc::clone(&self.state);
        thread::Builder::new()
            .name("tagcomm-signals".into())
            .spawn(move || forward(&state))?;

        let handlers: [(c_int, extern "C" fn(c_int)); 3] = [
            (libc::SIGTERM, on_sigterm),
            (libc::SIGINT, on_sigint),
            (libc::SIGHUP, on_sighup),
        ];
        for (signal, handler) in handlers {
            // SAFETY: the handlers only touch atomics, which is async-signal-safe.
            let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
            if previous == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }

        debug!("Unix signal handlers registered");
        Ok(())
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.state.take_reload_request()
    }

    /// Stop the daemon without a signal.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

fn forward(state: &SignalState) {
    let pending = [
        (&SIGTERM_SEEN, SignalKind::Terminate),
        (&SIGINT_SEEN, SignalKind::Interrupt),
        (&SIGHUP_SEEN, SignalKind::Hangup),
    ];
    while !state.shutdown_requested() {
        for (flag, kind) in pending {
            if flag.swap(false, Ordering::Relaxed) {
                info!(signal = %kind, "Signal received");
                state.record(kind);
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
}
