//! In-memory PLC for tests and the daemon's simulated driver.
//!
//! Symbols live in one flat data area (index group [`PLC_RW_DB`]). Struct
//! members alias ranges of their parent, the way they do on a real PLC.
//! The simulation records every write, can script read responses and
//! inject faults, and can emulate a program redeploy that invalidates all
//! previously resolved addresses.

use crate::index::{PLC_RW_DB, RW_SYMVAL_BYHANDLE};
use crate::{AdsTransport, NotificationCallback, SymbolAddress};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tagcomm_common::{TransportError, TransportResult, DEFAULT_ADS_PORT};
use tracing::{debug, info, trace};

/// Offset shift applied to the data area on every redeploy.
const REDEPLOY_SHIFT: u32 = 0x0001_0000;

/// One write observed by the simulated PLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    /// Symbol path, when the write hit a symbol exactly.
    pub path: Option<String>,
    /// Address that was written.
    pub address: SymbolAddress,
    /// Bytes written.
    pub data: Vec<u8>,
}

/// Reaction of the PLC program to a write, returning replacement bytes.
pub type WriteHook = std::sync::Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    offset: u32,
    size: usize,
    addressable: bool,
}

struct Notification {
    offset: u32,
    len: usize,
    last: Vec<u8>,
    callback: NotificationCallback,
}

#[derive(Default)]
struct Faults {
    reads: Vec<(Option<String>, TransportError, usize)>,
    writes: Vec<(Option<String>, TransportError, usize)>,
    state: VecDeque<TransportError>,
    connect: Option<TransportError>,
}

impl Faults {
    fn take(
        list: &mut Vec<(Option<String>, TransportError, usize)>,
        path: Option<&str>,
    ) -> Option<TransportError> {
        let idx = list.iter().position(|(target, _, _)| match target {
            None => true,
            Some(t) => path == Some(t.as_str()),
        })?;
        let error = list[idx].1.clone();
        list[idx].2 -= 1;
        if list[idx].2 == 0 {
            list.remove(idx);
        }
        Some(error)
    }
}

struct Inner {
    connected: bool,
    base: u32,
    memory: Vec<u8>,
    symbols: HashMap<String, Symbol>,
    handles: HashMap<u32, String>,
    next_handle: u32,
    notifications: HashMap<u32, Notification>,
    next_notification: u32,
    scripts: HashMap<String, VecDeque<Vec<u8>>>,
    hooks: HashMap<String, WriteHook>,
    faults: Faults,
    version_changed: bool,
    latency: Duration,
    write_log: Vec<WriteRecord>,
    reads: u64,
    connect_attempts: u64,
}

impl Inner {
    fn check_link(&self) -> TransportResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn symbol(&self, path: &str) -> TransportResult<&Symbol> {
        self.symbols
            .get(&key(path))
            .ok_or_else(|| TransportError::SymbolNotFound {
                path: path.to_string(),
            })
    }

    /// Symbol whose range starts at `offset` with exactly `len` bytes.
    fn symbol_at(&self, offset: u32, len: usize) -> Option<&Symbol> {
        let mut best: Option<&Symbol> = None;
        for symbol in self.symbols.values() {
            if symbol.offset == offset && symbol.size == len {
                // Prefer the shortest path when a struct and its first member coincide
                if best.map_or(true, |b| symbol.name.len() < b.name.len()) {
                    best = Some(symbol);
                }
            }
        }
        best
    }

    /// Translate an address into a data-area range.
    fn locate(&self, address: SymbolAddress, len: usize) -> TransportResult<(u32, Option<String>)> {
        match address.index_group {
            PLC_RW_DB => {
                let offset = address
                    .index_offset
                    .checked_sub(self.base)
                    .filter(|o| (*o as usize) < self.memory.len())
                    .ok_or(TransportError::InvalidIndexOffset {
                        group: address.index_group,
                        offset: address.index_offset,
                    })?;
                if offset as usize + len > self.memory.len() {
                    return Err(TransportError::InvalidSize {
                        expected: self.memory.len() - offset as usize,
                        actual: len,
                    });
                }
                let path = self.symbol_at(offset, len).map(|s| s.name.clone());
                Ok((offset, path))
            }
            RW_SYMVAL_BYHANDLE => {
                let path = self.handles.get(&address.index_offset).ok_or(
                    TransportError::InvalidIndexOffset {
                        group: address.index_group,
                        offset: address.index_offset,
                    },
                )?;
                let symbol = self.symbol(path)?;
                if len > symbol.size {
                    return Err(TransportError::InvalidSize {
                        expected: symbol.size,
                        actual: len,
                    });
                }
                Ok((symbol.offset, Some(symbol.name.clone())))
            }
            group => Err(TransportError::InvalidIndexGroup { group }),
        }
    }

    fn store(&mut self, offset: u32, data: &[u8]) -> Vec<(NotificationCallback, Vec<u8>)> {
        let start = offset as usize;
        self.memory[start..start + data.len()].copy_from_slice(data);
        self.collect_notifications()
    }

    fn collect_notifications(&mut self) -> Vec<(NotificationCallback, Vec<u8>)> {
        let memory = &self.memory;
        self.notifications
            .values_mut()
            .filter_map(|n| {
                let start = n.offset as usize;
                let current = memory.get(start..start + n.len)?;
                if current == n.last.as_slice() {
                    return None;
                }
                n.last = current.to_vec();
                Some((n.callback.clone(), n.last.clone()))
            })
            .collect()
    }
}

fn key(path: &str) -> String {
    path.trim().to_ascii_uppercase()
}

fn fire(pending: Vec<(NotificationCallback, Vec<u8>)>) {
    for (callback, data) in pending {
        callback(&data);
    }
}

/// Simulated PLC runtime.
///
/// Starts connected with an empty symbol table.
pub struct SimulatedPlc {
    port: u16,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SimulatedPlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimulatedPlc")
            .field("port", &self.port)
            .field("connected", &inner.connected)
            .field("symbols", &inner.symbols.len())
            .field("notifications", &inner.notifications.len())
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new(DEFAULT_ADS_PORT)
    }
}

impl SimulatedPlc {
    /// Create a simulated runtime answering on `port`.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            inner: Mutex::new(Inner {
                connected: true,
                base: 0,
                memory: Vec::new(),
                symbols: HashMap::new(),
                handles: HashMap::new(),
                next_handle: 1,
                notifications: HashMap::new(),
                next_notification: 1,
                scripts: HashMap::new(),
                hooks: HashMap::new(),
                faults: Faults::default(),
                version_changed: false,
                latency: Duration::ZERO,
                write_log: Vec::new(),
                reads: 0,
                connect_attempts: 0,
            }),
        }
    }

    /// Declare a zero-initialized symbol of `size` bytes.
    pub fn define_symbol(&self, path: &str, size: usize) {
        self.define(path, size, true);
    }

    /// Declare a symbol that cannot be resolved to an address but is
    /// reachable through a handle.
    pub fn define_handle_only_symbol(&self, path: &str, size: usize) {
        self.define(path, size, false);
    }

    fn define(&self, path: &str, size: usize, addressable: bool) {
        let mut inner = self.inner.lock();
        let len = inner.memory.len();
        let offset = u32::try_from(len).unwrap_or(u32::MAX);
        inner.memory.resize(len + size, 0);
        inner.symbols.insert(
            key(path),
            Symbol {
                name: path.to_string(),
                offset,
                size,
                addressable,
            },
        );
        trace!(path, offset, size, "Defined simulated symbol");
    }

    /// Declare a struct symbol and one aliasing member symbol per field.
    ///
    /// Members are laid out back to back without padding and named
    /// `path.field`.
    pub fn define_struct(&self, path: &str, fields: &[(&str, usize)]) {
        let total: usize = fields.iter().map(|(_, size)| size).sum();
        self.define_symbol(path, total);

        let mut inner = self.inner.lock();
        let mut offset = inner.symbols.get(&key(path)).map_or(0, |s| s.offset);
        for (field, size) in fields {
            let name = format!("{path}.{field}");
            inner.symbols.insert(
                key(&name),
                Symbol {
                    name,
                    offset,
                    size: *size,
                    addressable: true,
                },
            );
            offset += u32::try_from(*size).unwrap_or(0);
        }
    }

    /// Overwrite a symbol's bytes from the PLC side; fires notifications.
    ///
    /// # Errors
    ///
    /// [`TransportError::SymbolNotFound`] or [`TransportError::InvalidSize`].
    pub fn set_bytes(&self, path: &str, data: &[u8]) -> TransportResult<()> {
        let pending = {
            let mut inner = self.inner.lock();
            let symbol = inner.symbol(path)?.clone();
            if data.len() > symbol.size {
                return Err(TransportError::InvalidSize {
                    expected: symbol.size,
                    actual: data.len(),
                });
            }
            inner.store(symbol.offset, data)
        };
        fire(pending);
        Ok(())
    }

    /// Current bytes of a symbol.
    #[must_use]
    pub fn bytes(&self, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let symbol = inner.symbol(path).ok()?;
        let start = symbol.offset as usize;
        inner.memory.get(start..start + symbol.size).map(<[u8]>::to_vec)
    }

    /// Queue responses for the next reads of `path`.
    ///
    /// Each read consumes one response and stores it in memory; once the
    /// queue is empty reads see memory again.
    pub fn script_reads(&self, path: &str, responses: Vec<Vec<u8>>) {
        self.inner
            .lock()
            .scripts
            .entry(key(path))
            .or_default()
            .extend(responses);
    }

    /// React to client writes of `path` by replacing its bytes.
    pub fn on_write(&self, path: &str, hook: WriteHook) {
        self.inner.lock().hooks.insert(key(path), hook);
    }

    /// Fail the next `times` reads of `path` (any path when `None`).
    pub fn inject_read_fault(&self, path: Option<&str>, error: TransportError, times: usize) {
        if times > 0 {
            self.inner
                .lock()
                .faults
                .reads
                .push((path.map(key), error, times));
        }
    }

    /// Fail the next `times` writes of `path` (any path when `None`).
    pub fn inject_write_fault(&self, path: Option<&str>, error: TransportError, times: usize) {
        if times > 0 {
            self.inner
                .lock()
                .faults
                .writes
                .push((path.map(key), error, times));
        }
    }

    /// Fail the next health probe.
    pub fn inject_state_fault(&self, error: TransportError) {
        self.inner.lock().faults.state.push_back(error);
    }

    /// Make connection attempts fail (or succeed again with `None`).
    pub fn set_connect_error(&self, error: Option<TransportError>) {
        self.inner.lock().faults.connect = error;
    }

    /// Force the link state, e.g. to emulate a cable pull.
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().connected = connected;
    }

    /// Delay every read and write.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Emulate a program download: every symbol moves, handles become
    /// invalid, and the next health probe reports a version change.
    pub fn redeploy(&self) {
        let mut inner = self.inner.lock();
        inner.base = inner.base.wrapping_add(REDEPLOY_SHIFT);
        inner.handles.clear();
        inner.version_changed = true;
        info!(base = inner.base, "Simulated PLC program redeployed");
    }

    /// All writes so far, in order.
    #[must_use]
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.inner.lock().write_log.clone()
    }

    /// Writes so far to `path`.
    #[must_use]
    pub fn writes_to(&self, path: &str) -> Vec<Vec<u8>> {
        let wanted = key(path);
        self.inner
            .lock()
            .write_log
            .iter()
            .filter(|w| w.path.as_deref().map(key).as_deref() == Some(wanted.as_str()))
            .map(|w| w.data.clone())
            .collect()
    }

    /// Forget recorded writes.
    pub fn clear_write_log(&self) {
        self.inner.lock().write_log.clear();
    }

    /// Number of reads served (including failed ones).
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.inner.lock().reads
    }

    /// Number of connection attempts.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.inner.lock().connect_attempts
    }

    /// Active notification subscriptions.
    #[must_use]
    pub fn notification_count(&self) -> usize {
        self.inner.lock().notifications.len()
    }

    /// Outstanding symbol handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    fn latency(&self) -> Duration {
        self.inner.lock().latency
    }
}

impl AdsTransport for SimulatedPlc {
    fn port(&self) -> u16 {
        self.port
    }

    fn connect(&self) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        inner.connect_attempts += 1;
        if let Some(error) = inner.faults.connect.clone() {
            debug!(port = self.port, %error, "Simulated connect refused");
            return Err(error);
        }
        inner.connected = true;
        Ok(())
    }

    fn disconnect(&self) {
        self.inner.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn read_state(&self) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        inner.check_link()?;
        if let Some(error) = inner.faults.state.pop_front() {
            return Err(error);
        }
        if std::mem::take(&mut inner.version_changed) {
            return Err(TransportError::SymbolVersionChanged);
        }
        Ok(())
    }

    fn resolve_address(&self, path: &str) -> TransportResult<SymbolAddress> {
        let inner = self.inner.lock();
        inner.check_link()?;
        let symbol = inner.symbol(path)?;
        if !symbol.addressable {
            return Err(TransportError::SymbolNotFound {
                path: path.to_string(),
            });
        }
        Ok(SymbolAddress::new(PLC_RW_DB, inner.base + symbol.offset))
    }

    fn read(&self, address: SymbolAddress, buf: &mut [u8]) -> TransportResult<()> {
        let latency = self.latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let pending = {
            let mut inner = self.inner.lock();
            inner.reads += 1;
            inner.check_link()?;
            let (offset, path) = inner.locate(address, buf.len())?;
            let fault_key = path.as_deref().map(key);
            if let Some(error) = Faults::take(&mut inner.faults.reads, fault_key.as_deref()) {
                return Err(error);
            }

            let scripted = path
                .as_deref()
                .and_then(|p| inner.scripts.get_mut(&key(p)))
                .and_then(VecDeque::pop_front);
            let pending = match scripted {
                Some(mut response) => {
                    response.resize(buf.len(), 0);
                    inner.store(offset, &response)
                }
                None => Vec::new(),
            };

            let start = offset as usize;
            buf.copy_from_slice(&inner.memory[start..start + buf.len()]);
            pending
        };
        fire(pending);
        Ok(())
    }

    fn write(&self, address: SymbolAddress, data: &[u8]) -> TransportResult<()> {
        let latency = self.latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let pending = {
            let mut inner = self.inner.lock();
            inner.check_link()?;
            let (offset, path) = inner.locate(address, data.len())?;
            let fault_key = path.as_deref().map(key);
            if let Some(error) = Faults::take(&mut inner.faults.writes, fault_key.as_deref()) {
                return Err(error);
            }

            inner.write_log.push(WriteRecord {
                path: path.clone(),
                address,
                data: data.to_vec(),
            });
            let mut pending = inner.store(offset, data);

            let reaction = path
                .as_deref()
                .and_then(|p| inner.hooks.get(&key(p)).cloned())
                .and_then(|hook| hook(data));
            if let Some(mut reaction) = reaction {
                reaction.resize(data.len(), 0);
                pending.extend(inner.store(offset, &reaction));
            }
            pending
        };
        fire(pending);
        Ok(())
    }

    fn create_handle(&self, path: &str) -> TransportResult<u32> {
        let mut inner = self.inner.lock();
        inner.check_link()?;
        let name = inner.symbol(path)?.name.clone();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.handles.insert(handle, name);
        Ok(handle)
    }

    fn delete_handle(&self, handle: u32) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        inner.check_link()?;
        inner
            .handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(TransportError::InvalidIndexOffset {
                group: RW_SYMVAL_BYHANDLE,
                offset: handle,
            })
    }

    fn add_notification(
        &self,
        address: SymbolAddress,
        len: usize,
        cycle: Duration,
        callback: NotificationCallback,
    ) -> TransportResult<u32> {
        let (handle, initial) = {
            let mut inner = self.inner.lock();
            inner.check_link()?;
            let (offset, path) = inner.locate(address, len)?;
            let start = offset as usize;
            let initial = inner.memory[start..start + len].to_vec();

            let handle = inner.next_notification;
            inner.next_notification += 1;
            inner.notifications.insert(
                handle,
                Notification {
                    offset,
                    len,
                    last: initial.clone(),
                    callback: callback.clone(),
                },
            );
            trace!(handle, ?path, ?cycle, "Added simulated notification");
            (handle, initial)
        };
        // Devices deliver the current value right after subscribing
        callback(&initial);
        Ok(handle)
    }

    fn delete_notification(&self, handle: u32) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        inner
            .notifications
            .remove(&handle)
            .map(|_| ())
            .ok_or(TransportError::InvalidNotificationHandle { handle })
    }
}
