//! ADS transport abstractions for tag communication.
//!
//! This crate provides:
//! - [`AdsTransport`] trait, the byte-level read/write primitive the runtime
//!   is written against
//! - [`index`] module with the ADS index groups used for symbol access
//! - [`SimulatedPlc`], an in-memory PLC (feature `simulated`, on by default)

pub mod index;

#[cfg(feature = "simulated")]
pub mod simulated;

#[cfg(feature = "simulated")]
pub use simulated::{SimulatedPlc, WriteRecord};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tagcomm_common::TransportResult;

/// Numeric hardware address of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolAddress {
    /// ADS index group.
    pub index_group: u32,
    /// ADS index offset.
    pub index_offset: u32,
}

impl SymbolAddress {
    /// Address in the PLC data area.
    #[must_use]
    pub const fn new(index_group: u32, index_offset: u32) -> Self {
        Self {
            index_group,
            index_offset,
        }
    }

    /// Address that reads or writes through a symbol handle.
    #[must_use]
    pub const fn by_handle(handle: u32) -> Self {
        Self::new(index::RW_SYMVAL_BYHANDLE, handle)
    }
}

impl fmt::Display for SymbolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}:0x{:X}", self.index_group, self.index_offset)
    }
}

/// Callback invoked with the raw bytes of a changed symbol.
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Byte-stream access to one PLC runtime.
///
/// Implementations are shared between the polling thread, the controller
/// worker and the DataChannel worker, so every method takes `&self`.
pub trait AdsTransport: Send + Sync {
    /// AMS port of the PLC runtime this transport talks to.
    fn port(&self) -> u16;

    /// Open (or reopen) the connection.
    fn connect(&self) -> TransportResult<()>;

    /// Close the connection.
    fn disconnect(&self);

    /// Whether the last known connection state is up.
    fn is_connected(&self) -> bool;

    /// Lightweight health probe.
    ///
    /// Fails with [`tagcomm_common::TransportError::SymbolVersionChanged`]
    /// once after the PLC program was redeployed.
    fn read_state(&self) -> TransportResult<()>;

    /// Resolve a symbol path to its numeric address.
    fn resolve_address(&self, path: &str) -> TransportResult<SymbolAddress>;

    /// Read `buf.len()` bytes at `address`.
    fn read(&self, address: SymbolAddress, buf: &mut [u8]) -> TransportResult<()>;

    /// Write `data` at `address`.
    fn write(&self, address: SymbolAddress, data: &[u8]) -> TransportResult<()>;

    /// Acquire a symbol handle by path.
    fn create_handle(&self, path: &str) -> TransportResult<u32>;

    /// Release a symbol handle.
    fn delete_handle(&self, handle: u32) -> TransportResult<()>;

    /// Subscribe to changes of `len` bytes at `address`.
    ///
    /// Returns the notification handle.
    fn add_notification(
        &self,
        address: SymbolAddress,
        len: usize,
        cycle: Duration,
        callback: NotificationCallback,
    ) -> TransportResult<u32>;

    /// Cancel a notification.
    fn delete_notification(&self, handle: u32) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_handle_address() {
        let addr = SymbolAddress::by_handle(7);
        assert_eq!(addr.index_group, index::RW_SYMVAL_BYHANDLE);
        assert_eq!(addr.index_offset, 7);
        assert_eq!(addr.to_string(), "0xF005:0x7");
    }
}
