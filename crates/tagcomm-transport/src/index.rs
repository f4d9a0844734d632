//! ADS index groups used by symbol access.
//!
//! Only the groups this workspace touches are listed.

/// PLC memory area of TwinCAT 3 symbols (data area).
pub const PLC_RW_DB: u32 = 0x4040;

/// Get a symbol handle by name (write name, read handle).
pub const GET_SYMHANDLE_BYNAME: u32 = 0xF003;
/// Read or write a symbol value by handle; the offset is the handle.
pub const RW_SYMVAL_BYHANDLE: u32 = 0xF005;
/// Release a symbol handle (write handle).
pub const RELEASE_SYMHANDLE: u32 = 0xF006;

/// Read the symbol table version; changes on every online change.
pub const GET_SYMVERSION: u32 = 0xF008;
