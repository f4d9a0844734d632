//! Fuzz target for the type-name grammar.
//!
//! # Running
//!
//! ```bash
//! cd crates/tagcomm-codec
//! cargo +nightly fuzz run fuzz_type_name
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        if source.len() > 4096 {
            return;
        }

        // Parsing and sizing must never panic, whatever the input
        if let Ok(ty) = tagcomm_codec::TypeName::parse(source) {
            let _ = tagcomm_codec::resolve_bit_size(&ty, None);
        }
    }
});
