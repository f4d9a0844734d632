//! Fuzz target for the binary decoder.
//!
//! Picks a type from a fixed set, or takes an arbitrary type name, and
//! decodes arbitrary bytes with an arbitrary bit size.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tagcomm_codec::{TypeName, ValueCodec};

const TYPES: &[&str] = &[
    "BOOL",
    "INT",
    "UDINT",
    "LREAL",
    "STRING(16)",
    "E_State",
    "ARRAY [0..3] OF DINT",
    "ARRAY [1..2] OF STRING(4)",
    "ST_Record",
];

#[derive(Debug, Arbitrary)]
struct Input {
    type_index: u8,
    free_form: Option<String>,
    bit_size: i64,
    data: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let codec = ValueCodec::new();
    let name = input
        .free_form
        .as_deref()
        .unwrap_or(TYPES[usize::from(input.type_index) % TYPES.len()]);
    let Ok(ty) = TypeName::parse(name) else {
        return;
    };
    let _ = codec.decode(&ty, input.bit_size, &input.data);
});
