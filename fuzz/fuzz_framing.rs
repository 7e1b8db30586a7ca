//! Fuzz target for record framing.
//!
//! Run with: cargo +nightly fuzz run fuzz_framing
//!
//! The first two bytes pick the delimiter and the record limit; the rest is
//! split as a datagram and fed to a stream assembler in uneven chunks.

#![no_main]

use eventgate_core::framing::{Delimited, FrameSplitter, RecordAssembler};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let [delimiter, limit, rest @ ..] = data else {
        return;
    };
    let max_len = usize::from(*limit).max(1);

    for segment in Delimited::new(*delimiter).split(rest) {
        assert!(!segment.is_empty());
        assert!(!segment.contains(delimiter));
    }

    let mut assembler = RecordAssembler::new(*delimiter, max_len);
    let mut records = Vec::new();
    for chunk in rest.chunks(usize::from(*limit % 7) + 1) {
        assembler.push(chunk, &mut records);
        assert!(assembler.pending() <= max_len);
    }
    records.extend(assembler.finish());
    for record in &records {
        assert!(record.payload.len() <= max_len);
    }
});
