//! Fuzz the frame parser and segment reassembly.
//!
//! Invariants: header parsing never panics, never over-reads, and a
//! stream of arbitrary bytes either yields frames or a typed error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pva_proto::{HEADER_SIZE, Header, Reassembler};

fuzz_target!(|data: &[u8]| {
    let mut reassembler = Reassembler::new();
    let mut rest = data;
    loop {
        match Header::peek_frame(rest) {
            Ok(Some((header, total))) => {
                let payload = &rest[HEADER_SIZE..total];
                // reassembly errors are fine; panics are not
                let _ = reassembler.push(header, payload);
                rest = &rest[total..];
            }
            Ok(None) | Err(_) => break,
        }
    }
});
