//! Fuzz the pvRequest parser: arbitrary text parses or fails cleanly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pva_proto::PvRequest;

fuzz_target!(|text: &str| {
    if let Ok(request) = PvRequest::parse(text) {
        // the canonical form must re-parse to the same selection
        if let Ok(again) = PvRequest::parse(&request.to_text()) {
            assert_eq!(again.fields, request.fields);
        }
    }
});
