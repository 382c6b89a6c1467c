//! Fuzz the introspection decoder: arbitrary bytes must produce a
//! descriptor or a typed error, never a panic or unbounded allocation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pva_proto::{ByteOrder, IntrospectionRegistry, Reader};

fuzz_target!(|data: &[u8]| {
    for order in [ByteOrder::Little, ByteOrder::Big] {
        let mut registry = IntrospectionRegistry::new();
        let mut reader = Reader::new(data, order);
        while reader.remaining() > 0 {
            if registry.decode(&mut reader).is_err() {
                break;
            }
        }
    }
});
