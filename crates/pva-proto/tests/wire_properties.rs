//! Property tests for the wire layer: every codec must round-trip, and a
//! fresh introspection cache must reproduce descriptors structurally.

use std::sync::Arc;

use proptest::prelude::*;
use pva_proto::{
    BitSet, ByteOrder, FieldDesc, Header, IntrospectionRegistry, Reader, Reassembler, Role,
    ScalarKind, Segmenter, Status, StructDesc, Writer,
    header::HEADER_SIZE,
};

fn arb_order() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::Little), Just(ByteOrder::Big)]
}

fn arb_scalar_kind() -> impl Strategy<Value = ScalarKind> {
    prop::sample::select(ScalarKind::ALL.to_vec())
}

fn arb_field_name() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-zA-Z0-9_]{0,11}").expect("valid regex")
}

fn arb_field_desc() -> impl Strategy<Value = FieldDesc> {
    let leaf = prop_oneof![
        arb_scalar_kind().prop_map(FieldDesc::Scalar),
        arb_scalar_kind().prop_map(FieldDesc::ScalarArray),
        (1usize..512).prop_map(FieldDesc::BoundedString),
        (arb_scalar_kind(), 1usize..512).prop_map(|(k, n)| FieldDesc::BoundedArray(k, n)),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        (
            arb_field_name(),
            prop::collection::vec((arb_field_name(), inner), 1..4),
            0usize..4,
        )
            .prop_map(|(type_id, fields, variant)| {
                let desc = Arc::new(StructDesc { type_id, fields });
                match variant {
                    0 => FieldDesc::Structure(desc),
                    1 => FieldDesc::StructureArray(desc),
                    2 => FieldDesc::Union(desc),
                    _ => FieldDesc::UnionArray(desc),
                }
            })
    })
}

proptest! {
    #[test]
    fn header_round_trip(
        command in 0u8..=22,
        payload_size in 0u32..=0x00FF_FFFF,
        order in arb_order(),
        server in any::<bool>(),
    ) {
        let role = if server { Role::Server } else { Role::Client };
        let header = Header::data(command, role, order, payload_size);
        let mut buf = Vec::new();
        header.encode(&mut buf);
        prop_assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn size_encoding_round_trip(n in 0usize..=1_000_000, order in arb_order()) {
        let mut buf = Vec::new();
        Writer::new(&mut buf, order).put_size(n);
        prop_assert_eq!(Reader::new(&buf, order).get_size().unwrap(), n);
    }

    #[test]
    fn string_round_trip(s in "\\PC{0,300}", order in arb_order()) {
        let mut buf = Vec::new();
        Writer::new(&mut buf, order).put_string(&s);
        prop_assert_eq!(Reader::new(&buf, order).get_string().unwrap(), s);
    }

    #[test]
    fn bitset_round_trip(bits in prop::collection::vec(0usize..500, 0..40), order in arb_order()) {
        let set = BitSet::from_bits(bits);
        let mut buf = Vec::new();
        set.encode(&mut Writer::new(&mut buf, order));
        prop_assert_eq!(BitSet::decode(&mut Reader::new(&buf, order)).unwrap(), set);
    }

    #[test]
    fn status_round_trip(kind in 0u8..4, message in "\\PC{0,80}") {
        let status = match kind {
            0 => Status::ok(),
            1 => Status::warning(message),
            2 => Status::error(message),
            _ => Status::fatal(message),
        };
        let mut buf = Vec::new();
        status.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = Status::decode(&mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        prop_assert_eq!(back, status);
    }

    /// Encoding a descriptor then decoding on a fresh cache yields a
    /// structurally equal descriptor.
    #[test]
    fn introspection_round_trip(desc in arb_field_desc(), order in arb_order()) {
        let mut tx = IntrospectionRegistry::new();
        let mut rx = IntrospectionRegistry::new();
        let mut buf = Vec::new();
        tx.encode(&desc, &mut Writer::new(&mut buf, order));
        let back = rx.decode(&mut Reader::new(&buf, order)).unwrap();
        prop_assert_eq!(back, Some(desc));
    }

    /// The short id form produced by a second send decodes to the same
    /// descriptor.
    #[test]
    fn introspection_cached_form_agrees(desc in arb_field_desc()) {
        let mut tx = IntrospectionRegistry::new();
        let mut rx = IntrospectionRegistry::new();

        let mut first = Vec::new();
        tx.encode(&desc, &mut Writer::new(&mut first, ByteOrder::Big));
        let mut second = Vec::new();
        tx.encode(&desc, &mut Writer::new(&mut second, ByteOrder::Big));
        prop_assert_eq!(second.len(), 3); // selector + u16 id

        let d1 = rx.decode(&mut Reader::new(&first, ByteOrder::Big)).unwrap();
        let d2 = rx.decode(&mut Reader::new(&second, ByteOrder::Big)).unwrap();
        prop_assert_eq!(d1.as_ref(), Some(&desc));
        prop_assert_eq!(d2.as_ref(), Some(&desc));
    }

    /// Any payload split into k segments reassembles byte-identical.
    #[test]
    fn segmentation_round_trip(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        budget in 1usize..1024,
        order in arb_order(),
        command in 0u8..=22,
    ) {
        let seg = Segmenter::new(budget);
        let mut wire = Vec::new();
        seg.write_message(command, Role::Server, order, &payload, &mut wire);

        let mut re = Reassembler::new();
        let mut rest = wire.as_slice();
        let mut output = None;
        while let Some((header, total)) = Header::peek_frame(rest).unwrap() {
            if let Some((h, body)) = re.push(header, &rest[HEADER_SIZE..total]).unwrap() {
                prop_assert!(output.is_none());
                output = Some((h, body));
            }
            rest = &rest[total..];
        }
        prop_assert!(rest.is_empty());
        let (header, body) = output.unwrap();
        prop_assert_eq!(header.command, command);
        prop_assert_eq!(body, payload);
    }
}
