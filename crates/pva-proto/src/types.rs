//! Type descriptors for the self-describing data model.
//!
//! Every transmitted value is described by a [`FieldDesc`]. Structures
//! flatten depth-first into an offset space: offset 0 is the structure
//! itself, each scalar-like field takes one slot, and each nested
//! structure takes one slot plus its own flattened fields. Unions and
//! structure arrays occupy a single slot. Change and overrun masks are
//! bit sets over this space.

use std::sync::Arc;

use crate::errors::{ProtocolError, Result};
use crate::wire::{Reader, Writer};

/// Scalar element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScalarKind {
    /// Boolean.
    Bool = 0,
    /// Signed 8-bit integer.
    I8 = 1,
    /// Signed 16-bit integer.
    I16 = 2,
    /// Signed 32-bit integer.
    I32 = 3,
    /// Signed 64-bit integer.
    I64 = 4,
    /// Unsigned 8-bit integer.
    U8 = 5,
    /// Unsigned 16-bit integer.
    U16 = 6,
    /// Unsigned 32-bit integer.
    U32 = 7,
    /// Unsigned 64-bit integer.
    U64 = 8,
    /// IEEE-754 single.
    F32 = 9,
    /// IEEE-754 double.
    F64 = 10,
    /// UTF-8 string.
    String = 11,
}

impl ScalarKind {
    /// All kinds, in type-code order.
    pub const ALL: [Self; 12] = [
        Self::Bool,
        Self::I8,
        Self::I16,
        Self::I32,
        Self::I64,
        Self::U8,
        Self::U16,
        Self::U32,
        Self::U64,
        Self::F32,
        Self::F64,
        Self::String,
    ];

    /// Decode a kind nibble from a type code.
    pub fn from_u8(v: u8) -> Result<Self> {
        Self::ALL
            .get(usize::from(v))
            .copied()
            .ok_or(ProtocolError::InvalidTypeCode(v))
    }

    /// Natural wire alignment of this kind in bytes.
    pub fn alignment(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 | Self::String => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

// Full-encoding type code tags. Anything below the 0xFD introspection
// selector range is available; scalars and scalar arrays pack the kind
// into the low nibble.
const TC_SCALAR_BASE: u8 = 0x00;
const TC_SCALAR_ARRAY_BASE: u8 = 0x10;
const TC_STRUCTURE: u8 = 0x20;
const TC_UNION: u8 = 0x21;
const TC_STRUCTURE_ARRAY: u8 = 0x22;
const TC_UNION_ARRAY: u8 = 0x23;
const TC_BOUNDED_STRING: u8 = 0x24;
const TC_BOUNDED_ARRAY: u8 = 0x25;

/// A named, ordered aggregate descriptor, used for both structures and
/// unions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructDesc {
    /// Schema identity string, e.g. `epics:nt/NTScalar:1.0`. May be empty.
    pub type_id: String,
    /// Ordered named fields (structure) or arms (union).
    pub fields: Vec<(String, FieldDesc)>,
}

impl StructDesc {
    /// Start building a descriptor with the given type id.
    pub fn builder(type_id: impl Into<String>) -> StructDescBuilder {
        StructDescBuilder { type_id: type_id.into(), fields: Vec::new() }
    }

    /// Descriptor of a named field, if present.
    pub fn field(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// Index of a named field.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    /// Total number of slots in the depth-first flattening, including the
    /// structure itself at offset 0.
    pub fn slot_count(&self) -> usize {
        1 + self.fields.iter().map(|(_, d)| d.slot_count()).sum::<usize>()
    }

    /// Offset of a dotted path relative to this structure (offset 0 = the
    /// structure itself; an empty path resolves to 0).
    pub fn offset_of(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            return Some(0);
        }
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let mut offset = 1;
        for (name, desc) in &self.fields {
            if name == head {
                return match (rest, desc) {
                    (None, _) => Some(offset),
                    (Some(rest), FieldDesc::Structure(inner)) => {
                        inner.offset_of(rest).map(|o| offset + o)
                    }
                    _ => None,
                };
            }
            offset += desc.slot_count();
        }
        None
    }

    /// Descriptor of a dotted path relative to this structure.
    pub fn descriptor_of(&self, path: &str) -> Option<&FieldDesc> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let desc = self.field(head)?;
        match (rest, desc) {
            (None, d) => Some(d),
            (Some(rest), FieldDesc::Structure(inner)) => inner.descriptor_of(rest),
            _ => None,
        }
    }
}

/// Builder for [`StructDesc`].
pub struct StructDescBuilder {
    type_id: String,
    fields: Vec<(String, FieldDesc)>,
}

impl StructDescBuilder {
    /// Append a field.
    pub fn field(mut self, name: impl Into<String>, desc: FieldDesc) -> Self {
        self.fields.push((name.into(), desc));
        self
    }

    /// Finish, producing a shared descriptor.
    pub fn build(self) -> Arc<StructDesc> {
        Arc::new(StructDesc { type_id: self.type_id, fields: self.fields })
    }
}

/// A type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldDesc {
    /// A single scalar.
    Scalar(ScalarKind),
    /// A string with a maximum byte length.
    BoundedString(usize),
    /// A variable-length array of scalars.
    ScalarArray(ScalarKind),
    /// A scalar array with a maximum element count.
    BoundedArray(ScalarKind, usize),
    /// A nested structure.
    Structure(Arc<StructDesc>),
    /// An array of structures sharing one descriptor.
    StructureArray(Arc<StructDesc>),
    /// A discriminated union.
    Union(Arc<StructDesc>),
    /// An array of unions sharing one descriptor.
    UnionArray(Arc<StructDesc>),
}

impl FieldDesc {
    /// Shorthand scalar constructor.
    pub fn scalar(kind: ScalarKind) -> Self {
        Self::Scalar(kind)
    }

    /// Shorthand scalar-array constructor.
    pub fn scalar_array(kind: ScalarKind) -> Self {
        Self::ScalarArray(kind)
    }

    /// Slots this field occupies in the flattened offset space.
    pub fn slot_count(&self) -> usize {
        match self {
            Self::Structure(inner) => inner.slot_count(),
            _ => 1,
        }
    }

    /// Serialize the full (self-contained) encoding.
    pub fn encode_full(&self, w: &mut Writer<'_>) {
        match self {
            Self::Scalar(kind) => w.put_u8(TC_SCALAR_BASE | *kind as u8),
            Self::ScalarArray(kind) => w.put_u8(TC_SCALAR_ARRAY_BASE | *kind as u8),
            Self::BoundedString(max) => {
                w.put_u8(TC_BOUNDED_STRING);
                w.put_size(*max);
            }
            Self::BoundedArray(kind, max) => {
                w.put_u8(TC_BOUNDED_ARRAY);
                w.put_u8(*kind as u8);
                w.put_size(*max);
            }
            Self::Structure(inner) => {
                w.put_u8(TC_STRUCTURE);
                encode_aggregate(inner, w);
            }
            Self::StructureArray(inner) => {
                w.put_u8(TC_STRUCTURE_ARRAY);
                encode_aggregate(inner, w);
            }
            Self::Union(inner) => {
                w.put_u8(TC_UNION);
                encode_aggregate(inner, w);
            }
            Self::UnionArray(inner) => {
                w.put_u8(TC_UNION_ARRAY);
                encode_aggregate(inner, w);
            }
        }
    }

    /// Deserialize a full encoding, starting from its leading type code.
    pub fn decode_full(r: &mut Reader<'_>) -> Result<Self> {
        let code = r.get_u8()?;
        Self::decode_full_after_code(code, r)
    }

    /// Deserialize a full encoding whose type code byte was already
    /// consumed (the introspection selector dispatch needs this split).
    pub fn decode_full_after_code(code: u8, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match code {
            TC_STRUCTURE => Self::Structure(decode_aggregate(r)?),
            TC_UNION => Self::Union(decode_aggregate(r)?),
            TC_STRUCTURE_ARRAY => Self::StructureArray(decode_aggregate(r)?),
            TC_UNION_ARRAY => Self::UnionArray(decode_aggregate(r)?),
            TC_BOUNDED_STRING => Self::BoundedString(r.get_size()?),
            TC_BOUNDED_ARRAY => {
                let kind = ScalarKind::from_u8(r.get_u8()?)?;
                Self::BoundedArray(kind, r.get_size()?)
            }
            code if code & 0xF0 == TC_SCALAR_BASE => Self::Scalar(ScalarKind::from_u8(code)?),
            code if code & 0xF0 == TC_SCALAR_ARRAY_BASE => {
                Self::ScalarArray(ScalarKind::from_u8(code & 0x0F)?)
            }
            code => return Err(ProtocolError::InvalidTypeCode(code)),
        })
    }
}

fn encode_aggregate(desc: &StructDesc, w: &mut Writer<'_>) {
    w.put_string(&desc.type_id);
    w.put_size(desc.fields.len());
    for (name, field) in &desc.fields {
        w.put_string(name);
        field.encode_full(w);
    }
}

fn decode_aggregate(r: &mut Reader<'_>) -> Result<Arc<StructDesc>> {
    let type_id = r.get_string()?;
    let count = r.get_size()?;
    let mut fields = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let name = r.get_string()?;
        fields.push((name, FieldDesc::decode_full(r)?));
    }
    Ok(Arc::new(StructDesc { type_id, fields }))
}

#[cfg(test)]
mod tests {
    use crate::wire::ByteOrder;

    use super::*;

    fn nt_scalar() -> Arc<StructDesc> {
        StructDesc::builder("epics:nt/NTScalar:1.0")
            .field("value", FieldDesc::scalar(ScalarKind::I32))
            .field(
                "alarm",
                FieldDesc::Structure(
                    StructDesc::builder("alarm_t")
                        .field("severity", FieldDesc::scalar(ScalarKind::I32))
                        .field("message", FieldDesc::scalar(ScalarKind::String))
                        .build(),
                ),
            )
            .field("data", FieldDesc::scalar_array(ScalarKind::F64))
            .build()
    }

    #[test]
    fn slot_counts_flatten_depth_first() {
        let desc = nt_scalar();
        // 0=self, 1=value, 2=alarm, 3=severity, 4=message, 5=data
        assert_eq!(desc.slot_count(), 6);
        assert_eq!(desc.offset_of(""), Some(0));
        assert_eq!(desc.offset_of("value"), Some(1));
        assert_eq!(desc.offset_of("alarm"), Some(2));
        assert_eq!(desc.offset_of("alarm.severity"), Some(3));
        assert_eq!(desc.offset_of("alarm.message"), Some(4));
        assert_eq!(desc.offset_of("data"), Some(5));
        assert_eq!(desc.offset_of("missing"), None);
        assert_eq!(desc.offset_of("value.nested"), None);
    }

    #[test]
    fn descriptor_lookup_by_path() {
        let desc = nt_scalar();
        assert_eq!(
            desc.descriptor_of("alarm.severity"),
            Some(&FieldDesc::scalar(ScalarKind::I32))
        );
        assert!(matches!(desc.descriptor_of("alarm"), Some(FieldDesc::Structure(_))));
        assert_eq!(desc.descriptor_of("nope"), None);
    }

    #[test]
    fn full_encoding_round_trip() {
        let desc = FieldDesc::Structure(nt_scalar());
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let mut buf = Vec::new();
            let mut w = Writer::new(&mut buf, order);
            desc.encode_full(&mut w);
            let mut r = Reader::new(&buf, order);
            assert_eq!(FieldDesc::decode_full(&mut r).unwrap(), desc);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn bounded_variants_round_trip() {
        for desc in [
            FieldDesc::BoundedString(40),
            FieldDesc::BoundedArray(ScalarKind::U16, 1024),
            FieldDesc::ScalarArray(ScalarKind::String),
        ] {
            let mut buf = Vec::new();
            let mut w = Writer::new(&mut buf, ByteOrder::Big);
            desc.encode_full(&mut w);
            let mut r = Reader::new(&buf, ByteOrder::Big);
            assert_eq!(FieldDesc::decode_full(&mut r).unwrap(), desc);
        }
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let mut r = Reader::new(&[0x77], ByteOrder::Big);
        assert!(matches!(
            FieldDesc::decode_full(&mut r),
            Err(ProtocolError::InvalidTypeCode(0x77))
        ));
    }
}
