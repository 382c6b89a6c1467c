//! Value trees matching type descriptors.
//!
//! A [`PvValue`] mirrors exactly one [`FieldDesc`] shape. Structures hold
//! their descriptor and an ordered field vector; access is by dotted path
//! or by flattened offset. Serialization comes in two forms: full (every
//! field, in declaration order) and masked (a bit set selects which
//! offsets are present), which is how Get/Put/Monitor payloads transmit
//! partial updates.

use std::sync::Arc;

use crate::{
    bitset::BitSet,
    errors::{ProtocolError, Result},
    types::{FieldDesc, ScalarKind, StructDesc},
    wire::{Reader, Writer},
};

/// A value of any wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    /// Boolean scalar.
    Bool(bool),
    /// Signed 8-bit scalar.
    I8(i8),
    /// Signed 16-bit scalar.
    I16(i16),
    /// Signed 32-bit scalar.
    I32(i32),
    /// Signed 64-bit scalar.
    I64(i64),
    /// Unsigned 8-bit scalar.
    U8(u8),
    /// Unsigned 16-bit scalar.
    U16(u16),
    /// Unsigned 32-bit scalar.
    U32(u32),
    /// Unsigned 64-bit scalar.
    U64(u64),
    /// Single-precision scalar.
    F32(f32),
    /// Double-precision scalar.
    F64(f64),
    /// String scalar (also backs bounded strings).
    Str(String),
    /// Boolean array.
    BoolArray(Vec<bool>),
    /// Signed 8-bit array.
    I8Array(Vec<i8>),
    /// Signed 16-bit array.
    I16Array(Vec<i16>),
    /// Signed 32-bit array.
    I32Array(Vec<i32>),
    /// Signed 64-bit array.
    I64Array(Vec<i64>),
    /// Unsigned 8-bit array.
    U8Array(Vec<u8>),
    /// Unsigned 16-bit array.
    U16Array(Vec<u16>),
    /// Unsigned 32-bit array.
    U32Array(Vec<u32>),
    /// Unsigned 64-bit array.
    U64Array(Vec<u64>),
    /// Single-precision array.
    F32Array(Vec<f32>),
    /// Double-precision array.
    F64Array(Vec<f64>),
    /// String array.
    StringArray(Vec<String>),
    /// Nested structure.
    Structure(PvStructure),
    /// Array of structures.
    StructureArray(Vec<PvStructure>),
    /// Discriminated union.
    Union(PvUnion),
    /// Array of unions.
    UnionArray(Vec<PvUnion>),
}

/// A structure value bound to its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PvStructure {
    desc: Arc<StructDesc>,
    fields: Vec<PvValue>,
}

/// A union value: an optional selected arm.
#[derive(Debug, Clone, PartialEq)]
pub struct PvUnion {
    desc: Arc<StructDesc>,
    selected: Option<(usize, Box<PvValue>)>,
}

impl PvUnion {
    /// An unselected union of the given descriptor.
    pub fn empty(desc: Arc<StructDesc>) -> Self {
        Self { desc, selected: None }
    }

    /// Select an arm by index with a value.
    pub fn select(&mut self, index: usize, value: PvValue) -> Result<()> {
        let (_, arm) = self
            .desc
            .fields
            .get(index)
            .ok_or(ProtocolError::TypeMismatch { expected: "union arm index in range" })?;
        if !value_matches(arm, &value) {
            return Err(ProtocolError::TypeMismatch { expected: "value matching union arm" });
        }
        self.selected = Some((index, Box::new(value)));
        Ok(())
    }

    /// The selected arm, if any.
    pub fn selected(&self) -> Option<(usize, &PvValue)> {
        self.selected.as_ref().map(|(i, v)| (*i, v.as_ref()))
    }

    /// The union descriptor.
    pub fn desc(&self) -> &Arc<StructDesc> {
        &self.desc
    }
}

macro_rules! scalar_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        /// Borrow the scalar if this value has the matching kind.
        pub fn $name(&self) -> Option<$ty> {
            match self {
                Self::$variant(v) => Some(*v),
                _ => None,
            }
        }
    };
}

impl PvValue {
    /// The default (zero/empty) value for a descriptor.
    pub fn default_for(desc: &FieldDesc) -> Self {
        match desc {
            FieldDesc::Scalar(kind) => Self::default_scalar(*kind),
            FieldDesc::BoundedString(_) => Self::Str(String::new()),
            FieldDesc::ScalarArray(kind) | FieldDesc::BoundedArray(kind, _) => {
                Self::default_array(*kind)
            }
            FieldDesc::Structure(inner) => Self::Structure(PvStructure::new(inner.clone())),
            FieldDesc::StructureArray(_) => Self::StructureArray(Vec::new()),
            FieldDesc::Union(inner) => Self::Union(PvUnion::empty(inner.clone())),
            FieldDesc::UnionArray(_) => Self::UnionArray(Vec::new()),
        }
    }

    fn default_scalar(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Bool => Self::Bool(false),
            ScalarKind::I8 => Self::I8(0),
            ScalarKind::I16 => Self::I16(0),
            ScalarKind::I32 => Self::I32(0),
            ScalarKind::I64 => Self::I64(0),
            ScalarKind::U8 => Self::U8(0),
            ScalarKind::U16 => Self::U16(0),
            ScalarKind::U32 => Self::U32(0),
            ScalarKind::U64 => Self::U64(0),
            ScalarKind::F32 => Self::F32(0.0),
            ScalarKind::F64 => Self::F64(0.0),
            ScalarKind::String => Self::Str(String::new()),
        }
    }

    fn default_array(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Bool => Self::BoolArray(Vec::new()),
            ScalarKind::I8 => Self::I8Array(Vec::new()),
            ScalarKind::I16 => Self::I16Array(Vec::new()),
            ScalarKind::I32 => Self::I32Array(Vec::new()),
            ScalarKind::I64 => Self::I64Array(Vec::new()),
            ScalarKind::U8 => Self::U8Array(Vec::new()),
            ScalarKind::U16 => Self::U16Array(Vec::new()),
            ScalarKind::U32 => Self::U32Array(Vec::new()),
            ScalarKind::U64 => Self::U64Array(Vec::new()),
            ScalarKind::F32 => Self::F32Array(Vec::new()),
            ScalarKind::F64 => Self::F64Array(Vec::new()),
            ScalarKind::String => Self::StringArray(Vec::new()),
        }
    }

    scalar_accessor!(as_bool, Bool, bool);
    scalar_accessor!(as_i32, I32, i32);
    scalar_accessor!(as_i64, I64, i64);
    scalar_accessor!(as_u32, U32, u32);
    scalar_accessor!(as_f64, F64, f64);

    /// Borrow the string if this is a string scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the nested structure if this is one.
    pub fn as_structure(&self) -> Option<&PvStructure> {
        match self {
            Self::Structure(s) => Some(s),
            _ => None,
        }
    }

    /// Number of elements if this is any array variant.
    pub fn array_len(&self) -> Option<usize> {
        Some(match self {
            Self::BoolArray(v) => v.len(),
            Self::I8Array(v) => v.len(),
            Self::I16Array(v) => v.len(),
            Self::I32Array(v) => v.len(),
            Self::I64Array(v) => v.len(),
            Self::U8Array(v) => v.len(),
            Self::U16Array(v) => v.len(),
            Self::U32Array(v) => v.len(),
            Self::U64Array(v) => v.len(),
            Self::F32Array(v) => v.len(),
            Self::F64Array(v) => v.len(),
            Self::StringArray(v) => v.len(),
            Self::StructureArray(v) => v.len(),
            Self::UnionArray(v) => v.len(),
            _ => return None,
        })
    }

    /// Serialize in full.
    pub fn serialize(&self, w: &mut Writer<'_>) {
        match self {
            Self::Bool(v) => w.put_bool(*v),
            Self::I8(v) => w.put_i8(*v),
            Self::I16(v) => {
                w.align(2);
                w.put_i16(*v);
            }
            Self::I32(v) => {
                w.align(4);
                w.put_i32(*v);
            }
            Self::I64(v) => {
                w.align(8);
                w.put_i64(*v);
            }
            Self::U8(v) => w.put_u8(*v),
            Self::U16(v) => {
                w.align(2);
                w.put_u16(*v);
            }
            Self::U32(v) => {
                w.align(4);
                w.put_u32(*v);
            }
            Self::U64(v) => {
                w.align(8);
                w.put_u64(*v);
            }
            Self::F32(v) => {
                w.align(4);
                w.put_f32(*v);
            }
            Self::F64(v) => {
                w.align(8);
                w.put_f64(*v);
            }
            Self::Str(v) => w.put_string(v),
            Self::BoolArray(v) => {
                w.put_size(v.len());
                for e in v {
                    w.put_bool(*e);
                }
            }
            Self::I8Array(v) => {
                w.put_size(v.len());
                for e in v {
                    w.put_i8(*e);
                }
            }
            Self::I16Array(v) => {
                w.put_size(v.len());
                w.align(2);
                for e in v {
                    w.put_i16(*e);
                }
            }
            Self::I32Array(v) => {
                w.put_size(v.len());
                w.align(4);
                for e in v {
                    w.put_i32(*e);
                }
            }
            Self::I64Array(v) => {
                w.put_size(v.len());
                w.align(8);
                for e in v {
                    w.put_i64(*e);
                }
            }
            Self::U8Array(v) => {
                w.put_size(v.len());
                w.put_bytes(v);
            }
            Self::U16Array(v) => {
                w.put_size(v.len());
                w.align(2);
                for e in v {
                    w.put_u16(*e);
                }
            }
            Self::U32Array(v) => {
                w.put_size(v.len());
                w.align(4);
                for e in v {
                    w.put_u32(*e);
                }
            }
            Self::U64Array(v) => {
                w.put_size(v.len());
                w.align(8);
                for e in v {
                    w.put_u64(*e);
                }
            }
            Self::F32Array(v) => {
                w.put_size(v.len());
                w.align(4);
                for e in v {
                    w.put_f32(*e);
                }
            }
            Self::F64Array(v) => {
                w.put_size(v.len());
                w.align(8);
                for e in v {
                    w.put_f64(*e);
                }
            }
            Self::StringArray(v) => {
                w.put_size(v.len());
                for e in v {
                    w.put_string(e);
                }
            }
            Self::Structure(s) => s.serialize(w),
            Self::StructureArray(v) => {
                w.put_size(v.len());
                for e in v {
                    e.serialize(w);
                }
            }
            Self::Union(u) => serialize_union(u, w),
            Self::UnionArray(v) => {
                w.put_size(v.len());
                for u in v {
                    serialize_union(u, w);
                }
            }
        }
    }

    /// Deserialize a value of the given descriptor.
    pub fn deserialize(desc: &FieldDesc, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match desc {
            FieldDesc::Scalar(kind) => Self::deserialize_scalar(*kind, r)?,
            FieldDesc::BoundedString(_) => Self::Str(r.get_string()?),
            FieldDesc::ScalarArray(kind) | FieldDesc::BoundedArray(kind, _) => {
                Self::deserialize_array(*kind, r)?
            }
            FieldDesc::Structure(inner) => Self::Structure(PvStructure::deserialize(inner, r)?),
            FieldDesc::StructureArray(inner) => {
                let n = r.get_size()?;
                let mut out = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    out.push(PvStructure::deserialize(inner, r)?);
                }
                Self::StructureArray(out)
            }
            FieldDesc::Union(inner) => Self::Union(deserialize_union(inner, r)?),
            FieldDesc::UnionArray(inner) => {
                let n = r.get_size()?;
                let mut out = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    out.push(deserialize_union(inner, r)?);
                }
                Self::UnionArray(out)
            }
        })
    }

    fn deserialize_scalar(kind: ScalarKind, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match kind {
            ScalarKind::Bool => Self::Bool(r.get_bool()?),
            ScalarKind::I8 => Self::I8(r.get_i8()?),
            ScalarKind::I16 => {
                r.align(2)?;
                Self::I16(r.get_i16()?)
            }
            ScalarKind::I32 => {
                r.align(4)?;
                Self::I32(r.get_i32()?)
            }
            ScalarKind::I64 => {
                r.align(8)?;
                Self::I64(r.get_i64()?)
            }
            ScalarKind::U8 => Self::U8(r.get_u8()?),
            ScalarKind::U16 => {
                r.align(2)?;
                Self::U16(r.get_u16()?)
            }
            ScalarKind::U32 => {
                r.align(4)?;
                Self::U32(r.get_u32()?)
            }
            ScalarKind::U64 => {
                r.align(8)?;
                Self::U64(r.get_u64()?)
            }
            ScalarKind::F32 => {
                r.align(4)?;
                Self::F32(r.get_f32()?)
            }
            ScalarKind::F64 => {
                r.align(8)?;
                Self::F64(r.get_f64()?)
            }
            ScalarKind::String => Self::Str(r.get_string()?),
        })
    }

    fn deserialize_array(kind: ScalarKind, r: &mut Reader<'_>) -> Result<Self> {
        let n = r.get_size()?;
        macro_rules! read_array {
            ($variant:ident, $align:expr, $read:ident) => {{
                if $align > 1 {
                    r.align($align)?;
                }
                let mut out = Vec::with_capacity(n.min(65_536));
                for _ in 0..n {
                    out.push(r.$read()?);
                }
                Self::$variant(out)
            }};
        }
        Ok(match kind {
            ScalarKind::Bool => read_array!(BoolArray, 1, get_bool),
            ScalarKind::I8 => read_array!(I8Array, 1, get_i8),
            ScalarKind::I16 => read_array!(I16Array, 2, get_i16),
            ScalarKind::I32 => read_array!(I32Array, 4, get_i32),
            ScalarKind::I64 => read_array!(I64Array, 8, get_i64),
            ScalarKind::U8 => Self::U8Array(r.get_bytes(n)?.to_vec()),
            ScalarKind::U16 => read_array!(U16Array, 2, get_u16),
            ScalarKind::U32 => read_array!(U32Array, 4, get_u32),
            ScalarKind::U64 => read_array!(U64Array, 8, get_u64),
            ScalarKind::F32 => read_array!(F32Array, 4, get_f32),
            ScalarKind::F64 => read_array!(F64Array, 8, get_f64),
            ScalarKind::String => read_array!(StringArray, 1, get_string),
        })
    }
}

fn serialize_union(u: &PvUnion, w: &mut Writer<'_>) {
    match &u.selected {
        None => w.put_opt_size(None),
        Some((index, value)) => {
            w.put_size(*index);
            value.serialize(w);
        }
    }
}

fn deserialize_union(desc: &Arc<StructDesc>, r: &mut Reader<'_>) -> Result<PvUnion> {
    match r.get_opt_size()? {
        None => Ok(PvUnion::empty(desc.clone())),
        Some(index) => {
            let (_, arm) = desc
                .fields
                .get(index)
                .ok_or(ProtocolError::InvalidEncoding("union selector out of range"))?;
            let value = PvValue::deserialize(arm, r)?;
            Ok(PvUnion { desc: desc.clone(), selected: Some((index, Box::new(value))) })
        }
    }
}

/// Whether a value matches a descriptor (shape and bounds).
pub fn value_matches(desc: &FieldDesc, value: &PvValue) -> bool {
    match (desc, value) {
        (FieldDesc::Scalar(ScalarKind::Bool), PvValue::Bool(_))
        | (FieldDesc::Scalar(ScalarKind::I8), PvValue::I8(_))
        | (FieldDesc::Scalar(ScalarKind::I16), PvValue::I16(_))
        | (FieldDesc::Scalar(ScalarKind::I32), PvValue::I32(_))
        | (FieldDesc::Scalar(ScalarKind::I64), PvValue::I64(_))
        | (FieldDesc::Scalar(ScalarKind::U8), PvValue::U8(_))
        | (FieldDesc::Scalar(ScalarKind::U16), PvValue::U16(_))
        | (FieldDesc::Scalar(ScalarKind::U32), PvValue::U32(_))
        | (FieldDesc::Scalar(ScalarKind::U64), PvValue::U64(_))
        | (FieldDesc::Scalar(ScalarKind::F32), PvValue::F32(_))
        | (FieldDesc::Scalar(ScalarKind::F64), PvValue::F64(_))
        | (FieldDesc::Scalar(ScalarKind::String), PvValue::Str(_)) => true,
        (FieldDesc::BoundedString(max), PvValue::Str(s)) => s.len() <= *max,
        (FieldDesc::ScalarArray(kind), v) => array_kind(v) == Some(*kind),
        (FieldDesc::BoundedArray(kind, max), v) => {
            array_kind(v) == Some(*kind) && v.array_len().is_some_and(|n| n <= *max)
        }
        (FieldDesc::Structure(inner), PvValue::Structure(s)) => s.desc.as_ref() == inner.as_ref(),
        (FieldDesc::StructureArray(inner), PvValue::StructureArray(v)) => {
            v.iter().all(|s| s.desc.as_ref() == inner.as_ref())
        }
        (FieldDesc::Union(inner), PvValue::Union(u)) => u.desc.as_ref() == inner.as_ref(),
        (FieldDesc::UnionArray(inner), PvValue::UnionArray(v)) => {
            v.iter().all(|u| u.desc.as_ref() == inner.as_ref())
        }
        _ => false,
    }
}

fn array_kind(value: &PvValue) -> Option<ScalarKind> {
    Some(match value {
        PvValue::BoolArray(_) => ScalarKind::Bool,
        PvValue::I8Array(_) => ScalarKind::I8,
        PvValue::I16Array(_) => ScalarKind::I16,
        PvValue::I32Array(_) => ScalarKind::I32,
        PvValue::I64Array(_) => ScalarKind::I64,
        PvValue::U8Array(_) => ScalarKind::U8,
        PvValue::U16Array(_) => ScalarKind::U16,
        PvValue::U32Array(_) => ScalarKind::U32,
        PvValue::U64Array(_) => ScalarKind::U64,
        PvValue::F32Array(_) => ScalarKind::F32,
        PvValue::F64Array(_) => ScalarKind::F64,
        PvValue::StringArray(_) => ScalarKind::String,
        _ => return None,
    })
}

impl PvStructure {
    /// A zero-initialized structure of the given descriptor.
    pub fn new(desc: Arc<StructDesc>) -> Self {
        let fields = desc.fields.iter().map(|(_, d)| PvValue::default_for(d)).collect();
        Self { desc, fields }
    }

    /// The structure's descriptor.
    pub fn desc(&self) -> &Arc<StructDesc> {
        &self.desc
    }

    /// Borrow a field by dotted path.
    pub fn get(&self, path: &str) -> Option<&PvValue> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let index = self.desc.field_index(head)?;
        let value = &self.fields[index];
        match (rest, value) {
            (None, v) => Some(v),
            (Some(rest), PvValue::Structure(s)) => s.get(rest),
            _ => None,
        }
    }

    /// Mutably borrow a field by dotted path.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut PvValue> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let index = self.desc.field_index(head)?;
        let value = &mut self.fields[index];
        match (rest, value) {
            (None, v) => Some(v),
            (Some(rest), PvValue::Structure(s)) => s.get_mut(rest),
            _ => None,
        }
    }

    /// Replace a field by dotted path, checking the value shape against
    /// the field's descriptor.
    pub fn set(&mut self, path: &str, value: PvValue) -> Result<()> {
        let desc = self
            .desc
            .descriptor_of(path)
            .ok_or(ProtocolError::TypeMismatch { expected: "existing field path" })?
            .clone();
        if !value_matches(&desc, &value) {
            return Err(ProtocolError::TypeMismatch { expected: "value matching field type" });
        }
        let slot = self
            .get_mut(path)
            .ok_or(ProtocolError::TypeMismatch { expected: "existing field path" })?;
        *slot = value;
        Ok(())
    }

    /// Borrow the field at a flattened offset (offset 0 is not a field).
    pub fn value_at_offset(&self, offset: usize) -> Option<&PvValue> {
        self.walk_offset(0, offset)
    }

    /// Mutably borrow the field at a flattened offset.
    pub fn value_at_offset_mut(&mut self, offset: usize) -> Option<&mut PvValue> {
        self.walk_offset_mut(0, offset)
    }

    fn walk_offset_mut(&mut self, base: usize, target: usize) -> Option<&mut PvValue> {
        let mut off = base + 1;
        let spans: Vec<usize> = self.desc.fields.iter().map(|(_, d)| d.slot_count()).collect();
        for (i, span) in spans.into_iter().enumerate() {
            if target == off {
                return Some(&mut self.fields[i]);
            }
            if target < off + span {
                if let PvValue::Structure(s) = &mut self.fields[i] {
                    return s.walk_offset_mut(off, target);
                }
                return None;
            }
            off += span;
        }
        None
    }

    fn walk_offset(&self, base: usize, target: usize) -> Option<&PvValue> {
        let mut off = base + 1;
        for (i, (_, desc)) in self.desc.fields.iter().enumerate() {
            let span = desc.slot_count();
            if target == off {
                return Some(&self.fields[i]);
            }
            if target < off + span {
                if let PvValue::Structure(s) = &self.fields[i] {
                    return s.walk_offset(off, target);
                }
                return None;
            }
            off += span;
        }
        None
    }

    /// Serialize every field in declaration order.
    pub fn serialize(&self, w: &mut Writer<'_>) {
        for field in &self.fields {
            field.serialize(w);
        }
    }

    /// Deserialize a full structure of the given descriptor.
    pub fn deserialize(desc: &Arc<StructDesc>, r: &mut Reader<'_>) -> Result<Self> {
        let mut fields = Vec::with_capacity(desc.fields.len());
        for (_, fdesc) in &desc.fields {
            fields.push(PvValue::deserialize(fdesc, r)?);
        }
        Ok(Self { desc: desc.clone(), fields })
    }

    /// Serialize only the fields selected by `mask`. A set bit on a
    /// structure offset serializes that whole substructure; bit 0
    /// serializes everything.
    pub fn serialize_masked(&self, mask: &BitSet, w: &mut Writer<'_>) {
        if mask.get(0) {
            self.serialize(w);
            return;
        }
        self.serialize_masked_fields(0, mask, w);
    }

    fn serialize_masked_fields(&self, base: usize, mask: &BitSet, w: &mut Writer<'_>) {
        let mut off = base + 1;
        for (i, (_, desc)) in self.desc.fields.iter().enumerate() {
            let value = &self.fields[i];
            if let (FieldDesc::Structure(_), PvValue::Structure(s)) = (desc, value) {
                if mask.get(off) {
                    s.serialize(w);
                } else {
                    s.serialize_masked_fields(off, mask, w);
                }
            } else if mask.get(off) {
                value.serialize(w);
            }
            off += desc.slot_count();
        }
    }

    /// Deserialize fields selected by `mask` into this structure in
    /// place, mirroring [`PvStructure::serialize_masked`].
    pub fn deserialize_masked(&mut self, mask: &BitSet, r: &mut Reader<'_>) -> Result<()> {
        if mask.get(0) {
            *self = Self::deserialize(&self.desc.clone(), r)?;
            return Ok(());
        }
        self.deserialize_masked_fields(0, mask, r)
    }

    fn deserialize_masked_fields(
        &mut self,
        base: usize,
        mask: &BitSet,
        r: &mut Reader<'_>,
    ) -> Result<()> {
        let mut off = base + 1;
        let descs: Vec<FieldDesc> = self.desc.fields.iter().map(|(_, d)| d.clone()).collect();
        for (i, desc) in descs.iter().enumerate() {
            if let (FieldDesc::Structure(inner), PvValue::Structure(s)) =
                (desc, &mut self.fields[i])
            {
                if mask.get(off) {
                    *s = PvStructure::deserialize(inner, r)?;
                } else {
                    s.deserialize_masked_fields(off, mask, r)?;
                }
            } else if mask.get(off) {
                self.fields[i] = PvValue::deserialize(desc, r)?;
            }
            off += desc.slot_count();
        }
        Ok(())
    }
}

macro_rules! from_scalar {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for PvValue {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        }
    };
}

from_scalar!(bool, Bool);
from_scalar!(i8, I8);
from_scalar!(i16, I16);
from_scalar!(i32, I32);
from_scalar!(i64, I64);
from_scalar!(u8, U8);
from_scalar!(u16, U16);
from_scalar!(u32, U32);
from_scalar!(u64, U64);
from_scalar!(f32, F32);
from_scalar!(f64, F64);
from_scalar!(Vec<i32>, I32Array);
from_scalar!(Vec<f64>, F64Array);
from_scalar!(Vec<String>, StringArray);

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::ByteOrder;

    use super::*;

    fn sample_desc() -> Arc<StructDesc> {
        StructDesc::builder("test_t")
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

    fn sample_value() -> PvStructure {
        let mut s = PvStructure::new(sample_desc());
        s.set("value", 42i32.into()).unwrap();
        s.set("alarm.severity", 2i32.into()).unwrap();
        s.set("alarm.message", "HIHI".into()).unwrap();
        s.set("data", PvValue::F64Array(vec![1.0, 2.5])).unwrap();
        s
    }

    #[test]
    fn path_access_and_offsets() {
        let s = sample_value();
        assert_eq!(s.get("value").and_then(PvValue::as_i32), Some(42));
        assert_eq!(s.get("alarm.message").and_then(|v| v.as_str()), Some("HIHI"));
        assert_eq!(s.value_at_offset(1).and_then(PvValue::as_i32), Some(42));
        assert_eq!(s.value_at_offset(3).and_then(PvValue::as_i32), Some(2));
        assert!(s.value_at_offset(2).is_some_and(|v| v.as_structure().is_some()));
        assert!(s.value_at_offset(6).is_none());
    }

    #[test]
    fn set_rejects_wrong_shape() {
        let mut s = sample_value();
        assert!(s.set("value", "nope".into()).is_err());
        assert!(s.set("missing", 1i32.into()).is_err());
    }

    #[test]
    fn full_round_trip_both_orders() {
        let s = sample_value();
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let mut buf = Vec::new();
            let mut w = Writer::new(&mut buf, order);
            s.serialize(&mut w);
            let mut r = Reader::new(&buf, order);
            let back = PvStructure::deserialize(s.desc(), &mut r).unwrap();
            assert_eq!(back, s);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn masked_round_trip_updates_only_selected() {
        let src = sample_value();
        let mask = BitSet::from_bits([1, 4]); // value + alarm.message

        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Big);
        src.serialize_masked(&mask, &mut w);

        let mut dst = PvStructure::new(sample_desc());
        let mut r = Reader::new(&buf, ByteOrder::Big);
        dst.deserialize_masked(&mask, &mut r).unwrap();

        assert_eq!(dst.get("value").and_then(PvValue::as_i32), Some(42));
        assert_eq!(dst.get("alarm.message").and_then(|v| v.as_str()), Some("HIHI"));
        // untouched fields keep defaults
        assert_eq!(dst.get("alarm.severity").and_then(PvValue::as_i32), Some(0));
        assert_eq!(dst.get("data").unwrap(), &PvValue::F64Array(Vec::new()));
    }

    #[test]
    fn masked_bit_zero_is_everything() {
        let src = sample_value();
        let mask = BitSet::from_bits([0]);

        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Big);
        src.serialize_masked(&mask, &mut w);

        let mut dst = PvStructure::new(sample_desc());
        let mut r = Reader::new(&buf, ByteOrder::Big);
        dst.deserialize_masked(&mask, &mut r).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn substructure_bit_serializes_whole_subtree() {
        let src = sample_value();
        let mask = BitSet::from_bits([2]); // whole alarm struct

        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Big);
        src.serialize_masked(&mask, &mut w);

        let mut dst = PvStructure::new(sample_desc());
        let mut r = Reader::new(&buf, ByteOrder::Big);
        dst.deserialize_masked(&mask, &mut r).unwrap();
        assert_eq!(dst.get("alarm"), src.get("alarm"));
        assert_eq!(dst.get("value").and_then(PvValue::as_i32), Some(0));
    }

    #[test]
    fn union_round_trip() {
        let udesc = StructDesc::builder("choice_t")
            .field("ival", FieldDesc::scalar(ScalarKind::I32))
            .field("sval", FieldDesc::scalar(ScalarKind::String))
            .build();
        let mut u = PvUnion::empty(udesc.clone());
        u.select(1, "hello".into()).unwrap();

        let value = PvValue::Union(u);
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, ByteOrder::Big);
        value.serialize(&mut w);

        let mut r = Reader::new(&buf, ByteOrder::Big);
        let back = PvValue::deserialize(&FieldDesc::Union(udesc), &mut r).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn union_rejects_mismatched_arm() {
        let udesc = StructDesc::builder("choice_t")
            .field("ival", FieldDesc::scalar(ScalarKind::I32))
            .build();
        let mut u = PvUnion::empty(udesc);
        assert!(u.select(0, "wrong".into()).is_err());
        assert!(u.select(5, 1i32.into()).is_err());
    }
}
