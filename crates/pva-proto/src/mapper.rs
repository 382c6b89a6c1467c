//! Projection of a source structure onto a requested substructure.
//!
//! Given a channel's full descriptor and a pvRequest, the mapper builds
//! the projected descriptor, a *requested mask* over source offsets, and
//! offset translation in both directions. Change masks posted against the
//! source are translated into the projected offset space when copying,
//! preserving the meaning of "this subtree changed".

use std::sync::Arc;

use crate::{
    bitset::BitSet,
    errors::{ProtocolError, Result},
    request::PvRequest,
    types::{FieldDesc, StructDesc},
    value::{PvStructure, PvValue},
};

/// Selection tree node built from dotted request paths.
#[derive(Debug, Default)]
struct SelNode {
    /// Select this field with its entire subtree.
    full: bool,
    children: Vec<(String, SelNode)>,
}

impl SelNode {
    fn child_mut(&mut self, name: &str) -> &mut SelNode {
        if let Some(i) = self.children.iter().position(|(n, _)| n == name) {
            return &mut self.children[i].1;
        }
        self.children.push((name.to_owned(), SelNode::default()));
        let last = self.children.len() - 1;
        &mut self.children[last].1
    }

    fn child(&self, name: &str) -> Option<&SelNode> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }
}

/// Computed source → requested projection.
#[derive(Debug)]
pub struct Mapper {
    source: Arc<StructDesc>,
    requested: Arc<StructDesc>,
    requested_mask: BitSet,
    /// `(source offset, requested offset)` for every projected slot, in
    /// ascending source order.
    forward: Vec<(usize, usize)>,
    /// Parent offset of every source offset (offset 0 has none).
    parents: Vec<Option<usize>>,
    /// Parent offset of every requested offset.
    req_parents: Vec<Option<usize>>,
    warnings: Vec<String>,
}

impl Mapper {
    /// Compute the projection of `source` selected by `request`.
    ///
    /// Unknown fields produce warnings; a request that names fields but
    /// matches none of them is an error.
    pub fn compute(source: &Arc<StructDesc>, request: &PvRequest) -> Result<Self> {
        let mut parents = vec![None; source.slot_count()];
        build_parents(source, 0, &mut parents);

        let mut warnings = request.warnings.clone();

        if request.selects_all() {
            let count = source.slot_count();
            return Ok(Self {
                source: source.clone(),
                requested: source.clone(),
                requested_mask: BitSet::all(count),
                forward: (0..count).map(|o| (o, o)).collect(),
                req_parents: parents.clone(),
                parents,
                warnings,
            });
        }

        let mut root = SelNode::default();
        for path in &request.fields {
            let mut node = &mut root;
            for part in path.split('.') {
                node = node.child_mut(part);
            }
            node.full = true;
        }

        let mut mask = BitSet::new();
        mask.set(0);
        let mut forward = vec![(0usize, 0usize)];
        let mut fields = Vec::new();
        project(source, &root, 0, 0, &mut fields, &mut forward, &mut mask, &mut warnings, "");

        if fields.is_empty() {
            return Err(ProtocolError::InvalidRequest(
                "no requested field exists in the source structure".into(),
            ));
        }

        let requested = Arc::new(StructDesc { type_id: source.type_id.clone(), fields });
        let mut req_parents = vec![None; requested.slot_count()];
        build_parents(&requested, 0, &mut req_parents);
        Ok(Self {
            source: source.clone(),
            requested,
            requested_mask: mask,
            forward,
            parents,
            req_parents,
            warnings,
        })
    }

    /// The source descriptor.
    pub fn source(&self) -> &Arc<StructDesc> {
        &self.source
    }

    /// The projected descriptor.
    pub fn requested(&self) -> &Arc<StructDesc> {
        &self.requested
    }

    /// Source offsets covered by the request (used by the empty-update
    /// filter).
    pub fn requested_mask(&self) -> &BitSet {
        &self.requested_mask
    }

    /// Parse/projection diagnostics.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// A zeroed value of the projected type.
    pub fn build_requested(&self) -> PvStructure {
        PvStructure::new(self.requested.clone())
    }

    /// True when an offset or any of its ancestors is set.
    fn effectively_changed(&self, changed: &BitSet, mut offset: usize) -> bool {
        loop {
            if changed.get(offset) {
                return true;
            }
            match self.parents.get(offset).copied().flatten() {
                Some(p) => offset = p,
                None => return false,
            }
        }
    }

    /// Copy changed, projected fields from `src` into `dst`, translating
    /// the change mask into the projected offset space.
    pub fn copy_to_requested(
        &self,
        src: &PvStructure,
        changed: &BitSet,
        dst: &mut PvStructure,
        dst_changed: &mut BitSet,
    ) {
        for &(src_off, dst_off) in &self.forward {
            if !self.effectively_changed(changed, src_off) {
                continue;
            }
            if src_off == 0 {
                // the root pair: marked only when everything changed
                if changed.get(0) {
                    dst_changed.set(0);
                }
                continue;
            }
            match src.value_at_offset(src_off) {
                Some(PvValue::Structure(_)) | None => {
                    // structure slots carry no data of their own; direct
                    // marks translate, descendants copy below
                    if changed.get(src_off) {
                        dst_changed.set(dst_off);
                    }
                }
                Some(value) => {
                    if let Some(slot) = dst.value_at_offset_mut(dst_off) {
                        *slot = value.clone();
                    }
                    dst_changed.set(dst_off);
                }
            }
        }
    }

    /// Translate a source-offset mask (e.g. an overrun mask) into the
    /// projected offset space.
    pub fn mask_to_requested(&self, src_bits: &BitSet, dst: &mut BitSet) {
        for &(src_off, dst_off) in &self.forward {
            if src_bits.get(src_off) {
                dst.set(dst_off);
            }
        }
    }

    fn requested_ancestor_changed(&self, changed: &BitSet, dst_off: usize) -> bool {
        if changed.get(dst_off) {
            return true;
        }
        let mut off = dst_off;
        loop {
            match self.req_parents.get(off).copied().flatten() {
                Some(p) => {
                    if changed.get(p) {
                        return true;
                    }
                    off = p;
                }
                None => return false,
            }
        }
    }

    /// The reverse direction: apply a projected update (a put) onto the
    /// full source structure, translating the change mask back into
    /// source offsets.
    pub fn copy_to_source(
        &self,
        requested: &PvStructure,
        req_changed: &BitSet,
        src: &mut PvStructure,
        src_changed: &mut BitSet,
    ) {
        for &(src_off, dst_off) in &self.forward {
            if dst_off == 0 {
                continue;
            }
            if !self.requested_ancestor_changed(req_changed, dst_off) {
                continue;
            }
            match requested.value_at_offset(dst_off) {
                Some(PvValue::Structure(_)) | None => {
                    if req_changed.get(dst_off) {
                        src_changed.set(src_off);
                    }
                }
                Some(value) => {
                    if let Some(slot) = src.value_at_offset_mut(src_off) {
                        *slot = value.clone();
                    }
                    src_changed.set(src_off);
                }
            }
        }
    }
}

fn build_parents(desc: &StructDesc, base: usize, out: &mut Vec<Option<usize>>) {
    let mut off = base + 1;
    for (_, field) in &desc.fields {
        out[off] = Some(base);
        if let FieldDesc::Structure(inner) = field {
            build_parents(inner, off, out);
        }
        off += field.slot_count();
    }
}

#[allow(clippy::too_many_arguments)]
fn project(
    src: &StructDesc,
    sel: &SelNode,
    src_base: usize,
    dst_base: usize,
    out_fields: &mut Vec<(String, FieldDesc)>,
    forward: &mut Vec<(usize, usize)>,
    mask: &mut BitSet,
    warnings: &mut Vec<String>,
    prefix: &str,
) {
    // Missing selections first, in request order, so warnings are stable.
    for (name, _) in &sel.children {
        if src.field(name).is_none() {
            warnings.push(format!("field '{prefix}{name}' does not exist"));
        }
    }

    let mut src_off = src_base + 1;
    let mut dst_off = dst_base + 1;
    for (name, field) in &src.fields {
        let span = field.slot_count();
        if let Some(node) = sel.child(name) {
            if node.full || node.children.is_empty() {
                // whole subtree: identical shape on both sides
                for i in 0..span {
                    forward.push((src_off + i, dst_off + i));
                    mask.set(src_off + i);
                }
                out_fields.push((name.clone(), field.clone()));
                dst_off += span;
            } else if let FieldDesc::Structure(inner) = field {
                // partial: recurse into the substructure
                forward.push((src_off, dst_off));
                mask.set(src_off);
                let mut sub_fields = Vec::new();
                let child_prefix = format!("{prefix}{name}.");
                project(
                    inner,
                    node,
                    src_off,
                    dst_off,
                    &mut sub_fields,
                    forward,
                    mask,
                    warnings,
                    &child_prefix,
                );
                if sub_fields.is_empty() {
                    // every child was bogus; drop the mapping again
                    forward.pop();
                    mask.clear(src_off);
                } else {
                    let sub = Arc::new(StructDesc {
                        type_id: inner.type_id.clone(),
                        fields: sub_fields,
                    });
                    let projected = FieldDesc::Structure(sub);
                    dst_off += projected.slot_count();
                    out_fields.push((name.clone(), projected));
                }
            } else {
                warnings.push(format!("field '{prefix}{name}' has no sub-fields"));
            }
        }
        src_off += span;
    }
}

#[cfg(test)]
mod tests {
    use crate::types::ScalarKind;

    use super::*;

    fn source() -> Arc<StructDesc> {
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
            .field("units", FieldDesc::scalar(ScalarKind::String))
            .build()
        // offsets: 0 self, 1 value, 2 alarm, 3 severity, 4 message, 5 units
    }

    fn filled() -> PvStructure {
        let mut s = PvStructure::new(source());
        s.set("value", 7i32.into()).unwrap();
        s.set("alarm.severity", 1i32.into()).unwrap();
        s.set("alarm.message", "LOW".into()).unwrap();
        s.set("units", "V".into()).unwrap();
        s
    }

    #[test]
    fn identity_mapping_selects_everything() {
        let mapper = Mapper::compute(&source(), &PvRequest::all()).unwrap();
        assert_eq!(mapper.requested(), mapper.source());
        assert_eq!(mapper.requested_mask(), &BitSet::all(6));
    }

    #[test]
    fn leaf_projection() {
        let req = PvRequest::parse("field(value)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();

        assert_eq!(mapper.requested().fields.len(), 1);
        assert_eq!(mapper.requested().slot_count(), 2);
        // mask: root + value
        assert_eq!(mapper.requested_mask(), &BitSet::from_bits([0, 1]));

        let mut dst = mapper.build_requested();
        let mut dst_changed = BitSet::new();
        mapper.copy_to_requested(&filled(), &BitSet::from_bits([1]), &mut dst, &mut dst_changed);
        assert_eq!(dst.get("value").and_then(PvValue::as_i32), Some(7));
        assert_eq!(dst_changed, BitSet::from_bits([1]));
    }

    #[test]
    fn nested_partial_projection_translates_offsets() {
        let req = PvRequest::parse("field(alarm.message)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();

        // projected: 0 self, 1 alarm, 2 message
        assert_eq!(mapper.requested().slot_count(), 3);
        assert_eq!(mapper.requested().offset_of("alarm.message"), Some(2));
        // mask: root(0), alarm(2), message(4) in source space
        assert_eq!(mapper.requested_mask(), &BitSet::from_bits([0, 2, 4]));

        let mut dst = mapper.build_requested();
        let mut dst_changed = BitSet::new();
        mapper.copy_to_requested(&filled(), &BitSet::from_bits([4]), &mut dst, &mut dst_changed);
        assert_eq!(dst.get("alarm.message").and_then(|v| v.as_str()), Some("LOW"));
        assert_eq!(dst_changed, BitSet::from_bits([2]));
    }

    #[test]
    fn ancestor_change_fans_out_to_descendants() {
        let req = PvRequest::parse("field(alarm.severity)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();

        // whole alarm struct changed in the source
        let mut dst = mapper.build_requested();
        let mut dst_changed = BitSet::new();
        mapper.copy_to_requested(&filled(), &BitSet::from_bits([2]), &mut dst, &mut dst_changed);

        assert_eq!(dst.get("alarm.severity").and_then(PvValue::as_i32), Some(1));
        // alarm (projected offset 1) marked directly, severity (2) copied
        assert_eq!(dst_changed, BitSet::from_bits([1, 2]));
    }

    #[test]
    fn unchanged_fields_are_not_copied() {
        let req = PvRequest::parse("field(value,units)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();

        let mut dst = mapper.build_requested();
        let mut dst_changed = BitSet::new();
        mapper.copy_to_requested(&filled(), &BitSet::from_bits([5]), &mut dst, &mut dst_changed);

        assert_eq!(dst.get("value").and_then(PvValue::as_i32), Some(0));
        assert_eq!(dst.get("units").and_then(|v| v.as_str()), Some("V"));
        // projected: 0 self, 1 value, 2 units
        assert_eq!(dst_changed, BitSet::from_bits([2]));
    }

    #[test]
    fn missing_field_warns_but_succeeds() {
        let req = PvRequest::parse("field(value,bogus)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();
        assert_eq!(mapper.requested().fields.len(), 1);
        assert!(mapper.warnings().iter().any(|w| w.contains("bogus")));
    }

    #[test]
    fn all_fields_missing_is_an_error() {
        let req = PvRequest::parse("field(bogus)").unwrap();
        assert!(matches!(
            Mapper::compute(&source(), &req),
            Err(ProtocolError::InvalidRequest(_))
        ));
    }

    #[test]
    fn mask_translation() {
        let req = PvRequest::parse("field(alarm)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();
        // projected: 0 self, 1 alarm, 2 severity, 3 message
        let mut out = BitSet::new();
        mapper.mask_to_requested(&BitSet::from_bits([3, 4]), &mut out);
        assert_eq!(out, BitSet::from_bits([2, 3]));
    }

    #[test]
    fn put_copies_back_into_source_offsets() {
        let req = PvRequest::parse("field(alarm.message)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();

        // client writes the projected message (projected offset 2)
        let mut projected = mapper.build_requested();
        projected.set("alarm.message", "HIHI".into()).unwrap();
        let req_changed = BitSet::from_bits([2]);

        let mut src = filled();
        let mut src_changed = BitSet::new();
        mapper.copy_to_source(&projected, &req_changed, &mut src, &mut src_changed);

        assert_eq!(src.get("alarm.message").and_then(|v| v.as_str()), Some("HIHI"));
        // untouched source fields keep their values
        assert_eq!(src.get("value").and_then(PvValue::as_i32), Some(7));
        // source offset of alarm.message is 4
        assert_eq!(src_changed, BitSet::from_bits([4]));
    }

    #[test]
    fn put_with_root_bit_writes_all_selected() {
        let req = PvRequest::parse("field(value,units)").unwrap();
        let mapper = Mapper::compute(&source(), &req).unwrap();

        let mut projected = mapper.build_requested();
        projected.set("value", 99i32.into()).unwrap();
        projected.set("units", "mA".into()).unwrap();

        let mut src = filled();
        let mut src_changed = BitSet::new();
        mapper.copy_to_source(&projected, &BitSet::from_bits([0]), &mut src, &mut src_changed);

        assert_eq!(src.get("value").and_then(PvValue::as_i32), Some(99));
        assert_eq!(src.get("units").and_then(|v| v.as_str()), Some("mA"));
        assert_eq!(src_changed, BitSet::from_bits([1, 5]));
    }

    #[test]
    fn leaf_with_subfield_selection_warns() {
        let req = PvRequest::parse("field(value.sub)").unwrap();
        let result = Mapper::compute(&source(), &req);
        // nothing projectable remains
        assert!(result.is_err());
    }
}
