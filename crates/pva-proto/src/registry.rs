//! Per-connection introspection cache.
//!
//! Repeated transmissions of the same type descriptor compress to a
//! 16-bit id. Each direction of a connection keeps its own table:
//! outgoing (descriptor → id, we assign) and incoming (id → descriptor,
//! the peer assigns). The selector byte preceding a descriptor picks the
//! encoding:
//!
//! | byte | meaning |
//! |---|---|
//! | `0xFF` | null descriptor |
//! | `0xFE` + id | `ONLY_ID`: reference an existing entry |
//! | `0xFD` + id + full | `FULL_WITH_ID`: register, then read full |
//! | other | `FULL`: the byte starts a full encoding, no registration |
//!
//! Both tables reset on connection open and on validated reconnect.

use std::collections::HashMap;

use crate::{
    errors::{ProtocolError, Result},
    types::FieldDesc,
    wire::{Reader, Writer},
};

const SEL_NULL: u8 = 0xFF;
const SEL_ONLY_ID: u8 = 0xFE;
const SEL_FULL_WITH_ID: u8 = 0xFD;

/// Bidirectional introspection id table for one connection.
#[derive(Debug, Default)]
pub struct IntrospectionRegistry {
    outgoing: HashMap<FieldDesc, u16>,
    incoming: HashMap<u16, FieldDesc>,
    next_id: u16,
}

impl IntrospectionRegistry {
    /// Fresh registry with empty tables. Id 0 is reserved for the null
    /// descriptor, so assignment starts at 1.
    pub fn new() -> Self {
        Self { outgoing: HashMap::new(), incoming: HashMap::new(), next_id: 1 }
    }

    /// Clear both tables (connection open / validated reconnect).
    pub fn reset(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
        self.next_id = 1;
    }

    /// Number of registered outgoing descriptors.
    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Encode a descriptor, using the short id form once the descriptor
    /// has been sent on this connection before.
    pub fn encode(&mut self, desc: &FieldDesc, w: &mut Writer<'_>) {
        if let Some(id) = self.outgoing.get(desc) {
            w.put_u8(SEL_ONLY_ID);
            w.put_u16(*id);
            return;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.outgoing.insert(desc.clone(), id);
        w.put_u8(SEL_FULL_WITH_ID);
        w.put_u16(id);
        desc.encode_full(w);
    }

    /// Encode an optional descriptor; `None` writes the null selector.
    pub fn encode_opt(&mut self, desc: Option<&FieldDesc>, w: &mut Writer<'_>) {
        match desc {
            None => w.put_u8(SEL_NULL),
            Some(desc) => self.encode(desc, w),
        }
    }

    /// Decode a descriptor, honoring whichever encoding the peer chose.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownTypeId`] when an `ONLY_ID` reference was
    /// never registered by a prior `FULL_WITH_ID`.
    pub fn decode(&mut self, r: &mut Reader<'_>) -> Result<Option<FieldDesc>> {
        let selector = r.get_u8()?;
        match selector {
            SEL_NULL => Ok(None),
            SEL_ONLY_ID => {
                let id = r.get_u16()?;
                self.incoming
                    .get(&id)
                    .cloned()
                    .map(Some)
                    .ok_or(ProtocolError::UnknownTypeId(id))
            }
            SEL_FULL_WITH_ID => {
                let id = r.get_u16()?;
                let desc = FieldDesc::decode_full(r)?;
                self.incoming.insert(id, desc.clone());
                Ok(Some(desc))
            }
            code => {
                // FULL: no registration. The peer is free to never cache.
                Ok(Some(FieldDesc::decode_full_after_code(code, r)?))
            }
        }
    }

    /// Decode a descriptor that must be present.
    pub fn decode_required(&mut self, r: &mut Reader<'_>) -> Result<FieldDesc> {
        self.decode(r)?
            .ok_or(ProtocolError::InvalidEncoding("null descriptor where one is required"))
    }
}
