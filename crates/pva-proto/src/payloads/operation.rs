//! Data-operation payloads: Get/Put/PutGet/Process/RPC/Array/Monitor and
//! GetField.
//!
//! Every client-side operation message starts with `(sid, request id,
//! subcommand)`; every server-side reply starts with `(request id,
//! subcommand, status)`. Typed value content is serialized against the
//! descriptor negotiated at INIT time, so the decode functions take that
//! descriptor as a parameter. Descriptors transmitted here go through the
//! introspection cache.

use std::sync::Arc;

use crate::{
    bitset::BitSet,
    command::SubCommand,
    errors::{ProtocolError, Result},
    registry::IntrospectionRegistry,
    status::Status,
    types::{FieldDesc, StructDesc},
    value::{PvStructure, PvValue},
    wire::{Reader, Writer},
};

/// Common prefix of every client → server operation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Server-assigned channel id.
    pub channel_sid: u32,
    /// Request id, unique within the channel.
    pub request_id: u32,
    /// Subcommand bits.
    pub sub: SubCommand,
}

impl RequestHeader {
    /// Build a header.
    pub fn new(channel_sid: u32, request_id: u32, sub: SubCommand) -> Self {
        Self { channel_sid, request_id, sub }
    }

    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.channel_sid);
        w.put_u32(self.request_id);
        w.put_u8(self.sub.bits());
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            channel_sid: r.get_u32()?,
            request_id: r.get_u32()?,
            sub: SubCommand::from_bits(r.get_u8()?),
        })
    }
}

/// Common prefix of every server → client operation reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Request id this reply answers.
    pub request_id: u32,
    /// Subcommand bits echoed from the request.
    pub sub: SubCommand,
    /// Outcome.
    pub status: Status,
}

impl ResponseHeader {
    /// Build a header.
    pub fn new(request_id: u32, sub: SubCommand, status: Status) -> Self {
        Self { request_id, sub, status }
    }

    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.request_id);
        w.put_u8(self.sub.bits());
        self.status.encode(w);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            request_id: r.get_u32()?,
            sub: SubCommand::from_bits(r.get_u8()?),
            status: Status::decode(r)?,
        })
    }
}

/// Operation INIT: negotiates the interface with a textual pvRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationInit {
    /// Message prefix; `sub` carries [`SubCommand::INIT`].
    pub header: RequestHeader,
    /// Canonical pvRequest text.
    pub request: String,
}

impl OperationInit {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        self.header.encode(w);
        w.put_string(&self.request);
    }

    /// Deserialize; the caller has already read nothing past the message
    /// header.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { header: RequestHeader::decode(r)?, request: r.get_string()? })
    }
}

/// Reply to an operation INIT: a status plus zero, one or two negotiated
/// interface descriptors (PutGet carries two: put then get).
#[derive(Debug, Clone, PartialEq)]
pub struct OperationInitAck {
    /// Request id.
    pub request_id: u32,
    /// Outcome; descriptors are present only on success.
    pub status: Status,
    /// Negotiated interfaces, operation-specific.
    pub interfaces: Vec<FieldDesc>,
}

impl OperationInitAck {
    /// Serialize through the introspection cache.
    pub fn encode(&self, registry: &mut IntrospectionRegistry, w: &mut Writer<'_>) {
        ResponseHeader::new(self.request_id, SubCommand::INIT, self.status.clone()).encode(w);
        w.put_u8(self.interfaces.len() as u8);
        for desc in &self.interfaces {
            registry.encode(desc, w);
        }
    }

    /// Deserialize through the introspection cache.
    pub fn decode(registry: &mut IntrospectionRegistry, r: &mut Reader<'_>) -> Result<Self> {
        let header = ResponseHeader::decode(r)?;
        let count = r.get_u8()?;
        let mut interfaces = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            interfaces.push(registry.decode_required(r)?);
        }
        Ok(Self { request_id: header.request_id, status: header.status, interfaces })
    }
}

/// A change mask plus the selected fields, the unit of partial data
/// transfer for Put/PutGet.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedData {
    /// Offsets present in `value`.
    pub changed: BitSet,
    /// The (partially populated) structure.
    pub value: PvStructure,
}

impl MaskedData {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        self.changed.encode(w);
        self.value.serialize_masked(&self.changed, w);
    }

    /// Deserialize against the negotiated descriptor.
    pub fn decode(desc: &Arc<StructDesc>, r: &mut Reader<'_>) -> Result<Self> {
        let changed = BitSet::decode(r)?;
        let mut value = PvStructure::new(desc.clone());
        value.deserialize_masked(&changed, r)?;
        Ok(Self { changed, value })
    }
}

/// Data-carrying reply (Get result, PutGet result, Put's read-back).
#[derive(Debug, Clone, PartialEq)]
pub struct DataResponse {
    /// Message prefix.
    pub header: ResponseHeader,
    /// Present exactly when the status is a success.
    pub data: Option<MaskedData>,
}

impl DataResponse {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        self.header.encode(w);
        if let Some(data) = &self.data {
            data.encode(w);
        }
    }

    /// Deserialize against the negotiated descriptor.
    pub fn decode(desc: &Arc<StructDesc>, r: &mut Reader<'_>) -> Result<Self> {
        let header = ResponseHeader::decode(r)?;
        let data = if header.status.is_success() {
            Some(MaskedData::decode(desc, r)?)
        } else {
            None
        };
        Ok(Self { header, data })
    }
}

/// RPC call arguments or result: a self-describing structure routed
/// through the introspection cache.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcData {
    /// The argument/result structure.
    pub value: PvStructure,
}

impl RpcData {
    /// Serialize through the introspection cache.
    pub fn encode(&self, registry: &mut IntrospectionRegistry, w: &mut Writer<'_>) {
        registry.encode(&FieldDesc::Structure(self.value.desc().clone()), w);
        self.value.serialize(w);
    }

    /// Deserialize through the introspection cache.
    pub fn decode(registry: &mut IntrospectionRegistry, r: &mut Reader<'_>) -> Result<Self> {
        match registry.decode_required(r)? {
            FieldDesc::Structure(desc) => {
                Ok(Self { value: PvStructure::deserialize(&desc, r)? })
            }
            _ => Err(ProtocolError::TypeMismatch { expected: "structure for rpc data" }),
        }
    }
}

/// Array operation request bodies. `-1` means "to the end" for a slice
/// count and "do not change" for lengths.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayRequest {
    /// Read `count` elements starting at `offset`.
    GetSlice {
        /// First element index.
        offset: u64,
        /// Element count; `-1` reads to the end.
        count: i64,
    },
    /// Write elements starting at `offset`.
    PutSlice {
        /// First element index.
        offset: u64,
        /// The elements; must be an array value of the negotiated kind.
        values: PvValue,
    },
    /// Resize the array.
    SetLength {
        /// New length; `-1` keeps the current length.
        length: i64,
        /// New capacity; `-1` keeps the current capacity.
        capacity: i64,
    },
    /// Query length and capacity.
    GetLength,
}

const ARRAY_OP_GET: u8 = 0;
const ARRAY_OP_PUT: u8 = 1;
const ARRAY_OP_SET_LENGTH: u8 = 2;
const ARRAY_OP_GET_LENGTH: u8 = 3;

impl ArrayRequest {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        match self {
            Self::GetSlice { offset, count } => {
                w.put_u8(ARRAY_OP_GET);
                w.put_u64(*offset);
                w.put_i64(*count);
            }
            Self::PutSlice { offset, values } => {
                w.put_u8(ARRAY_OP_PUT);
                w.put_u64(*offset);
                values.serialize(w);
            }
            Self::SetLength { length, capacity } => {
                w.put_u8(ARRAY_OP_SET_LENGTH);
                w.put_i64(*length);
                w.put_i64(*capacity);
            }
            Self::GetLength => w.put_u8(ARRAY_OP_GET_LENGTH),
        }
    }

    /// Deserialize against the negotiated element descriptor.
    pub fn decode(element: &FieldDesc, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match r.get_u8()? {
            ARRAY_OP_GET => Self::GetSlice { offset: r.get_u64()?, count: r.get_i64()? },
            ARRAY_OP_PUT => Self::PutSlice {
                offset: r.get_u64()?,
                values: PvValue::deserialize(element, r)?,
            },
            ARRAY_OP_SET_LENGTH => {
                Self::SetLength { length: r.get_i64()?, capacity: r.get_i64()? }
            }
            ARRAY_OP_GET_LENGTH => Self::GetLength,
            _ => return Err(ProtocolError::InvalidEncoding("unknown array op")),
        })
    }
}

/// Array operation reply bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayResponseBody {
    /// Elements read by a slice get.
    Slice(PvValue),
    /// Length query result.
    Length {
        /// Current element count.
        length: u64,
        /// Current capacity.
        capacity: u64,
    },
    /// Acknowledgment with no data (put, set-length).
    Ack,
}

impl ArrayResponseBody {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        match self {
            Self::Slice(values) => {
                w.put_u8(ARRAY_OP_GET);
                values.serialize(w);
            }
            Self::Length { length, capacity } => {
                w.put_u8(ARRAY_OP_GET_LENGTH);
                w.put_u64(*length);
                w.put_u64(*capacity);
            }
            Self::Ack => w.put_u8(ARRAY_OP_PUT),
        }
    }

    /// Deserialize against the negotiated element descriptor.
    pub fn decode(element: &FieldDesc, r: &mut Reader<'_>) -> Result<Self> {
        Ok(match r.get_u8()? {
            ARRAY_OP_GET => Self::Slice(PvValue::deserialize(element, r)?),
            ARRAY_OP_GET_LENGTH => {
                Self::Length { length: r.get_u64()?, capacity: r.get_u64()? }
            }
            ARRAY_OP_PUT => Self::Ack,
            _ => return Err(ProtocolError::InvalidEncoding("unknown array response")),
        })
    }
}

/// Monitor pipeline acknowledgment: the consumer freed `nfree` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorAck {
    /// Number of elements the consumer released.
    pub nfree: i32,
}

impl MonitorAck {
    /// Serialize (follows a [`RequestHeader`] with [`SubCommand::ACK`]).
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_i32(self.nfree);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { nfree: r.get_i32()? })
    }
}

/// Server → client monitor traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorMessage {
    /// One queued element.
    Update {
        /// Owning request id.
        request_id: u32,
        /// Offsets present in `value`.
        changed: BitSet,
        /// The projected structure, masked by `changed`.
        value: PvStructure,
        /// Offsets whose intermediate updates were squashed.
        overrun: BitSet,
    },
    /// Graceful end of the subscription.
    Unlisten {
        /// Owning request id.
        request_id: u32,
    },
}

impl MonitorMessage {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        match self {
            Self::Update { request_id, changed, value, overrun } => {
                w.put_u32(*request_id);
                w.put_u8(SubCommand::empty().bits());
                changed.encode(w);
                value.serialize_masked(changed, w);
                overrun.encode(w);
            }
            Self::Unlisten { request_id } => {
                w.put_u32(*request_id);
                w.put_u8(SubCommand::DESTROY.bits());
            }
        }
    }

    /// Deserialize against the negotiated (projected) descriptor.
    pub fn decode(desc: &Arc<StructDesc>, r: &mut Reader<'_>) -> Result<Self> {
        let request_id = r.get_u32()?;
        let sub = SubCommand::from_bits(r.get_u8()?);
        if sub.contains(SubCommand::DESTROY) {
            return Ok(Self::Unlisten { request_id });
        }
        let changed = BitSet::decode(r)?;
        let mut value = PvStructure::new(desc.clone());
        value.deserialize_masked(&changed, r)?;
        let overrun = BitSet::decode(r)?;
        Ok(Self::Update { request_id, changed, value, overrun })
    }

    /// Peek the request id without a descriptor (routing).
    pub fn peek_request_id(r: &mut Reader<'_>) -> Result<u32> {
        r.get_u32()
    }
}

/// Request/cancel teardown: `(sid, request id)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRef {
    /// Server-assigned channel id.
    pub channel_sid: u32,
    /// Request id.
    pub request_id: u32,
}

impl RequestRef {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.channel_sid);
        w.put_u32(self.request_id);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { channel_sid: r.get_u32()?, request_id: r.get_u32()? })
    }
}

/// Introspection request for a channel (optionally a sub-field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetFieldRequest {
    /// Server-assigned channel id.
    pub channel_sid: u32,
    /// Request id.
    pub request_id: u32,
    /// Dotted sub-field path; empty for the whole structure.
    pub subfield: String,
}

impl GetFieldRequest {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.channel_sid);
        w.put_u32(self.request_id);
        w.put_string(&self.subfield);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            channel_sid: r.get_u32()?,
            request_id: r.get_u32()?,
            subfield: r.get_string()?,
        })
    }
}

/// Reply to a [`GetFieldRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct GetFieldResponse {
    /// Request id.
    pub request_id: u32,
    /// Outcome.
    pub status: Status,
    /// The descriptor, present on success.
    pub interface: Option<FieldDesc>,
}

impl GetFieldResponse {
    /// Serialize through the introspection cache.
    pub fn encode(&self, registry: &mut IntrospectionRegistry, w: &mut Writer<'_>) {
        w.put_u32(self.request_id);
        self.status.encode(w);
        registry.encode_opt(self.interface.as_ref(), w);
    }

    /// Deserialize through the introspection cache.
    pub fn decode(registry: &mut IntrospectionRegistry, r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            request_id: r.get_u32()?,
            status: Status::decode(r)?,
            interface: registry.decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::types::ScalarKind;
    use crate::wire::ByteOrder;

    use super::*;

    fn value_desc() -> Arc<StructDesc> {
        StructDesc::builder("test_t")
            .field("value", FieldDesc::scalar(ScalarKind::I32))
            .field("count", FieldDesc::scalar(ScalarKind::U64))
            .build()
    }

    #[test]
    fn init_and_ack_round_trip() {
        let init = OperationInit {
            header: RequestHeader::new(4, 9, SubCommand::INIT),
            request: "field(value)".into(),
        };
        let mut buf = Vec::new();
        init.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = OperationInit::decode(&mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, init);

        let mut tx = IntrospectionRegistry::new();
        let mut rx = IntrospectionRegistry::new();
        let ack = OperationInitAck {
            request_id: 9,
            status: Status::ok(),
            interfaces: vec![FieldDesc::Structure(value_desc())],
        };
        let mut buf = Vec::new();
        ack.encode(&mut tx, &mut Writer::new(&mut buf, ByteOrder::Big));
        let back =
            OperationInitAck::decode(&mut rx, &mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, ack);
    }

    #[test]
    fn data_response_round_trip() {
        let desc = value_desc();
        let mut value = PvStructure::new(desc.clone());
        value.set("value", 5i32.into()).unwrap();
        let changed = BitSet::from_bits([1]);

        let resp = DataResponse {
            header: ResponseHeader::new(3, SubCommand::GET, Status::ok()),
            data: Some(MaskedData { changed, value }),
        };
        let mut buf = Vec::new();
        resp.encode(&mut Writer::new(&mut buf, ByteOrder::Little));
        let back = DataResponse::decode(&desc, &mut Reader::new(&buf, ByteOrder::Little)).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn failed_data_response_has_no_data() {
        let desc = value_desc();
        let resp = DataResponse {
            header: ResponseHeader::new(3, SubCommand::GET, Status::error("cancelled")),
            data: None,
        };
        let mut buf = Vec::new();
        resp.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = DataResponse::decode(&desc, &mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back.data, None);
    }

    #[test]
    fn rpc_data_round_trip_uses_cache() {
        let mut tx = IntrospectionRegistry::new();
        let mut rx = IntrospectionRegistry::new();

        let mut args = PvStructure::new(value_desc());
        args.set("value", 1i32.into()).unwrap();
        let data = RpcData { value: args };

        let mut first = Vec::new();
        data.encode(&mut tx, &mut Writer::new(&mut first, ByteOrder::Big));
        let mut second = Vec::new();
        data.encode(&mut tx, &mut Writer::new(&mut second, ByteOrder::Big));
        assert!(second.len() < first.len());

        let b1 = RpcData::decode(&mut rx, &mut Reader::new(&first, ByteOrder::Big)).unwrap();
        let b2 = RpcData::decode(&mut rx, &mut Reader::new(&second, ByteOrder::Big)).unwrap();
        assert_eq!(b1, data);
        assert_eq!(b2, data);
    }

    #[test]
    fn array_request_round_trip() {
        let element = FieldDesc::scalar_array(ScalarKind::F64);
        for req in [
            ArrayRequest::GetSlice { offset: 2, count: -1 },
            ArrayRequest::PutSlice { offset: 0, values: PvValue::F64Array(vec![1.0, 2.0]) },
            ArrayRequest::SetLength { length: 10, capacity: -1 },
            ArrayRequest::GetLength,
        ] {
            let mut buf = Vec::new();
            req.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
            let back = ArrayRequest::decode(&element, &mut Reader::new(&buf, ByteOrder::Big))
                .unwrap();
            assert_eq!(back, req);
        }
    }

    #[test]
    fn monitor_update_round_trip() {
        let desc = value_desc();
        let mut value = PvStructure::new(desc.clone());
        value.set("value", 4i32.into()).unwrap();

        let update = MonitorMessage::Update {
            request_id: 12,
            changed: BitSet::from_bits([1]),
            value,
            overrun: BitSet::from_bits([1]),
        };
        let mut buf = Vec::new();
        update.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = MonitorMessage::decode(&desc, &mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, update);

        let unlisten = MonitorMessage::Unlisten { request_id: 12 };
        let mut buf = Vec::new();
        unlisten.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = MonitorMessage::decode(&desc, &mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, unlisten);
    }

    #[test]
    fn get_field_round_trip() {
        let mut tx = IntrospectionRegistry::new();
        let mut rx = IntrospectionRegistry::new();
        let resp = GetFieldResponse {
            request_id: 2,
            status: Status::ok(),
            interface: Some(FieldDesc::Structure(value_desc())),
        };
        let mut buf = Vec::new();
        resp.encode(&mut tx, &mut Writer::new(&mut buf, ByteOrder::Big));
        let back =
            GetFieldResponse::decode(&mut rx, &mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, resp);
    }
}
