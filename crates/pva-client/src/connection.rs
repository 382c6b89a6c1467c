//! Client-side connection state machine.
//!
//! Pure logic for one TCP connection: the validation handshake, echo
//! heartbeats, byte-order handling, and dispatch of server replies to
//! their owning operations. Events (frames, clock ticks) go in; actions
//! (framed bytes to send, decoded deliveries, close) come out. The
//! transport driver in [`crate::transport`] executes them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pva_proto::{
    ByteOrder, Command, ControlCommand, FieldDesc, Header, IntrospectionRegistry, ProtocolError,
    PvStructure, Reader, Reassembler, Role, Segmenter, Status, StatusKind, SubCommand, Writer,
    payloads::{
        channel::{CreateChannelRequest, CreateChannelResponse, DestroyChannel},
        operation::{
            ArrayRequest, ArrayResponseBody, DataResponse, GetFieldRequest, GetFieldResponse,
            MaskedData, MonitorAck, MonitorMessage, OperationInit, OperationInitAck,
            RequestHeader, RequestRef, ResponseHeader, RpcData,
        },
        session::{
            AuthNzMessage, ConnectionValidated, Echo, MessageNotify, ValidationRequest,
            ValidationResponse,
        },
    },
};

use crate::errors::ClientError;

/// Handshake progress of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the server's `ConnectionValidation`.
    AwaitValidation,
    /// Sent our response; waiting for `ConnectionValidated` (possibly
    /// through AuthNZ rounds).
    Validating,
    /// Application traffic allowed.
    Validated,
    /// Terminal.
    Closed,
}

/// What kind of operation a request id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Get operation.
    Get,
    /// Put operation.
    Put,
    /// PutGet operation.
    PutGet,
    /// Process operation.
    Process,
    /// RPC operation.
    Rpc,
    /// Array operation.
    Array,
    /// Monitor operation.
    Monitor,
    /// GetField lookup.
    GetField,
}

impl OpKind {
    fn command(self) -> Command {
        match self {
            Self::Get => Command::Get,
            Self::Put => Command::Put,
            Self::PutGet => Command::PutGet,
            Self::Process => Command::Process,
            Self::Rpc => Command::Rpc,
            Self::Array => Command::Array,
            Self::Monitor => Command::Monitor,
            Self::GetField => Command::GetField,
        }
    }
}

#[derive(Debug)]
struct OpEntry {
    kind: OpKind,
    interfaces: Vec<FieldDesc>,
}

/// Decoded server event for one operation.
#[derive(Debug, Clone)]
pub enum OpEvent {
    /// Interface negotiation finished.
    InitAck {
        /// Outcome; interfaces are empty on failure.
        status: Status,
        /// Negotiated descriptors (operation-specific).
        interfaces: Vec<FieldDesc>,
    },
    /// A data-carrying reply (Get result, PutGet result, Put read-back).
    Data {
        /// Echoed subcommand bits.
        sub: SubCommand,
        /// Outcome.
        status: Status,
        /// Mask + fields, present on success.
        data: Option<MaskedData>,
    },
    /// A data-less acknowledgment (put done, process done).
    Ack {
        /// Echoed subcommand bits.
        sub: SubCommand,
        /// Outcome.
        status: Status,
    },
    /// RPC completion.
    Rpc {
        /// Outcome.
        status: Status,
        /// Result structure on success.
        value: Option<PvStructure>,
    },
    /// Array operation completion.
    Array {
        /// Outcome.
        status: Status,
        /// Operation-specific body on success.
        body: Option<ArrayResponseBody>,
    },
    /// Subscription traffic.
    Monitor(Box<MonitorMessage>),
    /// Introspection result.
    GetField {
        /// Outcome.
        status: Status,
        /// The descriptor on success.
        interface: Option<FieldDesc>,
    },
    /// Informational message from the server.
    Message {
        /// Severity.
        kind: StatusKind,
        /// Text.
        text: String,
    },
}

/// Actions produced by the state machine for the driver to execute.
#[derive(Debug)]
pub enum ConnAction {
    /// Write these framed bytes to the socket.
    Send(Vec<u8>),
    /// Handshake completed; channels may now be created.
    Validated {
        /// The server's identity.
        server_guid: [u8; 12],
    },
    /// A channel creation answer arrived.
    ChannelCreated {
        /// Client channel id.
        client_id: u32,
        /// Server channel id (zero on failure).
        server_id: u32,
        /// Outcome.
        status: Status,
    },
    /// The server acknowledged (or initiated) a channel teardown.
    ChannelDestroyed {
        /// Client channel id.
        client_id: u32,
        /// Server channel id.
        server_id: u32,
    },
    /// Route an event to the operation owning `request_id`.
    Deliver {
        /// Target request id.
        request_id: u32,
        /// The event.
        event: OpEvent,
    },
    /// Tear the connection down.
    Close {
        /// Human-readable reason.
        reason: String,
    },
}

/// Tuning for a client connection.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Echo after this much receive silence; unresponsive after twice it.
    pub heartbeat_interval: Duration,
    /// Advertised receive buffer size.
    pub receive_buffer_size: u32,
    /// Preferred auth plugin name.
    pub auth_plugin: String,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            receive_buffer_size: 1 << 16,
            auth_plugin: "anonymous".into(),
        }
    }
}

/// The connection state machine. No I/O; owner serializes access.
#[derive(Debug)]
pub struct ClientConnection {
    state: ConnState,
    options: ConnOptions,
    send_order: ByteOrder,
    registry: IntrospectionRegistry,
    reassembler: Reassembler,
    segmenter: Segmenter,
    ops: HashMap<u32, OpEntry>,
    server_guid: Option<[u8; 12]>,
    last_rx: Instant,
    echo_outstanding: bool,
}

impl ClientConnection {
    /// Fresh connection in the pre-validation state. Both introspection
    /// tables start empty, per the connection-open reset rule.
    pub fn new(options: ConnOptions, now: Instant) -> Self {
        let receive_buffer_size = options.receive_buffer_size.max(1024);
        Self {
            state: ConnState::AwaitValidation,
            options,
            send_order: ByteOrder::native(),
            registry: IntrospectionRegistry::new(),
            reassembler: Reassembler::new(),
            segmenter: Segmenter::new(receive_buffer_size as usize),
            ops: HashMap::new(),
            server_guid: None,
            last_rx: now,
            echo_outstanding: false,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The peer's GUID once validated.
    pub fn server_guid(&self) -> Option<[u8; 12]> {
        self.server_guid
    }

    /// Mark closed (idempotent).
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }

    // ---- outbound -------------------------------------------------------

    fn message<F>(&mut self, command: Command, build: F) -> Vec<u8>
    where
        F: FnOnce(&mut Writer<'_>, &mut IntrospectionRegistry),
    {
        let mut payload = Vec::new();
        build(&mut Writer::new(&mut payload, self.send_order), &mut self.registry);
        let mut framed = Vec::new();
        self.segmenter.write_message(
            command.to_u8(),
            Role::Client,
            self.send_order,
            &payload,
            &mut framed,
        );
        framed
    }

    /// Frame a channel-creation request.
    pub fn encode_create_channel(&mut self, cid: u32, name: &str) -> Vec<u8> {
        let req = CreateChannelRequest { channels: vec![(cid, name.to_owned())] };
        self.message(Command::CreateChannel, |w, _| req.encode(w))
    }

    /// Frame a channel teardown.
    pub fn encode_destroy_channel(&mut self, sid: u32, cid: u32) -> Vec<u8> {
        let req = DestroyChannel { server_id: sid, client_id: cid };
        self.message(Command::DestroyChannel, |w, _| req.encode(w))
    }

    /// Frame an operation INIT and register the request id for response
    /// routing.
    pub fn encode_init(&mut self, kind: OpKind, sid: u32, rid: u32, request: &str) -> Vec<u8> {
        self.ops.insert(rid, OpEntry { kind, interfaces: Vec::new() });
        let init = OperationInit {
            header: RequestHeader::new(sid, rid, SubCommand::INIT),
            request: request.to_owned(),
        };
        self.message(kind.command(), |w, _| init.encode(w))
    }

    /// Frame a GetField lookup (its own command, still a routed request).
    pub fn encode_get_field(&mut self, sid: u32, rid: u32, subfield: &str) -> Vec<u8> {
        self.ops.insert(rid, OpEntry { kind: OpKind::GetField, interfaces: Vec::new() });
        let req = GetFieldRequest { channel_sid: sid, request_id: rid, subfield: subfield.into() };
        self.message(Command::GetField, |w, _| req.encode(w))
    }

    /// Frame a bare method execution (get, process, monitor start/stop).
    pub fn encode_exec(&mut self, kind: OpKind, sid: u32, rid: u32, sub: SubCommand) -> Vec<u8> {
        let header = RequestHeader::new(sid, rid, sub);
        self.message(kind.command(), |w, _| header.encode(w))
    }

    /// Frame a put (or the put half of a put-get).
    pub fn encode_put(
        &mut self,
        kind: OpKind,
        sid: u32,
        rid: u32,
        sub: SubCommand,
        data: &MaskedData,
    ) -> Vec<u8> {
        let header = RequestHeader::new(sid, rid, sub);
        self.message(kind.command(), |w, _| {
            header.encode(w);
            data.encode(w);
        })
    }

    /// Frame an RPC invocation.
    pub fn encode_rpc(&mut self, sid: u32, rid: u32, sub: SubCommand, args: PvStructure) -> Vec<u8> {
        let header = RequestHeader::new(sid, rid, sub);
        let data = RpcData { value: args };
        self.message(Command::Rpc, |w, registry| {
            header.encode(w);
            data.encode(registry, w);
        })
    }

    /// Frame an array sub-operation.
    pub fn encode_array(
        &mut self,
        sid: u32,
        rid: u32,
        sub: SubCommand,
        req: &ArrayRequest,
    ) -> Vec<u8> {
        let header = RequestHeader::new(sid, rid, sub);
        self.message(Command::Array, |w, _| {
            header.encode(w);
            req.encode(w);
        })
    }

    /// Frame a monitor pipeline acknowledgment.
    pub fn encode_monitor_ack(&mut self, sid: u32, rid: u32, nfree: i32) -> Vec<u8> {
        let header = RequestHeader::new(sid, rid, SubCommand::ACK);
        let ack = MonitorAck { nfree };
        self.message(Command::Monitor, |w, _| {
            header.encode(w);
            ack.encode(w);
        })
    }

    /// Frame a request teardown and forget its routing entry.
    pub fn encode_destroy_request(&mut self, sid: u32, rid: u32) -> Vec<u8> {
        self.ops.remove(&rid);
        let req = RequestRef { channel_sid: sid, request_id: rid };
        self.message(Command::DestroyRequest, |w, _| req.encode(w))
    }

    /// Frame a cancel for an in-flight request.
    pub fn encode_cancel(&mut self, sid: u32, rid: u32) -> Vec<u8> {
        let req = RequestRef { channel_sid: sid, request_id: rid };
        self.message(Command::CancelRequest, |w, _| req.encode(w))
    }

    /// Forget a request id without traffic (local destroy while
    /// disconnected).
    pub fn forget_request(&mut self, rid: u32) {
        self.ops.remove(&rid);
    }

    // ---- inbound --------------------------------------------------------

    /// Process one raw frame (header already split from the stream).
    pub fn handle_frame(
        &mut self,
        header: Header,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<ConnAction>, ClientError> {
        self.last_rx = now;
        self.echo_outstanding = false;

        if header.control {
            // SetByteOrder fixes the peer's declared order; every header
            // already self-describes, so markers and order changes need
            // no state here.
            let _ = ControlCommand::from_u8(header.command);
            return Ok(Vec::new());
        }

        let Some((header, payload)) = self.reassembler.push(header, payload)? else {
            return Ok(Vec::new());
        };
        self.handle_message(header, &payload)
    }

    fn handle_message(
        &mut self,
        header: Header,
        payload: &[u8],
    ) -> Result<Vec<ConnAction>, ClientError> {
        let order = header.order;
        let mut r = Reader::new(payload, order);

        let Some(command) = Command::from_u8(header.command) else {
            tracing::debug!(command = header.command, "ignoring unknown command");
            return Ok(Vec::new());
        };

        match command {
            Command::ConnectionValidation => self.on_validation_request(&mut r),
            Command::AuthNz => self.on_authnz(&mut r),
            Command::ConnectionValidated => self.on_validated(&mut r),
            Command::Echo => Ok(Vec::new()), // reply to our heartbeat
            Command::CreateChannel => {
                let resp = CreateChannelResponse::decode(&mut r)?;
                Ok(vec![ConnAction::ChannelCreated {
                    client_id: resp.client_id,
                    server_id: resp.server_id,
                    status: resp.status,
                }])
            }
            Command::DestroyChannel => {
                let resp = DestroyChannel::decode(&mut r)?;
                Ok(vec![ConnAction::ChannelDestroyed {
                    client_id: resp.client_id,
                    server_id: resp.server_id,
                }])
            }
            Command::Message => {
                let msg = MessageNotify::decode(&mut r)?;
                Ok(vec![ConnAction::Deliver {
                    request_id: msg.request_id,
                    event: OpEvent::Message { kind: msg.kind, text: msg.message },
                }])
            }
            Command::Get
            | Command::Put
            | Command::PutGet
            | Command::Process
            | Command::Rpc
            | Command::Array
            | Command::Monitor
            | Command::GetField => self.on_operation_reply(command, payload, order),
            Command::Beacon
            | Command::Search
            | Command::SearchResponse
            | Command::OriginTag => {
                // discovery-plane traffic does not belong on TCP
                tracing::debug!(?command, "ignoring discovery command on tcp");
                Ok(Vec::new())
            }
            Command::AclChange | Command::MultipleData => Ok(Vec::new()),
            Command::DestroyRequest | Command::CancelRequest => Ok(Vec::new()),
        }
    }

    fn on_validation_request(
        &mut self,
        r: &mut Reader<'_>,
    ) -> Result<Vec<ConnAction>, ClientError> {
        let req = ValidationRequest::decode(r)?;
        self.server_guid = Some(req.server_guid);
        // our sends must fit the peer's receive buffer
        self.segmenter = Segmenter::new(req.server_receive_buffer_size.max(1024) as usize);

        let plugin = if req.auth_plugins.iter().any(|p| p == &self.options.auth_plugin) {
            self.options.auth_plugin.clone()
        } else if req.auth_plugins.iter().any(|p| p == "anonymous") {
            "anonymous".to_owned()
        } else {
            req.auth_plugins.first().cloned().unwrap_or_else(|| "anonymous".to_owned())
        };

        let resp = ValidationResponse {
            client_receive_buffer_size: self.options.receive_buffer_size,
            client_registry_size: u16::MAX,
            auth_plugin: plugin,
            auth_data: None,
        };
        self.state = ConnState::Validating;
        let bytes = self.message(Command::ConnectionValidation, |w, _| resp.encode(w));
        Ok(vec![ConnAction::Send(bytes)])
    }

    fn on_authnz(&mut self, r: &mut Reader<'_>) -> Result<Vec<ConnAction>, ClientError> {
        let _ = AuthNzMessage::decode(r)?;
        // the anonymous plugin has no exchange content; answer the round
        // so plugins with server-side state can complete
        let reply = AuthNzMessage { data: None };
        let bytes = self.message(Command::AuthNz, |w, _| reply.encode(w));
        Ok(vec![ConnAction::Send(bytes)])
    }

    fn on_validated(&mut self, r: &mut Reader<'_>) -> Result<Vec<ConnAction>, ClientError> {
        let msg = ConnectionValidated::decode(r)?;
        if !msg.status.is_success() {
            self.state = ConnState::Closed;
            return Ok(vec![ConnAction::Close {
                reason: format!("connection rejected: {}", msg.status),
            }]);
        }
        self.state = ConnState::Validated;
        // a validated (re)connect resets both introspection tables
        self.registry.reset();
        let guid = self.server_guid.unwrap_or_default();
        Ok(vec![ConnAction::Validated { server_guid: guid }])
    }

    fn on_operation_reply(
        &mut self,
        command: Command,
        payload: &[u8],
        order: ByteOrder,
    ) -> Result<Vec<ConnAction>, ClientError> {
        // common prefix: request id + subcommand
        let mut peek = Reader::new(payload, order);
        let request_id = peek.get_u32()?;
        let sub = SubCommand::from_bits(peek.get_u8()?);

        let Some(entry) = self.ops.get(&request_id) else {
            tracing::debug!(request_id, ?command, "reply for unknown request id");
            return Ok(Vec::new());
        };

        let mut r = Reader::new(payload, order);

        if command == Command::GetField {
            let resp = GetFieldResponse::decode(&mut self.registry, &mut r)?;
            return Ok(vec![ConnAction::Deliver {
                request_id,
                event: OpEvent::GetField { status: resp.status, interface: resp.interface },
            }]);
        }

        if sub.contains(SubCommand::INIT) {
            let ack = OperationInitAck::decode(&mut self.registry, &mut r)?;
            if let Some(entry) = self.ops.get_mut(&request_id) {
                entry.interfaces = ack.interfaces.clone();
            }
            return Ok(vec![ConnAction::Deliver {
                request_id,
                event: OpEvent::InitAck { status: ack.status, interfaces: ack.interfaces },
            }]);
        }

        let event = match entry.kind {
            OpKind::Get => {
                let desc = structure_interface(entry, 0)?;
                let resp = DataResponse::decode(&desc, &mut r)?;
                OpEvent::Data { sub: resp.header.sub, status: resp.header.status, data: resp.data }
            }
            OpKind::Put => {
                if sub.contains(SubCommand::GET) {
                    let desc = structure_interface(entry, 0)?;
                    let resp = DataResponse::decode(&desc, &mut r)?;
                    OpEvent::Data {
                        sub: resp.header.sub,
                        status: resp.header.status,
                        data: resp.data,
                    }
                } else {
                    let header = ResponseHeader::decode(&mut r)?;
                    OpEvent::Ack { sub: header.sub, status: header.status }
                }
            }
            OpKind::PutGet => {
                let index = if sub.contains(SubCommand::GET_PUT) { 0 } else { 1 };
                let desc = structure_interface(entry, index)?;
                let resp = DataResponse::decode(&desc, &mut r)?;
                OpEvent::Data { sub: resp.header.sub, status: resp.header.status, data: resp.data }
            }
            OpKind::Process => {
                let header = ResponseHeader::decode(&mut r)?;
                OpEvent::Ack { sub: header.sub, status: header.status }
            }
            OpKind::Rpc => {
                let header = ResponseHeader::decode(&mut r)?;
                let value = if header.status.is_success() {
                    Some(RpcData::decode(&mut self.registry, &mut r)?.value)
                } else {
                    None
                };
                OpEvent::Rpc { status: header.status, value }
            }
            OpKind::Array => {
                let header = ResponseHeader::decode(&mut r)?;
                let body = if header.status.is_success() {
                    let element = entry.interfaces.first().ok_or_else(|| {
                        ClientError::Internal("array reply before init".into())
                    })?;
                    Some(ArrayResponseBody::decode(element, &mut r)?)
                } else {
                    None
                };
                OpEvent::Array { status: header.status, body }
            }
            OpKind::Monitor => {
                let desc = structure_interface(entry, 0)?;
                let msg = MonitorMessage::decode(&desc, &mut r)?;
                OpEvent::Monitor(Box::new(msg))
            }
            OpKind::GetField => unreachable!("handled above"),
        };

        Ok(vec![ConnAction::Deliver { request_id, event }])
    }

    /// Heartbeat bookkeeping: echo after an idle interval, declare the
    /// connection unresponsive after twice that.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnAction> {
        if self.state != ConnState::Validated {
            return Vec::new();
        }
        let idle = now.saturating_duration_since(self.last_rx);
        if idle >= self.options.heartbeat_interval * 2 {
            self.state = ConnState::Closed;
            return vec![ConnAction::Close { reason: "unresponsive: echo timed out".into() }];
        }
        if idle >= self.options.heartbeat_interval && !self.echo_outstanding {
            self.echo_outstanding = true;
            let echo = Echo::default();
            let bytes = self.message(Command::Echo, |w, _| echo.encode(w));
            return vec![ConnAction::Send(bytes)];
        }
        Vec::new()
    }
}

fn structure_interface(
    entry: &OpEntry,
    index: usize,
) -> Result<std::sync::Arc<pva_proto::StructDesc>, ClientError> {
    match entry.interfaces.get(index) {
        Some(FieldDesc::Structure(desc)) => Ok(desc.clone()),
        Some(_) => Err(ProtocolError::TypeMismatch { expected: "structure interface" }.into()),
        None => Err(ClientError::Internal("reply before interface negotiation".into())),
    }
}
