//! Per-connection server state machine.
//!
//! Owns the validation handshake, the SID-keyed channel table, and the
//! request-id-keyed operation tables. Frames go in, actions come out;
//! provider calls that are synchronous (read/write/array) happen inline,
//! while process/RPC are returned as actions for the driver to run
//! asynchronously and feed back through the `complete_*` methods.

use std::collections::HashMap;
use std::sync::Arc;

use pva_core::{FifoConfig, Guid, MonitorFifo};
use pva_proto::{
    BitSet, ByteOrder, Command, FieldDesc, Header, IntrospectionRegistry, Mapper, PvRequest,
    PvStructure, Reader, Reassembler, Role, Segmenter, Status, StatusKind, SubCommand,
    Writer,
    payloads::{
        channel::{CreateChannelRequest, CreateChannelResponse, DestroyChannel},
        operation::{
            ArrayRequest, DataResponse, GetFieldRequest, GetFieldResponse, MaskedData,
            MonitorAck, MonitorMessage, OperationInit, OperationInitAck, RequestHeader,
            RequestRef, ResponseHeader, RpcData,
        },
        session::{
            AuthNzMessage, ConnectionValidated, Echo, MessageNotify, ValidationRequest,
            ValidationResponse,
        },
    },
};

use crate::{
    auth::{AuthPlugin, AuthVerdict},
    errors::ServerError,
    provider::{ChannelRecord, ProviderRegistry},
};

/// Handshake progress of a server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SrvState {
    /// Validation request sent; waiting for the client's choice.
    AwaitValidationResponse,
    /// Mid auth exchange.
    Authenticating,
    /// Application traffic allowed.
    Validated,
    /// Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SrvOpKind {
    Get,
    Put,
    PutGet,
    Process,
    Rpc,
    Array,
    Monitor,
}

impl SrvOpKind {
    fn from_command(command: Command) -> Option<Self> {
        Some(match command {
            Command::Get => Self::Get,
            Command::Put => Self::Put,
            Command::PutGet => Self::PutGet,
            Command::Process => Self::Process,
            Command::Rpc => Self::Rpc,
            Command::Array => Self::Array,
            Command::Monitor => Self::Monitor,
            _ => return None,
        })
    }

    fn command(self) -> Command {
        match self {
            Self::Get => Command::Get,
            Self::Put => Command::Put,
            Self::PutGet => Command::PutGet,
            Self::Process => Command::Process,
            Self::Rpc => Command::Rpc,
            Self::Array => Command::Array,
            Self::Monitor => Command::Monitor,
        }
    }
}

struct ServerOp {
    kind: SrvOpKind,
    mapper: Option<Arc<Mapper>>,
    fifo: Option<MonitorFifo>,
    array_path: Option<String>,
    started: bool,
    pending_destroy: bool,
}

struct ServerChannel {
    cid: u32,
    name: String,
    record: Arc<dyn ChannelRecord>,
    ops: HashMap<u32, ServerOp>,
}

/// Actions the driver executes on behalf of the state machine.
pub enum ServerConnAction {
    /// Write framed bytes.
    Send(Vec<u8>),
    /// Tear the connection down.
    Close {
        /// Human-readable reason.
        reason: String,
    },
    /// Run `record.process()` and feed the status back through
    /// [`ServerConnection::complete_process`].
    Process {
        /// Owning channel sid.
        sid: u32,
        /// Request id.
        rid: u32,
        /// The record to process.
        record: Arc<dyn ChannelRecord>,
    },
    /// Run `record.rpc(args)` and feed the result back through
    /// [`ServerConnection::complete_rpc`].
    Rpc {
        /// Owning channel sid.
        sid: u32,
        /// Request id.
        rid: u32,
        /// The record to call.
        record: Arc<dyn ChannelRecord>,
        /// Call arguments.
        args: PvStructure,
    },
    /// Register a monitor sink with the record.
    Subscribe {
        /// Owning channel sid.
        sid: u32,
        /// Request id.
        rid: u32,
        /// Sink registration id.
        sink_id: u64,
        /// The record to subscribe to.
        record: Arc<dyn ChannelRecord>,
    },
    /// Remove a monitor sink.
    Unsubscribe {
        /// Sink registration id.
        sink_id: u64,
        /// The record to unsubscribe from.
        record: Arc<dyn ChannelRecord>,
    },
}

/// The server-side connection state machine. No I/O; the driver
/// serializes access.
pub struct ServerConnection {
    conn_id: u32,
    state: SrvState,
    send_order: ByteOrder,
    registry: IntrospectionRegistry,
    reassembler: Reassembler,
    segmenter: Segmenter,
    providers: Arc<ProviderRegistry>,
    auth_plugins: Vec<Arc<dyn AuthPlugin>>,
    active_auth: Option<usize>,
    guid: Guid,
    receive_buffer_size: u32,
    fifo_config: FifoConfig,
    next_sid: u32,
    channels: HashMap<u32, ServerChannel>,
}

impl ServerConnection {
    /// Fresh connection; [`ServerConnection::start`] produces the opening
    /// validation message.
    pub fn new(
        conn_id: u32,
        providers: Arc<ProviderRegistry>,
        auth_plugins: Vec<Arc<dyn AuthPlugin>>,
        guid: Guid,
        receive_buffer_size: u32,
    ) -> Self {
        let receive_buffer_size = receive_buffer_size.max(1024);
        Self {
            conn_id,
            state: SrvState::AwaitValidationResponse,
            send_order: ByteOrder::native(),
            registry: IntrospectionRegistry::new(),
            reassembler: Reassembler::new(),
            segmenter: Segmenter::new(receive_buffer_size as usize),
            providers,
            auth_plugins,
            active_auth: None,
            guid,
            receive_buffer_size,
            fifo_config: FifoConfig::default(),
            next_sid: 1,
            channels: HashMap::new(),
        }
    }

    fn sink_id(&self, rid: u32) -> u64 {
        (u64::from(self.conn_id) << 32) | u64::from(rid)
    }

    fn message<F>(&mut self, command: Command, build: F) -> Vec<u8>
    where
        F: FnOnce(&mut Writer<'_>, &mut IntrospectionRegistry),
    {
        let mut payload = Vec::new();
        build(&mut Writer::new(&mut payload, self.send_order), &mut self.registry);
        let mut framed = Vec::new();
        self.segmenter.write_message(
            command.to_u8(),
            Role::Server,
            self.send_order,
            &payload,
            &mut framed,
        );
        framed
    }

    /// The opening message of the handshake: buffer sizes, offered auth
    /// plugins and our GUID.
    pub fn start(&mut self) -> Vec<ServerConnAction> {
        let request = ValidationRequest {
            server_receive_buffer_size: self.receive_buffer_size,
            server_registry_size: u16::MAX,
            auth_plugins: self.auth_plugins.iter().map(|p| p.name().to_owned()).collect(),
            server_guid: *self.guid.as_bytes(),
        };
        let bytes = self.message(Command::ConnectionValidation, |w, _| request.encode(w));
        vec![ServerConnAction::Send(bytes)]
    }

    /// Tear down every channel (driver calls this when the socket dies).
    pub fn shutdown(&mut self) -> Vec<ServerConnAction> {
        self.state = SrvState::Closed;
        let mut actions = Vec::new();
        for (_, channel) in self.channels.drain() {
            for (rid, op) in channel.ops {
                if op.fifo.is_some() {
                    actions.push(ServerConnAction::Unsubscribe {
                        sink_id: (u64::from(self.conn_id) << 32) | u64::from(rid),
                        record: channel.record.clone(),
                    });
                }
            }
        }
        actions
    }

    /// Process one raw frame.
    pub fn handle_frame(
        &mut self,
        header: Header,
        payload: &[u8],
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        if self.state == SrvState::Closed {
            return Ok(Vec::new());
        }
        if header.control {
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
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        let order = header.order;
        let mut r = Reader::new(payload, order);

        let Some(command) = Command::from_u8(header.command) else {
            tracing::debug!(command = header.command, "ignoring unknown command");
            return Ok(Vec::new());
        };

        // no application message before validation succeeds
        if self.state != SrvState::Validated
            && !matches!(command, Command::ConnectionValidation | Command::AuthNz | Command::Echo)
        {
            return Ok(vec![ServerConnAction::Close {
                reason: format!("{command:?} before validation"),
            }]);
        }

        match command {
            Command::ConnectionValidation => self.on_validation_response(&mut r),
            Command::AuthNz => self.on_authnz(&mut r),
            Command::Echo => {
                let echo = Echo::decode(&mut r)?;
                let bytes = self.message(Command::Echo, |w, _| echo.encode(w));
                Ok(vec![ServerConnAction::Send(bytes)])
            }
            Command::CreateChannel => self.on_create_channel(&mut r),
            Command::DestroyChannel => self.on_destroy_channel(&mut r),
            Command::GetField => self.on_get_field(&mut r),
            Command::DestroyRequest | Command::CancelRequest => {
                let req = RequestRef::decode(&mut r)?;
                Ok(self.destroy_operation(req.channel_sid, req.request_id))
            }
            Command::Get
            | Command::Put
            | Command::PutGet
            | Command::Process
            | Command::Rpc
            | Command::Array
            | Command::Monitor => {
                let kind = SrvOpKind::from_command(command)
                    .unwrap_or(SrvOpKind::Get);
                self.on_operation(kind, payload, order)
            }
            _ => Ok(Vec::new()),
        }
    }

    // ---- handshake -----------------------------------------------------

    fn on_validation_response(
        &mut self,
        r: &mut Reader<'_>,
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        let resp = ValidationResponse::decode(r)?;
        // our sends must fit the peer's receive buffer
        self.segmenter = Segmenter::new(resp.client_receive_buffer_size.max(1024) as usize);

        let Some(index) = self
            .auth_plugins
            .iter()
            .position(|p| p.name() == resp.auth_plugin)
        else {
            return Ok(self.reject(format!("unknown auth plugin '{}'", resp.auth_plugin)));
        };

        let verdict = self.auth_plugins[index].begin(resp.auth_data.as_ref());
        self.active_auth = Some(index);
        Ok(self.apply_auth_verdict(verdict))
    }

    fn on_authnz(&mut self, r: &mut Reader<'_>) -> Result<Vec<ServerConnAction>, ServerError> {
        let msg = AuthNzMessage::decode(r)?;
        let Some(index) = self.active_auth else {
            return Ok(self.reject("auth exchange without a selected plugin".into()));
        };
        let verdict = self.auth_plugins[index].on_exchange(msg.data.as_ref());
        Ok(self.apply_auth_verdict(verdict))
    }

    fn apply_auth_verdict(&mut self, verdict: AuthVerdict) -> Vec<ServerConnAction> {
        match verdict {
            AuthVerdict::Accept => {
                self.state = SrvState::Validated;
                // a validated connection starts with clean introspection
                // tables on both sides
                self.registry.reset();
                let msg = ConnectionValidated { status: Status::ok() };
                let bytes = self.message(Command::ConnectionValidated, |w, _| msg.encode(w));
                vec![ServerConnAction::Send(bytes)]
            }
            AuthVerdict::Challenge(data) => {
                self.state = SrvState::Authenticating;
                let msg = AuthNzMessage { data };
                let bytes = self.message(Command::AuthNz, |w, _| msg.encode(w));
                vec![ServerConnAction::Send(bytes)]
            }
            AuthVerdict::Reject(reason) => self.reject(reason),
        }
    }

    /// Authorization failures reject the connection, never silently
    /// continue without the plugin.
    fn reject(&mut self, reason: String) -> Vec<ServerConnAction> {
        self.state = SrvState::Closed;
        let msg = ConnectionValidated { status: Status::error(reason.clone()) };
        let bytes = self.message(Command::ConnectionValidated, |w, _| msg.encode(w));
        vec![ServerConnAction::Send(bytes), ServerConnAction::Close { reason }]
    }

    // ---- channels ------------------------------------------------------

    fn on_create_channel(
        &mut self,
        r: &mut Reader<'_>,
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        let req = CreateChannelRequest::decode(r)?;
        let mut actions = Vec::new();
        for (cid, name) in req.channels {
            let response = match self.providers.lookup(&name) {
                Some(record) => {
                    let sid = self.next_sid;
                    self.next_sid = self.next_sid.wrapping_add(1).max(1);
                    self.channels.insert(
                        sid,
                        ServerChannel { cid, name: name.clone(), record, ops: HashMap::new() },
                    );
                    tracing::debug!(cid, sid, %name, "channel created");
                    CreateChannelResponse { client_id: cid, server_id: sid, status: Status::ok() }
                }
                None => CreateChannelResponse {
                    client_id: cid,
                    server_id: 0,
                    status: Status::error(format!("channel '{name}' not found")),
                },
            };
            let bytes = self.message(Command::CreateChannel, |w, _| response.encode(w));
            actions.push(ServerConnAction::Send(bytes));
        }
        Ok(actions)
    }

    fn on_destroy_channel(
        &mut self,
        r: &mut Reader<'_>,
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        let req = DestroyChannel::decode(r)?;
        let mut actions = Vec::new();
        if let Some(channel) = self.channels.remove(&req.server_id) {
            for (rid, op) in channel.ops {
                if op.fifo.is_some() {
                    actions.push(ServerConnAction::Unsubscribe {
                        sink_id: (u64::from(self.conn_id) << 32) | u64::from(rid),
                        record: channel.record.clone(),
                    });
                }
            }
            tracing::debug!(sid = req.server_id, name = %channel.name, "channel destroyed");
        }
        let bytes = self.message(Command::DestroyChannel, |w, _| req.encode(w));
        actions.push(ServerConnAction::Send(bytes));
        Ok(actions)
    }

    fn on_get_field(&mut self, r: &mut Reader<'_>) -> Result<Vec<ServerConnAction>, ServerError> {
        let req = GetFieldRequest::decode(r)?;
        let response = match self.channels.get(&req.channel_sid) {
            None => GetFieldResponse {
                request_id: req.request_id,
                status: Status::error("channel not found"),
                interface: None,
            },
            Some(channel) => {
                let desc = channel.record.descriptor();
                let interface = if req.subfield.is_empty() {
                    Some(FieldDesc::Structure(desc))
                } else {
                    desc.descriptor_of(&req.subfield).cloned()
                };
                match interface {
                    Some(interface) => GetFieldResponse {
                        request_id: req.request_id,
                        status: Status::ok(),
                        interface: Some(interface),
                    },
                    None => GetFieldResponse {
                        request_id: req.request_id,
                        status: Status::error(format!("no field '{}'", req.subfield)),
                        interface: None,
                    },
                }
            }
        };
        let bytes = self.message(Command::GetField, |w, registry| response.encode(registry, w));
        Ok(vec![ServerConnAction::Send(bytes)])
    }

    // ---- operations ----------------------------------------------------

    fn on_operation(
        &mut self,
        kind: SrvOpKind,
        payload: &[u8],
        order: ByteOrder,
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        let mut r = Reader::new(payload, order);
        let prefix = RequestHeader::decode(&mut r)?;
        let sid = prefix.channel_sid;
        let rid = prefix.request_id;
        let sub = prefix.sub;

        if !self.channels.contains_key(&sid) {
            return Ok(vec![self.error_reply(kind, rid, sub, "channel not found")]);
        }

        if sub.contains(SubCommand::INIT) {
            let mut r = Reader::new(payload, order);
            let init = OperationInit::decode(&mut r)?;
            return Ok(self.init_operation(kind, sid, rid, &init.request));
        }

        let mut actions = self.exec_operation(kind, sid, rid, sub, &mut r)?;

        if sub.contains(SubCommand::DESTROY) {
            let is_async = {
                let op = self
                    .channels
                    .get(&sid)
                    .and_then(|c| c.ops.get(&rid));
                op.is_some_and(|op| matches!(op.kind, SrvOpKind::Process | SrvOpKind::Rpc))
            };
            if is_async {
                // destroy after the async completion is encoded
                if let Some(op) =
                    self.channels.get_mut(&sid).and_then(|c| c.ops.get_mut(&rid))
                {
                    op.pending_destroy = true;
                }
            } else {
                actions.extend(self.destroy_operation(sid, rid));
            }
        }

        Ok(actions)
    }

    fn init_operation(
        &mut self,
        kind: SrvOpKind,
        sid: u32,
        rid: u32,
        request_text: &str,
    ) -> Vec<ServerConnAction> {
        let request = match PvRequest::parse(request_text) {
            Ok(request) => request,
            Err(e) => {
                let ack = OperationInitAck {
                    request_id: rid,
                    status: Status::error(e.to_string()),
                    interfaces: Vec::new(),
                };
                let bytes =
                    self.message(kind.command(), |w, registry| ack.encode(registry, w));
                return vec![ServerConnAction::Send(bytes)];
            }
        };

        let Some(channel) = self.channels.get(&sid) else {
            return vec![self.error_reply(kind, rid, SubCommand::INIT, "channel not found")];
        };
        let record = channel.record.clone();
        let desc = record.descriptor();

        let mut warnings: Vec<String> = request.warnings.clone();
        let mut interfaces = Vec::new();
        let mut status = Status::ok();
        let mut op = ServerOp {
            kind,
            mapper: None,
            fifo: None,
            array_path: None,
            started: false,
            pending_destroy: false,
        };
        let mut subscribe = false;

        match kind {
            SrvOpKind::Get | SrvOpKind::Put | SrvOpKind::PutGet => {
                match Mapper::compute(&desc, &request) {
                    Ok(mapper) => {
                        warnings.extend_from_slice(mapper.warnings());
                        let iface = FieldDesc::Structure(mapper.requested().clone());
                        interfaces.push(iface.clone());
                        if kind == SrvOpKind::PutGet {
                            interfaces.push(iface);
                        }
                        op.mapper = Some(Arc::new(mapper));
                    }
                    Err(e) => status = Status::error(e.to_string()),
                }
            }
            SrvOpKind::Process | SrvOpKind::Rpc => {}
            SrvOpKind::Array => match array_element(&desc, &request) {
                Ok((path, element)) => {
                    interfaces.push(element);
                    op.array_path = Some(path);
                }
                Err(e) => status = e,
            },
            SrvOpKind::Monitor => {
                let mut fifo = MonitorFifo::new(request.clone(), &self.fifo_config);
                match fifo.open(&desc) {
                    Ok(more) => warnings.extend(more),
                    Err(e) => status = Status::error(e.to_string()),
                }
                let notes = fifo.take_notifications();
                if let Some((connect_status, requested)) = notes.connected {
                    if connect_status.is_success() {
                        if let Some(requested) = requested {
                            interfaces.push(FieldDesc::Structure(requested));
                        }
                        subscribe = true;
                    } else {
                        status = connect_status;
                    }
                }
                op.fifo = Some(fifo);
            }
        }

        let mut actions = Vec::new();
        let ok = status.is_success();
        let ack = OperationInitAck { request_id: rid, status, interfaces };
        let bytes = self.message(kind.command(), |w, registry| ack.encode(registry, w));
        actions.push(ServerConnAction::Send(bytes));

        for warning in warnings {
            let note = MessageNotify {
                request_id: rid,
                kind: StatusKind::Warning,
                message: warning,
            };
            let bytes = self.message(Command::Message, |w, _| note.encode(w));
            actions.push(ServerConnAction::Send(bytes));
        }

        if ok {
            if let Some(channel) = self.channels.get_mut(&sid) {
                channel.ops.insert(rid, op);
            }
            if subscribe {
                actions.push(ServerConnAction::Subscribe {
                    sid,
                    rid,
                    sink_id: self.sink_id(rid),
                    record,
                });
            }
        }
        actions
    }

    fn exec_operation(
        &mut self,
        kind: SrvOpKind,
        sid: u32,
        rid: u32,
        sub: SubCommand,
        r: &mut Reader<'_>,
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        let Some(channel) = self.channels.get(&sid) else {
            return Ok(vec![self.error_reply(kind, rid, sub, "channel not found")]);
        };
        if !channel.ops.contains_key(&rid) {
            return Ok(vec![self.error_reply(kind, rid, sub, "request not initialized")]);
        }
        let record = channel.record.clone();

        match kind {
            SrvOpKind::Get => {
                let reply = self.read_reply(sid, rid, sub, &record)?;
                Ok(vec![reply])
            }
            SrvOpKind::Put => {
                if sub.contains(SubCommand::GET) {
                    let reply = self.read_reply(sid, rid, sub, &record)?;
                    return Ok(vec![reply]);
                }
                let status = self.apply_put(sid, rid, &record, r)?;
                let header = ResponseHeader::new(rid, sub, status);
                let bytes = self.message(Command::Put, |w, _| header.encode(w));
                Ok(vec![ServerConnAction::Send(bytes)])
            }
            SrvOpKind::PutGet => {
                if !sub.contains(SubCommand::GET) && !sub.contains(SubCommand::GET_PUT) {
                    let status = self.apply_put(sid, rid, &record, r)?;
                    if !status.is_success() {
                        let header = ResponseHeader::new(rid, sub, status);
                        let bytes = self.message(Command::PutGet, |w, _| header.encode(w));
                        return Ok(vec![ServerConnAction::Send(bytes)]);
                    }
                }
                let reply = self.read_reply(sid, rid, sub, &record)?;
                Ok(vec![reply])
            }
            SrvOpKind::Process => Ok(vec![ServerConnAction::Process { sid, rid, record }]),
            SrvOpKind::Rpc => {
                let args = RpcData::decode(&mut self.registry, r)?.value;
                Ok(vec![ServerConnAction::Rpc { sid, rid, record, args }])
            }
            SrvOpKind::Array => self.exec_array(sid, rid, sub, &record, r),
            SrvOpKind::Monitor => Ok(self.exec_monitor(sid, rid, sub, &record, r)),
        }
    }

    /// Encode a Get-style data reply from the record's current value.
    fn read_reply(
        &mut self,
        sid: u32,
        rid: u32,
        sub: SubCommand,
        record: &Arc<dyn ChannelRecord>,
    ) -> Result<ServerConnAction, ServerError> {
        let (mapper, kind) = match self.channels.get(&sid).and_then(|c| c.ops.get(&rid)) {
            Some(op) => (op.mapper.clone(), op.kind),
            None => {
                return Ok(self.error_reply(SrvOpKind::Get, rid, sub, "request not initialized"));
            }
        };
        let Some(mapper) = mapper else {
            return Ok(self.error_reply(kind, rid, sub, "operation carries no data"));
        };

        let (value, mask) = record.read();
        let mut projected = mapper.build_requested();
        let mut changed = BitSet::new();
        mapper.copy_to_requested(&value, &mask, &mut projected, &mut changed);

        let resp = DataResponse {
            header: ResponseHeader::new(rid, sub, Status::ok()),
            data: Some(MaskedData { changed, value: projected }),
        };
        let bytes = self.message(kind.command(), |w, _| resp.encode(w));
        Ok(ServerConnAction::Send(bytes))
    }

    /// Decode a put payload and write it through the mapper.
    fn apply_put(
        &mut self,
        sid: u32,
        rid: u32,
        record: &Arc<dyn ChannelRecord>,
        r: &mut Reader<'_>,
    ) -> Result<Status, ServerError> {
        let Some(op) = self.channels.get(&sid).and_then(|c| c.ops.get(&rid)) else {
            return Ok(Status::error("request not initialized"));
        };
        let Some(mapper) = op.mapper.clone() else {
            return Ok(Status::error("operation carries no data"));
        };

        let data = MaskedData::decode(mapper.requested(), r)?;
        let (mut current, _) = record.read();
        let mut src_changed = BitSet::new();
        mapper.copy_to_source(&data.value, &data.changed, &mut current, &mut src_changed);
        Ok(record.write(&current, &src_changed))
    }

    fn exec_array(
        &mut self,
        sid: u32,
        rid: u32,
        sub: SubCommand,
        record: &Arc<dyn ChannelRecord>,
        r: &mut Reader<'_>,
    ) -> Result<Vec<ServerConnAction>, ServerError> {
        let (path, element) = {
            let Some(op) = self.channels.get(&sid).and_then(|c| c.ops.get(&rid)) else {
                return Ok(vec![self.error_reply(SrvOpKind::Array, rid, sub,
                                                "request not initialized")]);
            };
            let Some(path) = op.array_path.clone() else {
                return Ok(vec![self.error_reply(SrvOpKind::Array, rid, sub,
                                                "not an array operation")]);
            };
            let desc = record.descriptor();
            let Some(element) = desc.descriptor_of(&path).cloned() else {
                return Ok(vec![self.error_reply(SrvOpKind::Array, rid, sub,
                                                "array field vanished")]);
            };
            (path, element)
        };

        let request = ArrayRequest::decode(&element, r)?;
        let (current, _) = record.read();
        let Some(field) = current.get(&path).cloned() else {
            return Ok(vec![self.error_reply(SrvOpKind::Array, rid, sub, "array field missing")]);
        };

        let outcome = crate::array_ops::apply(field, &request);
        let (status, body, writeback) = match outcome {
            Ok((body, writeback)) => (Status::ok(), Some(body), writeback),
            Err(message) => (Status::error(message), None, None),
        };

        if let Some(new_field) = writeback {
            let desc = record.descriptor();
            if let Some(offset) = desc.offset_of(&path) {
                let mut updated = current;
                if let Some(slot) = updated.value_at_offset_mut(offset) {
                    *slot = new_field;
                }
                record.write(&updated, &BitSet::from_bits([offset]));
            }
        }

        let header = ResponseHeader::new(rid, sub, status);
        let bytes = self.message(Command::Array, |w, _| {
            header.encode(w);
            if let Some(body) = &body {
                body.encode(w);
            }
        });
        Ok(vec![ServerConnAction::Send(bytes)])
    }

    fn exec_monitor(
        &mut self,
        sid: u32,
        rid: u32,
        sub: SubCommand,
        record: &Arc<dyn ChannelRecord>,
        r: &mut Reader<'_>,
    ) -> Vec<ServerConnAction> {
        let Some(op) = self.channels.get_mut(&sid).and_then(|c| c.ops.get_mut(&rid)) else {
            return Vec::new();
        };
        let Some(fifo) = op.fifo.as_mut() else {
            return Vec::new();
        };

        if sub.contains(SubCommand::ACK) {
            if let Ok(ack) = MonitorAck::decode(r) {
                if let Some(free) = fifo.report_remote_queue_status(ack.nfree) {
                    tracing::trace!(rid, free, "monitor free-high-mark crossed");
                }
            }
            return self.drain_monitor(sid, rid);
        }
        if sub.contains(SubCommand::START) {
            let first_start = !op.started;
            op.started = true;
            let _ = fifo.start();
            if first_start {
                // the subscription opens with the current value
                let (value, _mask) = record.read();
                fifo.post(&value, &BitSet::from_bits([0]), &BitSet::new());
            }
            return self.drain_monitor(sid, rid);
        }
        if sub.contains(SubCommand::STOP) {
            op.started = false;
            fifo.stop();
        }
        Vec::new()
    }

    /// Push a record update into a monitor's FIFO and flush what the
    /// client may receive.
    pub fn monitor_post(
        &mut self,
        sid: u32,
        rid: u32,
        value: &PvStructure,
        changed: &BitSet,
        overrun: &BitSet,
    ) -> Vec<ServerConnAction> {
        let Some(op) = self.channels.get_mut(&sid).and_then(|c| c.ops.get_mut(&rid)) else {
            return Vec::new();
        };
        let Some(fifo) = op.fifo.as_mut() else {
            return Vec::new();
        };
        fifo.post(value, changed, overrun);
        self.drain_monitor(sid, rid)
    }

    fn drain_monitor(&mut self, sid: u32, rid: u32) -> Vec<ServerConnAction> {
        let mut updates = Vec::new();
        let unlisten;
        {
            let Some(op) = self.channels.get_mut(&sid).and_then(|c| c.ops.get_mut(&rid)) else {
                return Vec::new();
            };
            if !op.started {
                return Vec::new();
            }
            let Some(fifo) = op.fifo.as_mut() else {
                return Vec::new();
            };
            while let Some(elem) = fifo.poll_for_send() {
                updates.push(MonitorMessage::Update {
                    request_id: rid,
                    changed: elem.changed.clone(),
                    value: elem.value.clone(),
                    overrun: elem.overrun.clone(),
                });
                if let Some(free) = fifo.release(elem) {
                    tracing::trace!(rid, free, "monitor free-high-mark crossed");
                }
            }
            let notes = fifo.take_notifications();
            unlisten = notes.unlisten;
        }

        let mut actions = Vec::new();
        for update in updates {
            let bytes = self.message(Command::Monitor, |w, _| update.encode(w));
            actions.push(ServerConnAction::Send(bytes));
        }
        if unlisten {
            let msg = MonitorMessage::Unlisten { request_id: rid };
            let bytes = self.message(Command::Monitor, |w, _| msg.encode(w));
            actions.push(ServerConnAction::Send(bytes));
        }
        actions
    }

    /// Async process finished; encode the acknowledgment.
    pub fn complete_process(
        &mut self,
        sid: u32,
        rid: u32,
        status: Status,
    ) -> Vec<ServerConnAction> {
        let Some(op) = self.channels.get(&sid).and_then(|c| c.ops.get(&rid)) else {
            return Vec::new(); // destroyed mid-flight
        };
        let destroy = op.pending_destroy;
        let header = ResponseHeader::new(rid, SubCommand::PROCESS, status);
        let bytes = self.message(Command::Process, |w, _| header.encode(w));
        let mut actions = vec![ServerConnAction::Send(bytes)];
        if destroy {
            actions.extend(self.destroy_operation(sid, rid));
        }
        actions
    }

    /// Async RPC finished; encode the result (or the failure status).
    pub fn complete_rpc(
        &mut self,
        sid: u32,
        rid: u32,
        result: Result<PvStructure, Status>,
    ) -> Vec<ServerConnAction> {
        let Some(op) = self.channels.get(&sid).and_then(|c| c.ops.get(&rid)) else {
            return Vec::new();
        };
        let destroy = op.pending_destroy;
        let bytes = match result {
            Ok(value) => {
                let header = ResponseHeader::new(rid, SubCommand::empty(), Status::ok());
                let data = RpcData { value };
                self.message(Command::Rpc, |w, registry| {
                    header.encode(w);
                    data.encode(registry, w);
                })
            }
            Err(status) => {
                let header = ResponseHeader::new(rid, SubCommand::empty(), status);
                self.message(Command::Rpc, |w, _| header.encode(w))
            }
        };
        let mut actions = vec![ServerConnAction::Send(bytes)];
        if destroy {
            actions.extend(self.destroy_operation(sid, rid));
        }
        actions
    }

    fn destroy_operation(&mut self, sid: u32, rid: u32) -> Vec<ServerConnAction> {
        let Some(channel) = self.channels.get_mut(&sid) else {
            return Vec::new();
        };
        let Some(op) = channel.ops.remove(&rid) else {
            return Vec::new();
        };
        if op.fifo.is_some() {
            return vec![ServerConnAction::Unsubscribe {
                sink_id: (u64::from(self.conn_id) << 32) | u64::from(rid),
                record: channel.record.clone(),
            }];
        }
        Vec::new()
    }

    fn error_reply(
        &mut self,
        kind: SrvOpKind,
        rid: u32,
        sub: SubCommand,
        message: &str,
    ) -> ServerConnAction {
        let header = ResponseHeader::new(rid, sub, Status::error(message));
        let bytes = self.message(kind.command(), |w, _| header.encode(w));
        ServerConnAction::Send(bytes)
    }

    /// Number of live channels (diagnostics).
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn array_element(
    desc: &Arc<pva_proto::StructDesc>,
    request: &PvRequest,
) -> Result<(String, FieldDesc), Status> {
    let Some(path) = request.fields.first() else {
        return Err(Status::error("array operation requires a field selection"));
    };
    let Some(element) = desc.descriptor_of(path) else {
        return Err(Status::error(format!("no field '{path}'")));
    };
    match element {
        FieldDesc::ScalarArray(_) | FieldDesc::BoundedArray(_, _) => {
            Ok((path.clone(), element.clone()))
        }
        _ => Err(Status::error(format!("field '{path}' is not an array"))),
    }
}

#[cfg(test)]
mod tests {
    use pva_proto::{PvValue, ScalarKind, StructDesc};

    use crate::{
        auth::AnonymousAuth,
        memory::{MemoryProvider, MemoryRecord},
        provider::Provider,
    };

    use super::*;

    fn test_providers() -> (Arc<ProviderRegistry>, Arc<MemoryRecord>) {
        let provider = MemoryProvider::new("memory");
        let record = MemoryRecord::new(
            StructDesc::builder("counter_t")
                .field("value", FieldDesc::scalar(ScalarKind::I32))
                .build(),
        );
        record.post_field("value", 42i32.into());
        provider.insert("int1", record.clone());
        let providers: Vec<Arc<dyn Provider>> = vec![provider];
        let registry = ProviderRegistry::new(providers, &[]);
        (Arc::new(registry), record)
    }

    fn new_connection() -> (ServerConnection, Arc<MemoryRecord>) {
        let (providers, record) = test_providers();
        let conn = ServerConnection::new(
            1,
            providers,
            vec![Arc::new(AnonymousAuth)],
            Guid([1; 12]),
            1 << 16,
        );
        (conn, record)
    }

    fn client_frame(command: Command, build: impl FnOnce(&mut Writer<'_>)) -> (Header, Vec<u8>) {
        let order = ByteOrder::Big;
        let mut payload = Vec::new();
        build(&mut Writer::new(&mut payload, order));
        (
            Header::data(command.to_u8(), Role::Client, order, payload.len() as u32),
            payload,
        )
    }

    /// Decode a Send action back into (header, payload).
    fn sent(action: &ServerConnAction) -> (Header, Vec<u8>) {
        let ServerConnAction::Send(bytes) = action else {
            panic!("expected a send action");
        };
        let (header, total) = Header::peek_frame(bytes).unwrap().unwrap();
        assert_eq!(total, bytes.len());
        (header, bytes[pva_proto::HEADER_SIZE..].to_vec())
    }

    fn validate(conn: &mut ServerConnection) {
        let actions = conn.start();
        let (header, _) = sent(&actions[0]);
        assert_eq!(header.command, Command::ConnectionValidation.to_u8());

        let (header, payload) = client_frame(Command::ConnectionValidation, |w| {
            ValidationResponse {
                client_receive_buffer_size: 1 << 16,
                client_registry_size: 128,
                auth_plugin: "anonymous".into(),
                auth_data: None,
            }
            .encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        assert_eq!(header.command, Command::ConnectionValidated.to_u8());
        let validated =
            ConnectionValidated::decode(&mut Reader::new(&payload, header.order)).unwrap();
        assert!(validated.status.is_success());
    }

    fn create_channel(conn: &mut ServerConnection, cid: u32, name: &str) -> u32 {
        let (header, payload) = client_frame(Command::CreateChannel, |w| {
            CreateChannelRequest { channels: vec![(cid, name.into())] }.encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        let resp =
            CreateChannelResponse::decode(&mut Reader::new(&payload, header.order)).unwrap();
        assert_eq!(resp.client_id, cid);
        assert!(resp.status.is_success(), "create failed: {}", resp.status);
        resp.server_id
    }

    #[test]
    fn unknown_auth_plugin_is_rejected() {
        let (mut conn, _record) = new_connection();
        let _ = conn.start();

        let (header, payload) = client_frame(Command::ConnectionValidation, |w| {
            ValidationResponse {
                client_receive_buffer_size: 1 << 16,
                client_registry_size: 128,
                auth_plugin: "kerberos".into(),
                auth_data: None,
            }
            .encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        assert_eq!(header.command, Command::ConnectionValidated.to_u8());
        let validated =
            ConnectionValidated::decode(&mut Reader::new(&payload, header.order)).unwrap();
        assert!(!validated.status.is_success());
        assert!(matches!(actions[1], ServerConnAction::Close { .. }));
    }

    #[test]
    fn application_traffic_before_validation_closes() {
        let (mut conn, _record) = new_connection();
        let _ = conn.start();

        let (header, payload) = client_frame(Command::CreateChannel, |w| {
            CreateChannelRequest { channels: vec![(1, "int1".into())] }.encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        assert!(matches!(actions[0], ServerConnAction::Close { .. }));
    }

    #[test]
    fn create_looks_up_providers_and_allocates_sids() {
        let (mut conn, _record) = new_connection();
        validate(&mut conn);

        let sid = create_channel(&mut conn, 5, "int1");
        assert_ne!(sid, 0);
        assert_eq!(conn.channel_count(), 1);

        // unknown channels get an error status, not silence
        let (header, payload) = client_frame(Command::CreateChannel, |w| {
            CreateChannelRequest { channels: vec![(6, "missing".into())] }.encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        let resp =
            CreateChannelResponse::decode(&mut Reader::new(&payload, header.order)).unwrap();
        assert!(!resp.status.is_success());
        assert_eq!(resp.server_id, 0);
    }

    #[test]
    fn get_negotiates_and_reads() {
        let (mut conn, _record) = new_connection();
        validate(&mut conn);
        let sid = create_channel(&mut conn, 1, "int1");

        // INIT
        let (header, payload) = client_frame(Command::Get, |w| {
            OperationInit {
                header: RequestHeader::new(sid, 9, SubCommand::INIT),
                request: "field(value)".into(),
            }
            .encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        let mut registry = IntrospectionRegistry::new();
        let ack =
            OperationInitAck::decode(&mut registry, &mut Reader::new(&payload, header.order))
                .unwrap();
        assert!(ack.status.is_success());
        let desc = match &ack.interfaces[..] {
            [FieldDesc::Structure(desc)] => desc.clone(),
            other => panic!("unexpected interfaces: {other:?}"),
        };

        // EXEC
        let (header, payload) = client_frame(Command::Get, |w| {
            RequestHeader::new(sid, 9, SubCommand::GET).encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        let resp = DataResponse::decode(&desc, &mut Reader::new(&payload, header.order)).unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data.value.get("value").and_then(PvValue::as_i32), Some(42));
        assert_eq!(data.changed, BitSet::from_bits([0, 1]));
    }

    #[test]
    fn echo_mirrors_its_payload() {
        let (mut conn, _record) = new_connection();
        validate(&mut conn);

        let (header, payload) = client_frame(Command::Echo, |w| {
            Echo { payload: vec![1, 2, 3] }.encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        assert_eq!(header.command, Command::Echo.to_u8());
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[test]
    fn monitor_start_delivers_the_current_value() {
        let (mut conn, record) = new_connection();
        validate(&mut conn);
        let sid = create_channel(&mut conn, 1, "int1");

        let (header, payload) = client_frame(Command::Monitor, |w| {
            OperationInit {
                header: RequestHeader::new(sid, 3, SubCommand::INIT),
                request: "field(value)".into(),
            }
            .encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let mut registry = IntrospectionRegistry::new();
        let (header, payload) = sent(&actions[0]);
        let ack =
            OperationInitAck::decode(&mut registry, &mut Reader::new(&payload, header.order))
                .unwrap();
        assert!(ack.status.is_success());
        let [FieldDesc::Structure(desc)] = &ack.interfaces[..] else {
            panic!("expected one structure interface");
        };
        let desc = desc.clone();
        assert!(actions.iter().any(|a| matches!(a, ServerConnAction::Subscribe { .. })));

        // START: the current value comes straight out of the queue
        let (header, payload) = client_frame(Command::Monitor, |w| {
            RequestHeader::new(sid, 3, SubCommand::START).encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        let (header, payload) = sent(&actions[0]);
        let msg = MonitorMessage::decode(&desc, &mut Reader::new(&payload, header.order)).unwrap();
        let MonitorMessage::Update { value, .. } = msg else {
            panic!("expected an update");
        };
        assert_eq!(value.get("value").and_then(PvValue::as_i32), Some(42));

        // a record post flows through monitor_post
        let (snapshot, mask) = {
            record.post_field("value", 43i32.into());
            (record.snapshot(), BitSet::from_bits([1]))
        };
        let actions = conn.monitor_post(sid, 3, &snapshot, &mask, &BitSet::new());
        let (header, payload) = sent(&actions[0]);
        let msg = MonitorMessage::decode(&desc, &mut Reader::new(&payload, header.order)).unwrap();
        let MonitorMessage::Update { value, .. } = msg else {
            panic!("expected an update");
        };
        assert_eq!(value.get("value").and_then(PvValue::as_i32), Some(43));
    }

    #[test]
    fn destroy_channel_unsubscribes_monitors() {
        let (mut conn, _record) = new_connection();
        validate(&mut conn);
        let sid = create_channel(&mut conn, 1, "int1");

        let (header, payload) = client_frame(Command::Monitor, |w| {
            OperationInit {
                header: RequestHeader::new(sid, 3, SubCommand::INIT),
                request: "field(value)".into(),
            }
            .encode(w);
        });
        conn.handle_frame(header, &payload).unwrap();

        let (header, payload) = client_frame(Command::DestroyChannel, |w| {
            DestroyChannel { server_id: sid, client_id: 1 }.encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        assert!(actions.iter().any(|a| matches!(a, ServerConnAction::Unsubscribe { .. })));
        assert_eq!(conn.channel_count(), 0);
    }

    #[test]
    fn process_and_rpc_become_async_actions() {
        let (mut conn, _record) = new_connection();
        validate(&mut conn);
        let sid = create_channel(&mut conn, 1, "int1");

        for (command, rid) in [(Command::Process, 10), (Command::Rpc, 11)] {
            let (header, payload) = client_frame(command, |w| {
                OperationInit {
                    header: RequestHeader::new(sid, rid, SubCommand::INIT),
                    request: String::new(),
                }
                .encode(w);
            });
            conn.handle_frame(header, &payload).unwrap();
        }

        let (header, payload) = client_frame(Command::Process, |w| {
            RequestHeader::new(sid, 10, SubCommand::PROCESS).encode(w);
        });
        let actions = conn.handle_frame(header, &payload).unwrap();
        assert!(matches!(actions[0], ServerConnAction::Process { sid: s, rid: 10, .. } if s == sid));

        // the completion encodes the acknowledgment
        let actions = conn.complete_process(sid, 10, Status::ok());
        let (header, payload) = sent(&actions[0]);
        assert_eq!(header.command, Command::Process.to_u8());
        let resp = ResponseHeader::decode(&mut Reader::new(&payload, header.order)).unwrap();
        assert_eq!(resp.request_id, 10);
        assert!(resp.status.is_success());
    }
}
