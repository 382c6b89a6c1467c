//! Client operation handles.
//!
//! Every operation shares one state core: a request id, the negotiated
//! interfaces, the `created → ready → in_flight → destroyed` lifecycle,
//! and a single pending completion slot (a second call while one is in
//! flight fails locally). Typed wrappers expose the per-method surface.
//!
//! Handles hold only weak references toward their channel and context;
//! dropping a handle destroys the operation, and destroy is idempotent
//! and reported exactly once.

use std::sync::{Arc, Mutex, Weak};

use pva_proto::{
    BitSet, FieldDesc, PvStructure, Status, StatusKind, StructDesc, SubCommand,
    payloads::operation::{ArrayRequest, ArrayResponseBody, MaskedData},
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    channel::ChannelInner,
    connection::{OpEvent, OpKind},
    errors::ClientError,
};

/// Events delivered to a monitor consumer, in order: updates, then
/// either an unlisten (graceful) or a disconnect.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// One subscription update.
    Update {
        /// The projected structure.
        value: PvStructure,
        /// Offsets present in `value`.
        changed: BitSet,
        /// Offsets that lost intermediate updates.
        overrun: BitSet,
    },
    /// The server ended the subscription.
    Unlisten,
    /// The transport dropped; the monitor re-arms on reconnect.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Created; interface negotiation not finished.
    Initializing,
    /// Negotiated and idle.
    Ready,
    /// One method call outstanding.
    InFlight,
    /// Waiting for reconnect to re-negotiate.
    Disconnected,
    /// Terminal.
    Destroyed,
}

struct OpState {
    phase: Phase,
    interfaces: Vec<FieldDesc>,
    pending: Option<oneshot::Sender<Result<OpEvent, ClientError>>>,
    init_waiter: Option<oneshot::Sender<Status>>,
    last_request: bool,
    monitor_started: bool,
    messages: Vec<(StatusKind, String)>,
}

/// Shared state behind every typed operation handle.
pub(crate) struct OpCore {
    pub(crate) kind: OpKind,
    pub(crate) request_id: u32,
    pub(crate) request_text: String,
    channel: Weak<ChannelInner>,
    state: Mutex<OpState>,
    monitor_tx: Option<mpsc::UnboundedSender<MonitorEvent>>,
}

impl OpCore {
    pub(crate) fn new(
        kind: OpKind,
        request_id: u32,
        request_text: String,
        channel: Weak<ChannelInner>,
        monitor_tx: Option<mpsc::UnboundedSender<MonitorEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            request_id,
            request_text,
            channel,
            state: Mutex::new(OpState {
                phase: Phase::Initializing,
                interfaces: Vec::new(),
                pending: None,
                init_waiter: None,
                last_request: false,
                monitor_started: false,
                messages: Vec::new(),
            }),
            monitor_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OpState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Install a waiter for the (re-)init acknowledgment.
    pub(crate) fn wait_init(&self) -> oneshot::Receiver<Status> {
        let (tx, rx) = oneshot::channel();
        self.lock().init_waiter = Some(tx);
        rx
    }

    pub(crate) fn interfaces(&self) -> Vec<FieldDesc> {
        self.lock().interfaces.clone()
    }

    pub(crate) fn structure_interface(&self, index: usize) -> Result<Arc<StructDesc>, ClientError> {
        match self.lock().interfaces.get(index) {
            Some(FieldDesc::Structure(desc)) => Ok(desc.clone()),
            _ => Err(ClientError::Internal("operation has no negotiated structure".into())),
        }
    }

    /// Arm the destroy-after-next-completion flag.
    pub(crate) fn set_last_request(&self) {
        self.lock().last_request = true;
    }

    fn subcommand(&self, base: SubCommand) -> SubCommand {
        if self.lock().last_request { base.with(SubCommand::DESTROY) } else { base }
    }

    /// Begin a method call: enforce single-flight and install the
    /// completion slot.
    fn begin_call(&self) -> Result<oneshot::Receiver<Result<OpEvent, ClientError>>, ClientError> {
        let mut state = self.lock();
        match state.phase {
            Phase::Destroyed => return Err(ClientError::Destroyed),
            Phase::Disconnected | Phase::Initializing => return Err(ClientError::Disconnected),
            Phase::InFlight => return Err(ClientError::AlreadyInFlight),
            Phase::Ready => {}
        }
        let (tx, rx) = oneshot::channel();
        state.phase = Phase::InFlight;
        state.pending = Some(tx);
        Ok(rx)
    }

    fn abort_call(&self) {
        let mut state = self.lock();
        if state.phase == Phase::InFlight {
            state.phase = Phase::Ready;
            state.pending = None;
        }
    }

    /// Send framed bytes through the owning channel's transport.
    fn send(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let channel = self.channel.upgrade().ok_or(ClientError::Destroyed)?;
        channel.send(bytes)
    }

    fn channel_ids(&self) -> Result<(Arc<ChannelInner>, u32), ClientError> {
        let channel = self.channel.upgrade().ok_or(ClientError::Destroyed)?;
        let sid = channel.sid().ok_or(ClientError::Disconnected)?;
        Ok((channel, sid))
    }

    /// One round-trip: encode via `f`, send, await the completion event.
    pub(crate) async fn call<F>(&self, base: SubCommand, f: F) -> Result<OpEvent, ClientError>
    where
        F: FnOnce(&Arc<ChannelInner>, u32, u32, SubCommand) -> Result<Vec<u8>, ClientError>,
    {
        let rx = self.begin_call()?;
        let sub = self.subcommand(base);
        let result = self
            .channel_ids()
            .and_then(|(channel, sid)| f(&channel, sid, self.request_id, sub))
            .and_then(|bytes| self.send(bytes));
        if let Err(e) = result {
            self.abort_call();
            return Err(e);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Cancelled),
        }
    }

    /// Skip interface negotiation (one-shot lookups like GetField).
    pub(crate) fn mark_ready(&self) {
        let mut state = self.lock();
        if state.phase == Phase::Initializing {
            state.phase = Phase::Ready;
        }
    }

    /// Route an event from the connection into this operation.
    pub(crate) fn handle_event(&self, event: OpEvent) {
        match event {
            OpEvent::InitAck { status, interfaces } => {
                let waiter;
                let restart_monitor;
                {
                    let mut state = self.lock();
                    if state.phase == Phase::Destroyed {
                        return;
                    }
                    restart_monitor = status.is_success()
                        && self.kind == OpKind::Monitor
                        && state.monitor_started;
                    if status.is_success() {
                        state.interfaces = interfaces;
                        state.phase = Phase::Ready;
                    }
                    waiter = state.init_waiter.take();
                }
                if restart_monitor {
                    if let Err(e) = self.restart_monitor() {
                        tracing::debug!(request_id = self.request_id, error = %e,
                                        "monitor restart failed");
                    }
                }
                if let Some(tx) = waiter {
                    let _ = tx.send(status);
                }
            }
            OpEvent::Monitor(msg) => self.handle_monitor(*msg),
            OpEvent::Message { kind, text } => {
                tracing::info!(request_id = self.request_id, ?kind, %text, "server message");
                self.lock().messages.push((kind, text));
            }
            other => {
                let (pending, destroy_after) = {
                    let mut state = self.lock();
                    let pending = state.pending.take();
                    if state.phase == Phase::InFlight {
                        state.phase = Phase::Ready;
                    }
                    (pending, state.last_request)
                };
                if let Some(tx) = pending {
                    let _ = tx.send(Ok(other));
                }
                if destroy_after {
                    self.destroy();
                }
            }
        }
    }

    /// Re-arm update delivery after a reconnect re-init.
    fn restart_monitor(&self) -> Result<(), ClientError> {
        let (channel, sid) = self.channel_ids()?;
        let bytes = channel.with_connection(|conn| {
            conn.encode_exec(OpKind::Monitor, sid, self.request_id, SubCommand::START)
        })?;
        channel.send(bytes)
    }

    fn handle_monitor(&self, msg: pva_proto::payloads::operation::MonitorMessage) {
        use pva_proto::payloads::operation::MonitorMessage;
        let Some(tx) = &self.monitor_tx else { return };
        match msg {
            MonitorMessage::Update { changed, value, overrun, .. } => {
                let _ = tx.send(MonitorEvent::Update { value, changed, overrun });
            }
            MonitorMessage::Unlisten { .. } => {
                let _ = tx.send(MonitorEvent::Unlisten);
            }
        }
    }

    /// Transport loss: cancel any pending call, notify monitors, and
    /// park the operation until reconnect re-initializes it.
    pub(crate) fn on_disconnect(&self) {
        let pending = {
            let mut state = self.lock();
            if state.phase == Phase::Destroyed {
                return;
            }
            state.phase = Phase::Disconnected;
            state.pending.take()
        };
        if let Some(tx) = pending {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
        if let Some(tx) = &self.monitor_tx {
            let _ = tx.send(MonitorEvent::Disconnected);
        }
    }

    /// Reconnect: back to the pre-init phase; the context re-sends INIT.
    pub(crate) fn on_reconnect(&self) {
        let mut state = self.lock();
        if state.phase != Phase::Destroyed {
            state.phase = Phase::Initializing;
        }
    }

    /// Informational messages the server attached to this request.
    pub fn take_messages(&self) -> Vec<(StatusKind, String)> {
        std::mem::take(&mut self.lock().messages)
    }

    /// Destroy: idempotent, cancels a pending call, tells the server,
    /// and unregisters from the channel.
    pub(crate) fn destroy(&self) {
        let pending = {
            let mut state = self.lock();
            if state.phase == Phase::Destroyed {
                return;
            }
            state.phase = Phase::Destroyed;
            state.pending.take()
        };
        if let Some(tx) = pending {
            let _ = tx.send(Err(ClientError::Cancelled));
        }
        if let Some(channel) = self.channel.upgrade() {
            channel.unregister_operation(self.request_id);
        }
    }
}

fn event_status(event: &OpEvent) -> Option<&Status> {
    match event {
        OpEvent::Data { status, .. }
        | OpEvent::Ack { status, .. }
        | OpEvent::Rpc { status, .. }
        | OpEvent::Array { status, .. }
        | OpEvent::GetField { status, .. } => Some(status),
        _ => None,
    }
}

fn check_event(event: OpEvent) -> Result<OpEvent, ClientError> {
    if let Some(status) = event_status(&event) {
        if !status.is_success() {
            return Err(ClientError::Server(status.clone()));
        }
    }
    Ok(event)
}

fn data_from(event: OpEvent) -> Result<(PvStructure, BitSet), ClientError> {
    match check_event(event)? {
        OpEvent::Data { data: Some(data), .. } => Ok((data.value, data.changed)),
        _ => Err(ClientError::Internal("expected a data reply".into())),
    }
}

macro_rules! handle_common {
    ($ty:ident) => {
        impl $ty {
            /// Arrange for the operation to destroy itself right after
            /// the next completion.
            pub fn set_last_request(&self) {
                self.op.set_last_request();
            }

            /// Destroy the operation (idempotent).
            pub fn destroy(&self) {
                self.op.destroy();
            }

            /// Informational messages the server sent for this request.
            pub fn take_messages(&self) -> Vec<(StatusKind, String)> {
                self.op.take_messages()
            }
        }

        impl Drop for $ty {
            fn drop(&mut self) {
                self.op.destroy();
            }
        }
    };
}

/// Read access to a channel subset.
pub struct GetOperation {
    pub(crate) op: Arc<OpCore>,
}

impl GetOperation {
    /// The negotiated (projected) structure descriptor.
    pub fn interface(&self) -> Result<Arc<StructDesc>, ClientError> {
        self.op.structure_interface(0)
    }

    /// Fetch the current value; resolves with the data and its change
    /// mask.
    pub async fn get(&self) -> Result<(PvStructure, BitSet), ClientError> {
        let event = self
            .op
            .call(SubCommand::GET, |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_exec(OpKind::Get, sid, rid, sub))
            })
            .await?;
        data_from(event)
    }
}
handle_common!(GetOperation);

/// Write access to a channel subset.
pub struct PutOperation {
    pub(crate) op: Arc<OpCore>,
}

impl PutOperation {
    /// The negotiated put-side descriptor.
    pub fn interface(&self) -> Result<Arc<StructDesc>, ClientError> {
        self.op.structure_interface(0)
    }

    /// Write the masked fields.
    pub async fn put(&self, value: PvStructure, changed: BitSet) -> Result<Status, ClientError> {
        let data = MaskedData { changed, value };
        let event = self
            .op
            .call(SubCommand::empty(), |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_put(OpKind::Put, sid, rid, sub, &data))
            })
            .await?;
        match check_event(event)? {
            OpEvent::Ack { status, .. } => Ok(status),
            _ => Err(ClientError::Internal("expected a put acknowledgment".into())),
        }
    }

    /// Read back the current put-side value.
    pub async fn get(&self) -> Result<(PvStructure, BitSet), ClientError> {
        let event = self
            .op
            .call(SubCommand::GET, |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_exec(OpKind::Put, sid, rid, sub))
            })
            .await?;
        data_from(event)
    }
}
handle_common!(PutOperation);

/// Combined write-then-read access.
pub struct PutGetOperation {
    pub(crate) op: Arc<OpCore>,
}

impl PutGetOperation {
    /// The negotiated put-side descriptor.
    pub fn put_interface(&self) -> Result<Arc<StructDesc>, ClientError> {
        self.op.structure_interface(0)
    }

    /// The negotiated get-side descriptor.
    pub fn get_interface(&self) -> Result<Arc<StructDesc>, ClientError> {
        self.op.structure_interface(1)
    }

    /// Write the put side, process, and read the get side back.
    pub async fn put_get(
        &self,
        value: PvStructure,
        changed: BitSet,
    ) -> Result<(PvStructure, BitSet), ClientError> {
        let data = MaskedData { changed, value };
        let event = self
            .op
            .call(SubCommand::empty(), |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_put(OpKind::PutGet, sid, rid, sub, &data))
            })
            .await?;
        data_from(event)
    }

    /// Read the current put-side structure.
    pub async fn get_put(&self) -> Result<(PvStructure, BitSet), ClientError> {
        let event = self
            .op
            .call(SubCommand::GET_PUT, |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_exec(OpKind::PutGet, sid, rid, sub))
            })
            .await?;
        data_from(event)
    }

    /// Read the get side without putting.
    pub async fn get_get(&self) -> Result<(PvStructure, BitSet), ClientError> {
        let event = self
            .op
            .call(SubCommand::GET, |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_exec(OpKind::PutGet, sid, rid, sub))
            })
            .await?;
        data_from(event)
    }
}
handle_common!(PutGetOperation);

/// Record processing without data transfer.
pub struct ProcessOperation {
    pub(crate) op: Arc<OpCore>,
}

impl ProcessOperation {
    /// Process the record once.
    pub async fn process(&self) -> Result<Status, ClientError> {
        let event = self
            .op
            .call(SubCommand::PROCESS, |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_exec(OpKind::Process, sid, rid, sub))
            })
            .await?;
        match check_event(event)? {
            OpEvent::Ack { status, .. } => Ok(status),
            _ => Err(ClientError::Internal("expected a process acknowledgment".into())),
        }
    }
}
handle_common!(ProcessOperation);

/// Remote procedure calls; any number of one-shot requests.
pub struct RpcOperation {
    pub(crate) op: Arc<OpCore>,
}

impl RpcOperation {
    /// Invoke with an argument structure; resolves with the response
    /// structure.
    pub async fn request(&self, args: PvStructure) -> Result<PvStructure, ClientError> {
        let event = self
            .op
            .call(SubCommand::empty(), |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_rpc(sid, rid, sub, args.clone()))
            })
            .await?;
        match check_event(event)? {
            OpEvent::Rpc { value: Some(value), .. } => Ok(value),
            _ => Err(ClientError::Internal("expected an rpc response".into())),
        }
    }
}
handle_common!(RpcOperation);

/// Slice access to an array field.
pub struct ArrayOperation {
    pub(crate) op: Arc<OpCore>,
}

impl ArrayOperation {
    /// The negotiated array element descriptor.
    pub fn element(&self) -> Result<FieldDesc, ClientError> {
        self.op
            .interfaces()
            .first()
            .cloned()
            .ok_or_else(|| ClientError::Internal("array interface not negotiated".into()))
    }

    async fn array_call(&self, req: ArrayRequest) -> Result<Option<ArrayResponseBody>, ClientError> {
        let event = self
            .op
            .call(SubCommand::empty(), |ch, sid, rid, sub| {
                ch.with_connection(|conn| conn.encode_array(sid, rid, sub, &req))
            })
            .await?;
        match check_event(event)? {
            OpEvent::Array { body, .. } => Ok(body),
            _ => Err(ClientError::Internal("expected an array reply".into())),
        }
    }

    /// Read `count` elements from `offset`; `-1` reads to the end.
    pub async fn get_slice(&self, offset: u64, count: i64) -> Result<pva_proto::PvValue, ClientError> {
        match self.array_call(ArrayRequest::GetSlice { offset, count }).await? {
            Some(ArrayResponseBody::Slice(values)) => Ok(values),
            _ => Err(ClientError::Internal("expected slice data".into())),
        }
    }

    /// Write elements starting at `offset`.
    pub async fn put_slice(
        &self,
        offset: u64,
        values: pva_proto::PvValue,
    ) -> Result<(), ClientError> {
        self.array_call(ArrayRequest::PutSlice { offset, values }).await?;
        Ok(())
    }

    /// Current length and capacity.
    pub async fn get_length(&self) -> Result<(u64, u64), ClientError> {
        match self.array_call(ArrayRequest::GetLength).await? {
            Some(ArrayResponseBody::Length { length, capacity }) => Ok((length, capacity)),
            _ => Err(ClientError::Internal("expected length data".into())),
        }
    }

    /// Resize; `-1` keeps the current length/capacity.
    pub async fn set_length(&self, length: i64, capacity: i64) -> Result<(), ClientError> {
        self.array_call(ArrayRequest::SetLength { length, capacity }).await?;
        Ok(())
    }
}
handle_common!(ArrayOperation);

/// A subscription.
pub struct MonitorOperation {
    pub(crate) op: Arc<OpCore>,
    pub(crate) events: mpsc::UnboundedReceiver<MonitorEvent>,
    pub(crate) pipeline: bool,
    pub(crate) queue_size: u32,
}

impl MonitorOperation {
    /// The negotiated (projected) structure descriptor.
    pub fn interface(&self) -> Result<Arc<StructDesc>, ClientError> {
        self.op.structure_interface(0)
    }

    /// Begin update delivery. In pipeline mode the full local queue is
    /// granted to the server as initial flow credit.
    pub fn start(&self) -> Result<(), ClientError> {
        self.op.lock().monitor_started = true;
        let (channel, sid) = self.op.channel_ids()?;
        let bytes = channel.with_connection(|conn| {
            conn.encode_exec(OpKind::Monitor, sid, self.op.request_id, SubCommand::START)
        })?;
        channel.send(bytes)?;
        if self.pipeline {
            let credit = self.queue_size as i32;
            let bytes = channel.with_connection(|conn| {
                conn.encode_monitor_ack(sid, self.op.request_id, credit)
            })?;
            channel.send(bytes)?;
        }
        Ok(())
    }

    /// Pause update delivery.
    pub fn stop(&self) -> Result<(), ClientError> {
        self.op.lock().monitor_started = false;
        let (channel, sid) = self.op.channel_ids()?;
        let bytes = channel.with_connection(|conn| {
            conn.encode_exec(OpKind::Monitor, sid, self.op.request_id, SubCommand::STOP)
        })?;
        channel.send(bytes)
    }

    /// Await the next monitor event. `None` after destroy.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        self.events.recv().await
    }

    /// Non-blocking poll of the local queue.
    pub fn poll(&mut self) -> Option<MonitorEvent> {
        self.events.try_recv().ok()
    }

    /// Release one consumed update. In pipeline mode this returns flow
    /// credit to the server.
    pub fn release(&self) -> Result<(), ClientError> {
        if !self.pipeline {
            return Ok(());
        }
        let (channel, sid) = self.op.channel_ids()?;
        let bytes = channel
            .with_connection(|conn| conn.encode_monitor_ack(sid, self.op.request_id, 1))?;
        channel.send(bytes)
    }
}
handle_common!(MonitorOperation);
