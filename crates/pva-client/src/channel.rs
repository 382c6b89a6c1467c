//! Client channel handles.
//!
//! A channel is a durable handle bound to a name, priority and provider.
//! It survives transport loss: operations created on it park on
//! disconnect and re-negotiate on the next connect. Destroy is terminal
//! and tears down the operations first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use pva_proto::{FieldDesc, PvRequest, SubCommand};
use tokio::sync::{mpsc, watch};

use crate::{
    ContextInner,
    connection::{ClientConnection, OpEvent, OpKind},
    errors::ClientError,
    operations::{
        ArrayOperation, GetOperation, MonitorEvent, MonitorOperation, OpCore, ProcessOperation,
        PutGetOperation, PutOperation, RpcOperation,
    },
    transport::Transport,
};

/// Connection state of a client channel. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Searching; never connected so far.
    NeverConnected,
    /// Bound to a server.
    Connected,
    /// Lost its transport; searching again.
    Disconnected,
    /// Terminal.
    Destroyed,
}

pub(crate) struct ChannelInner {
    pub(crate) cid: u32,
    pub(crate) name: String,
    pub(crate) priority: u8,
    ctx: Weak<ContextInner>,
    state_tx: watch::Sender<ChannelState>,
    sid: Mutex<Option<u32>>,
    transport: Mutex<Option<Weak<Transport>>>,
    ops: Mutex<HashMap<u32, Arc<OpCore>>>,
}

impl ChannelInner {
    pub(crate) fn new(cid: u32, name: String, priority: u8, ctx: Weak<ContextInner>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::NeverConnected);
        Arc::new(Self {
            cid,
            name,
            priority,
            ctx,
            state_tx,
            sid: Mutex::new(None),
            transport: Mutex::new(None),
            ops: Mutex::new(HashMap::new()),
        })
    }

    fn ctx(&self) -> Result<Arc<ContextInner>, ClientError> {
        self.ctx.upgrade().ok_or(ClientError::Destroyed)
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn sid(&self) -> Option<u32> {
        *lock(&self.sid)
    }

    /// Bind to a transport after `CreateChannelResponse` succeeded, then
    /// re-negotiate every surviving operation.
    pub(crate) fn set_connected(self: &Arc<Self>, sid: u32, transport: &Arc<Transport>) {
        if self.state() == ChannelState::Destroyed {
            return;
        }
        *lock(&self.sid) = Some(sid);
        *lock(&self.transport) = Some(Arc::downgrade(transport));
        self.state_tx.send_replace(ChannelState::Connected);

        let ops: Vec<Arc<OpCore>> = lock(&self.ops).values().cloned().collect();
        for op in ops {
            op.on_reconnect();
            let init = self.with_connection(|conn| {
                conn.encode_init(op.kind, sid, op.request_id, &op.request_text)
            });
            match init.and_then(|bytes| self.send(bytes)) {
                Ok(()) => {}
                Err(e) => tracing::debug!(channel = %self.name, error = %e, "re-init failed"),
            }
        }
    }

    /// Transport loss: operations go dormant, the channel re-enters the
    /// search machinery (handled by the context).
    pub(crate) fn set_disconnected(&self) {
        if self.state() == ChannelState::Destroyed {
            return;
        }
        *lock(&self.sid) = None;
        *lock(&self.transport) = None;
        self.state_tx.send_replace(ChannelState::Disconnected);

        let ops: Vec<Arc<OpCore>> = lock(&self.ops).values().cloned().collect();
        for op in ops {
            op.on_disconnect();
        }
    }

    /// Run `f` against the transport's connection state machine.
    pub(crate) fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut ClientConnection) -> R,
    ) -> Result<R, ClientError> {
        let transport = lock(&self.transport)
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ClientError::Disconnected)?;
        Ok(transport.with_conn(f))
    }

    /// Queue framed bytes on the transport.
    pub(crate) fn send(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        let transport = lock(&self.transport)
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ClientError::Disconnected)?;
        transport.send(bytes)
    }

    pub(crate) fn register_operation(&self, rid: u32, op: Arc<OpCore>) {
        lock(&self.ops).insert(rid, op);
    }

    /// Drop an operation: forget routing and tell the server.
    pub(crate) fn unregister_operation(&self, rid: u32) {
        if lock(&self.ops).remove(&rid).is_none() {
            return;
        }
        if let Ok(ctx) = self.ctx() {
            ctx.unregister_routing(rid);
        }
        if let Some(sid) = self.sid() {
            let destroy = self.with_connection(|conn| conn.encode_destroy_request(sid, rid));
            if let Ok(bytes) = destroy {
                let _ = self.send(bytes);
            }
        } else {
            let _ = self.with_connection(|conn| conn.forget_request(rid));
        }
    }

    /// Terminal teardown: children first, then the server-side SID, then
    /// the context tables.
    pub(crate) fn destroy(self: &Arc<Self>) {
        if self.state() == ChannelState::Destroyed {
            return;
        }

        let ops: Vec<Arc<OpCore>> = {
            let mut table = lock(&self.ops);
            table.drain().map(|(_, op)| op).collect()
        };
        for op in &ops {
            if let Ok(ctx) = self.ctx() {
                ctx.unregister_routing(op.request_id);
            }
            op.destroy();
        }

        if let Some(sid) = self.sid() {
            let destroy = self.with_connection(|conn| conn.encode_destroy_channel(sid, self.cid));
            if let Ok(bytes) = destroy {
                let _ = self.send(bytes);
            }
        }
        if let Some(transport) = lock(&self.transport).as_ref().and_then(Weak::upgrade) {
            transport.detach_channel(self.cid);
        }

        self.state_tx.send_replace(ChannelState::Destroyed);
        if let Ok(ctx) = self.ctx() {
            ctx.forget_channel(self.cid);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A named, typed remote endpoint.
///
/// Dropping the handle destroys the channel and every operation on it.
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    /// The channel name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The channel priority (0–99).
    pub fn priority(&self) -> u8 {
        self.inner.priority
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Watch connection-state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.inner.watch()
    }

    /// Wait until the channel connects (or is destroyed).
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut watch = self.inner.watch();
        loop {
            match *watch.borrow_and_update() {
                ChannelState::Connected => return Ok(()),
                ChannelState::Destroyed => return Err(ClientError::Destroyed),
                _ => {}
            }
            if watch.changed().await.is_err() {
                return Err(ClientError::Destroyed);
            }
        }
    }

    async fn create_operation(
        &self,
        kind: OpKind,
        request: &str,
        monitor_tx: Option<mpsc::UnboundedSender<MonitorEvent>>,
    ) -> Result<Arc<OpCore>, ClientError> {
        // validate locally before anything hits the wire
        let parsed = PvRequest::parse(request)?;
        let ctx = self.inner.ctx()?;
        if self.inner.state() == ChannelState::Destroyed {
            return Err(ClientError::Destroyed);
        }

        let rid = ctx.next_request_id();
        let op = OpCore::new(
            kind,
            rid,
            parsed.to_text(),
            Arc::downgrade(&self.inner),
            monitor_tx,
        );
        self.inner.register_operation(rid, op.clone());
        ctx.register_routing(rid, op.clone());

        let init_rx = op.wait_init();
        if let Some(sid) = self.inner.sid() {
            let bytes = self.inner.with_connection(|conn| {
                conn.encode_init(kind, sid, rid, &op.request_text)
            })?;
            self.inner.send(bytes)?;
        }
        // not connected yet: the INIT goes out on connect

        let status = init_rx.await.map_err(|_| ClientError::Cancelled)?;
        if !status.is_success() {
            op.destroy();
            return Err(ClientError::Server(status));
        }
        Ok(op)
    }

    /// Create a Get operation for the requested subset.
    pub async fn get(&self, request: &str) -> Result<GetOperation, ClientError> {
        Ok(GetOperation { op: self.create_operation(OpKind::Get, request, None).await? })
    }

    /// Create a Put operation for the requested subset.
    pub async fn put(&self, request: &str) -> Result<PutOperation, ClientError> {
        Ok(PutOperation { op: self.create_operation(OpKind::Put, request, None).await? })
    }

    /// Create a PutGet operation.
    pub async fn put_get(&self, request: &str) -> Result<PutGetOperation, ClientError> {
        Ok(PutGetOperation { op: self.create_operation(OpKind::PutGet, request, None).await? })
    }

    /// Create a Process operation.
    pub async fn process(&self) -> Result<ProcessOperation, ClientError> {
        Ok(ProcessOperation { op: self.create_operation(OpKind::Process, "", None).await? })
    }

    /// Create an RPC operation.
    pub async fn rpc(&self) -> Result<RpcOperation, ClientError> {
        Ok(RpcOperation { op: self.create_operation(OpKind::Rpc, "", None).await? })
    }

    /// Create an Array operation for the requested array field.
    pub async fn array(&self, request: &str) -> Result<ArrayOperation, ClientError> {
        Ok(ArrayOperation { op: self.create_operation(OpKind::Array, request, None).await? })
    }

    /// Create (but do not start) a Monitor subscription.
    pub async fn monitor(&self, request: &str) -> Result<MonitorOperation, ClientError> {
        let parsed = PvRequest::parse(request)?;
        let pipeline = parsed.record.pipeline.unwrap_or(false);
        let queue_size = parsed.record.queue_size.unwrap_or(4).max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let op = self.create_operation(OpKind::Monitor, request, Some(tx)).await?;
        Ok(MonitorOperation { op, events: rx, pipeline, queue_size })
    }

    /// Fetch the channel's introspection descriptor (optionally of a
    /// sub-field). One-shot; requires a connected channel.
    pub async fn get_field(&self, subfield: &str) -> Result<FieldDesc, ClientError> {
        self.wait_connected().await?;
        let ctx = self.inner.ctx()?;
        let rid = ctx.next_request_id();
        let op = OpCore::new(
            OpKind::GetField,
            rid,
            subfield.to_owned(),
            Arc::downgrade(&self.inner),
            None,
        );
        op.mark_ready();
        self.inner.register_operation(rid, op.clone());
        ctx.register_routing(rid, op.clone());

        let subfield = subfield.to_owned();
        let result = op
            .call(SubCommand::empty(), |ch, sid, rid, _sub| {
                ch.with_connection(|conn| conn.encode_get_field(sid, rid, &subfield))
            })
            .await;
        op.destroy();

        match result? {
            OpEvent::GetField { status, interface } => {
                if !status.is_success() {
                    return Err(ClientError::Server(status));
                }
                interface.ok_or_else(|| ClientError::Internal("missing field descriptor".into()))
            }
            _ => Err(ClientError::Internal("expected a field reply".into())),
        }
    }

    /// Destroy the channel (idempotent, terminal).
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}
