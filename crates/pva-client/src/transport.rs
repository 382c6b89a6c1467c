//! Tokio TCP driver for client connections.
//!
//! Owns the socket and three tasks: a writer draining the send queue, a
//! reader running the framer and the connection state machine, and a
//! heartbeat timer. All protocol decisions live in
//! [`crate::connection::ClientConnection`]; this module only executes its
//! actions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use pva_proto::{HEADER_SIZE, Header};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::AbortHandle,
};

use crate::{
    ContextInner,
    connection::{ClientConnection, ConnAction, ConnOptions},
    errors::ClientError,
};

struct TransportShared {
    closed: bool,
    validated: bool,
    /// Channels bound to this transport (cids).
    attached: Vec<u32>,
    /// Channels waiting for validation before their create goes out.
    pending_creates: Vec<(u32, String)>,
    aborts: Vec<AbortHandle>,
}

/// One TCP connection to a server, shared by every channel resolved to
/// that server.
pub(crate) struct Transport {
    pub(crate) addr: SocketAddr,
    conn: Mutex<ClientConnection>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    shared: Mutex<TransportShared>,
    ctx: Weak<ContextInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Transport {
    /// Connect and start the driver tasks.
    pub(crate) async fn connect(
        ctx: &Arc<ContextInner>,
        addr: SocketAddr,
        options: ConnOptions,
    ) -> Result<Arc<Self>, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        // interactive protocol: never batch small frames
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "set_nodelay failed");
        }

        let heartbeat = options.heartbeat_interval;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            addr,
            conn: Mutex::new(ClientConnection::new(options, Instant::now())),
            out_tx,
            shared: Mutex::new(TransportShared {
                closed: false,
                validated: false,
                attached: Vec::new(),
                pending_creates: Vec::new(),
                aborts: Vec::new(),
            }),
            ctx: Arc::downgrade(ctx),
        });

        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(run_writer(write_half, out_rx));
        let reader = tokio::spawn(run_reader(transport.clone(), read_half));
        let ticker = tokio::spawn(run_heartbeat(transport.clone(), heartbeat));
        {
            let mut shared = lock(&transport.shared);
            shared.aborts = vec![writer.abort_handle(), reader.abort_handle(),
                                 ticker.abort_handle()];
        }

        tracing::debug!(%addr, "tcp transport connected");
        Ok(transport)
    }

    /// Run `f` against the connection state machine.
    pub(crate) fn with_conn<R>(&self, f: impl FnOnce(&mut ClientConnection) -> R) -> R {
        f(&mut lock(&self.conn))
    }

    /// Queue framed bytes for the writer task.
    pub(crate) fn send(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        if lock(&self.shared).closed {
            return Err(ClientError::Disconnected);
        }
        self.out_tx.send(bytes).map_err(|_| ClientError::Disconnected)
    }

    /// Bind a channel to this transport; its create request goes out as
    /// soon as validation allows.
    pub(crate) fn attach_channel(&self, cid: u32, name: &str) {
        let create_now = {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return;
            }
            if !shared.attached.contains(&cid) {
                shared.attached.push(cid);
            }
            if shared.validated {
                true
            } else {
                shared.pending_creates.push((cid, name.to_owned()));
                false
            }
        };
        if create_now {
            let bytes = self.with_conn(|conn| conn.encode_create_channel(cid, name));
            let _ = self.send(bytes);
        }
    }

    /// Detach a destroyed channel.
    pub(crate) fn detach_channel(&self, cid: u32) {
        let mut shared = lock(&self.shared);
        shared.attached.retain(|c| *c != cid);
        shared.pending_creates.retain(|(c, _)| *c != cid);
    }

    fn execute(self: &Arc<Self>, actions: Vec<ConnAction>) {
        for action in actions {
            match action {
                ConnAction::Send(bytes) => {
                    let _ = self.send(bytes);
                }
                ConnAction::Validated { server_guid } => {
                    tracing::debug!(addr = %self.addr,
                                    guid = %pva_core::Guid::from(server_guid),
                                    "connection validated");
                    let creates: Vec<(u32, String)> = {
                        let mut shared = lock(&self.shared);
                        shared.validated = true;
                        std::mem::take(&mut shared.pending_creates)
                    };
                    for (cid, name) in creates {
                        let bytes =
                            self.with_conn(|conn| conn.encode_create_channel(cid, &name));
                        let _ = self.send(bytes);
                    }
                }
                ConnAction::ChannelCreated { client_id, server_id, status } => {
                    if let Some(ctx) = self.ctx.upgrade() {
                        ctx.on_channel_created(self, client_id, server_id, status);
                    }
                }
                ConnAction::ChannelDestroyed { client_id, .. } => {
                    if let Some(ctx) = self.ctx.upgrade() {
                        ctx.on_channel_lost(client_id);
                    }
                }
                ConnAction::Deliver { request_id, event } => {
                    if let Some(ctx) = self.ctx.upgrade() {
                        ctx.deliver(request_id, event);
                    }
                }
                ConnAction::Close { reason } => {
                    self.close(&reason);
                }
            }
        }
    }

    /// Tear down (idempotent): abort tasks and fan the disconnect out to
    /// every attached channel.
    pub(crate) fn close(self: &Arc<Self>, reason: &str) {
        let (attached, aborts) = {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return;
            }
            shared.closed = true;
            (std::mem::take(&mut shared.attached), std::mem::take(&mut shared.aborts))
        };
        self.with_conn(ClientConnection::close);
        tracing::debug!(addr = %self.addr, %reason, "tcp transport closed");

        if let Some(ctx) = self.ctx.upgrade() {
            ctx.on_transport_closed(self, &attached);
        }
        for handle in aborts {
            handle.abort();
        }
    }
}

async fn run_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(mut bytes) = out_rx.recv().await {
        // delayed flush: coalesce everything already queued into one
        // write
        while let Ok(more) = out_rx.try_recv() {
            bytes.extend_from_slice(&more);
        }
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn run_reader(transport: Arc<Transport>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(1 << 16);
    let reason = 'outer: loop {
        // drain complete frames before reading more
        loop {
            match Header::peek_frame(&buf) {
                Ok(Some((header, total))) => {
                    let payload = buf[HEADER_SIZE..total].to_vec();
                    buf.advance(total);
                    let actions = transport
                        .with_conn(|conn| conn.handle_frame(header, &payload, Instant::now()));
                    match actions {
                        Ok(actions) => transport.execute(actions),
                        Err(e) => break 'outer format!("protocol error: {e}"),
                    }
                }
                Ok(None) => break,
                // header-level corruption is fatal to the connection
                Err(e) => break 'outer format!("bad frame: {e}"),
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => break 'outer "peer closed".to_owned(),
            Ok(_) => {}
            Err(e) => break 'outer format!("read failed: {e}"),
        }
    };
    transport.close(&reason);
}

async fn run_heartbeat(transport: Arc<Transport>, interval: Duration) {
    let step = (interval / 2).max(Duration::from_millis(250));
    loop {
        tokio::time::sleep(step).await;
        if lock(&transport.shared).closed {
            return;
        }
        let actions = transport.with_conn(|conn| conn.tick(Instant::now()));
        transport.execute(actions);
    }
}
