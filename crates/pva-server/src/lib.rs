//! PV Access server runtime.
//!
//! [`ServerContext`] binds the TCP accept loop and the UDP discovery
//! plane, and drives one sans-io [`connection::ServerConnection`] per
//! accepted socket. Application data sources plug in through the
//! [`provider::Provider`] trait; an in-memory provider backs tests and
//! the demo binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod array_ops;
pub mod auth;
pub mod connection;
mod discovery;
pub mod errors;
pub mod memory;
pub mod provider;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, BytesMut};
use pva_core::{Guid, ServerConfig, SystemEnv};
use pva_proto::{BitSet, HEADER_SIZE, Header, PvStructure};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    sync::{mpsc, watch},
};

pub use auth::{AnonymousAuth, AuthPlugin, AuthVerdict};
pub use connection::{ServerConnAction, ServerConnection};
pub use errors::ServerError;
pub use memory::{MemoryProvider, MemoryRecord};
pub use provider::{ChannelRecord, MonitorSink, Provider, ProviderRegistry};

/// The server context: sockets, providers, connection driver.
pub struct ServerContext {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) guid: Guid,
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) auth_plugins: Vec<Arc<dyn AuthPlugin>>,
    pub(crate) tcp_addr: SocketAddr,
    pub(crate) udp_addr: SocketAddr,
    next_conn_id: AtomicU32,
    connection_count: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl ServerInner {
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn change_count(&self) -> u16 {
        // bumped when the provider population changes; static registries
        // never bump it
        0
    }
}

impl ServerContext {
    /// Bind the listener and the discovery socket, then start serving.
    pub async fn start(
        config: ServerConfig,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let guid = Guid::generate(&env);
        let registry = Arc::new(ProviderRegistry::new(providers, &config.provider_names));

        let bind_ip = config
            .listen_address_list
            .first()
            .copied()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let listener = TcpListener::bind((bind_ip, config.server_port)).await?;
        let tcp_addr = listener.local_addr()?;

        let udp = UdpSocket::bind((bind_ip, config.broadcast_port)).await?;
        udp.set_broadcast(true)?;
        let udp_addr = udp.local_addr()?;
        let udp = Arc::new(udp);

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            config,
            guid,
            providers: registry,
            auth_plugins: vec![Arc::new(AnonymousAuth)],
            tcp_addr,
            udp_addr,
            next_conn_id: AtomicU32::new(1),
            connection_count: AtomicU32::new(0),
            shutdown,
        });

        tracing::info!(
            guid = %inner.guid,
            tcp = %tcp_addr,
            udp = %udp_addr,
            providers = ?inner.providers.names(),
            "server listening"
        );

        tokio::spawn(accept_loop(inner.clone(), listener));
        tokio::spawn(discovery::run_responder(inner.clone(), udp.clone()));
        tokio::spawn(discovery::run_beacons(inner.clone(), udp));

        Ok(Self { inner })
    }

    /// Actual TCP listen address.
    pub fn tcp_addr(&self) -> SocketAddr {
        self.inner.tcp_addr
    }

    /// Actual UDP discovery address.
    pub fn udp_addr(&self) -> SocketAddr {
        self.inner.udp_addr
    }

    /// The server's identity.
    pub fn guid(&self) -> Guid {
        self.inner.guid
    }

    /// Live TCP connections.
    pub fn connection_count(&self) -> u32 {
        self.inner.connection_count.load(Ordering::Relaxed)
    }

    /// Stop accepting and shut the background tasks down.
    pub fn close(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Run until shutdown is requested.
    pub async fn serve_forever(&self) {
        let mut shutdown = self.inner.shutdown_rx();
        let _ = shutdown.changed().await;
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        let _ = self.inner.shutdown.send(true);
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown_rx();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => return,
            a = listener.accept() => a,
        };
        match accepted {
            Ok((stream, peer)) => {
                if inner.connection_count.load(Ordering::Relaxed)
                    >= inner.config.max_connections as u32
                {
                    tracing::warn!(%peer, "rejecting connection: at max_connections");
                    drop(stream);
                    continue;
                }
                tracing::debug!(%peer, "tcp connection accepted");
                tokio::spawn(serve_connection(inner.clone(), stream, peer));
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
            }
        }
    }
}

/// Queued record update on its way into a monitor FIFO.
type MonitorPost = (u32, u32, PvStructure, BitSet, BitSet);

struct ConnShared {
    conn: Mutex<ServerConnection>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    post_tx: mpsc::UnboundedSender<MonitorPost>,
    closed: Mutex<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn serve_connection(
    inner: Arc<ServerInner>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    inner.connection_count.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %e, "set_nodelay failed");
    }

    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let connection = ServerConnection::new(
        conn_id,
        inner.providers.clone(),
        inner.auth_plugins.clone(),
        inner.guid,
        inner.config.receive_buffer_size,
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (post_tx, post_rx) = mpsc::unbounded_channel::<MonitorPost>();
    let shared = Arc::new(ConnShared {
        conn: Mutex::new(connection),
        out_tx,
        post_tx,
        closed: Mutex::new(false),
    });

    let (mut read_half, mut write_half) = stream.into_split();
    tokio::spawn(async move {
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
    });
    tokio::spawn(run_monitor_pump(Arc::downgrade(&shared), post_rx));

    // the server speaks first: the validation request
    let actions = lock(&shared.conn).start();
    execute(&shared, actions);

    let mut shutdown = inner.shutdown_rx();
    let mut buf = BytesMut::with_capacity(1 << 16);
    let reason = 'outer: loop {
        loop {
            if *lock(&shared.closed) {
                break 'outer "closed by protocol".to_owned();
            }
            match Header::peek_frame(&buf) {
                Ok(Some((header, total))) => {
                    let payload = buf[HEADER_SIZE..total].to_vec();
                    buf.advance(total);
                    let result = lock(&shared.conn).handle_frame(header, &payload);
                    match result {
                        Ok(actions) => execute(&shared, actions),
                        Err(e) => break 'outer format!("protocol error: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => break 'outer format!("bad frame: {e}"),
            }
        }
        let received = tokio::select! {
            _ = shutdown.changed() => break 'outer "server shutdown".to_owned(),
            r = read_half.read_buf(&mut buf) => r,
        };
        match received {
            Ok(0) => break 'outer "peer closed".to_owned(),
            Ok(_) => {}
            Err(e) => break 'outer format!("read failed: {e}"),
        }
    };

    tracing::debug!(%peer, %reason, "tcp connection closed");
    let actions = lock(&shared.conn).shutdown();
    execute(&shared, actions);
    inner.connection_count.fetch_sub(1, Ordering::Relaxed);
}

/// Serializes record posts into the connection outside the record locks.
async fn run_monitor_pump(
    shared: Weak<ConnShared>,
    mut post_rx: mpsc::UnboundedReceiver<MonitorPost>,
) {
    while let Some((sid, rid, value, changed, overrun)) = post_rx.recv().await {
        let Some(shared) = shared.upgrade() else { return };
        let actions = lock(&shared.conn).monitor_post(sid, rid, &value, &changed, &overrun);
        execute(&shared, actions);
    }
}

fn execute(shared: &Arc<ConnShared>, actions: Vec<ServerConnAction>) {
    for action in actions {
        match action {
            ServerConnAction::Send(bytes) => {
                let _ = shared.out_tx.send(bytes);
            }
            ServerConnAction::Close { reason } => {
                tracing::debug!(%reason, "closing connection");
                *lock(&shared.closed) = true;
            }
            ServerConnAction::Process { sid, rid, record } => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let status = record.process().await;
                    let actions = lock(&shared.conn).complete_process(sid, rid, status);
                    execute(&shared, actions);
                });
            }
            ServerConnAction::Rpc { sid, rid, record, args } => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let result = record.rpc(args).await;
                    let actions = lock(&shared.conn).complete_rpc(sid, rid, result);
                    execute(&shared, actions);
                });
            }
            ServerConnAction::Subscribe { sid, rid, sink_id, record } => {
                let post_tx = shared.post_tx.clone();
                record.subscribe(
                    sink_id,
                    Arc::new(move |value, changed, overrun| {
                        let _ = post_tx.send((
                            sid,
                            rid,
                            value.clone(),
                            changed.clone(),
                            overrun.clone(),
                        ));
                    }),
                );
            }
            ServerConnAction::Unsubscribe { sink_id, record } => {
                record.unsubscribe(sink_id);
            }
        }
    }
}
