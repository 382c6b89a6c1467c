//! PV Access client runtime.
//!
//! [`ClientContext`] owns the discovery plane (UDP search with
//! exponential back-off, beacon anomaly detection) and the TCP
//! transports, and hands out durable [`Channel`] handles. Channels carry
//! typed operation handles (Get/Put/PutGet/Process/RPC/Array/Monitor)
//! that survive transport loss and re-negotiate on reconnect.
//!
//! Protocol logic lives in pure state machines
//! ([`connection::ClientConnection`], [`search::SearchManager`],
//! [`beacon::BeaconTracker`]); tokio drivers execute their actions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod beacon;
pub mod channel;
pub mod connection;
mod discovery;
pub mod errors;
pub mod operations;
pub mod search;
mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use pva_core::{ClientConfig, SystemEnv};
use pva_proto::Status;
use pva_proto::payloads::discovery::{Beacon, SearchResponse};
use tokio::sync::{Notify, watch};

pub use channel::{Channel, ChannelState};
pub use errors::ClientError;
pub use operations::{
    ArrayOperation, GetOperation, MonitorEvent, MonitorOperation, ProcessOperation,
    PutGetOperation, PutOperation, RpcOperation,
};

use beacon::BeaconTracker;
use channel::ChannelInner;
use connection::{ConnOptions, OpEvent};
use operations::OpCore;
use search::{SearchBatch, SearchManager};
use transport::Transport;

/// The client context: discovery plane, transport registry, channel
/// factory.
///
/// Dropping the context shuts down its tasks and disconnects every
/// channel.
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl ClientContext {
    /// Bind the discovery sockets and start the background tasks.
    pub async fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let discovery = discovery::bind(config.broadcast_port).await?;
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(ContextInner {
            config,
            env: SystemEnv::new(),
            channels: Mutex::new(HashMap::new()),
            routing: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            search: Mutex::new(SearchManager::new()),
            beacons: Mutex::new(BeaconTracker::new()),
            next_cid: AtomicU32::new(1),
            next_rid: AtomicU32::new(1),
            search_wake: Notify::new(),
            shutdown,
        });
        discovery::spawn(discovery, &inner);
        Ok(Self { inner })
    }

    /// Create a channel handle and start searching for it.
    ///
    /// Exactly one creation acknowledgment (the state transition out of
    /// `NeverConnected`) follows, and destroy is reported at most once.
    pub fn create_channel(&self, name: &str, priority: u8) -> Channel {
        let inner = self.inner.create_channel(name, priority.min(99));
        Channel { inner }
    }

    /// Number of channels still searching.
    pub fn searching_count(&self) -> usize {
        lock(&self.inner.search).registered_count()
    }

    /// Shut down: close transports and stop the background tasks.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.inner.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) struct ContextInner {
    pub(crate) config: ClientConfig,
    #[allow(dead_code)]
    pub(crate) env: SystemEnv,
    channels: Mutex<HashMap<u32, Weak<ChannelInner>>>,
    routing: Mutex<HashMap<u32, Arc<OpCore>>>,
    transports: Mutex<HashMap<SocketAddr, Arc<Transport>>>,
    search: Mutex<SearchManager>,
    beacons: Mutex<BeaconTracker>,
    next_cid: AtomicU32,
    next_rid: AtomicU32,
    pub(crate) search_wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl ContextInner {
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Request ids are drawn context-wide, which keeps them unique per
    /// channel (and per connection) without coordination.
    pub(crate) fn next_request_id(&self) -> u32 {
        self.next_rid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_routing(&self, rid: u32, op: Arc<OpCore>) {
        lock(&self.routing).insert(rid, op);
    }

    pub(crate) fn unregister_routing(&self, rid: u32) {
        lock(&self.routing).remove(&rid);
    }

    /// Route a decoded event to the operation that owns the request id.
    pub(crate) fn deliver(&self, rid: u32, event: OpEvent) {
        let op = lock(&self.routing).get(&rid).cloned();
        match op {
            Some(op) => op.handle_event(event),
            None => tracing::trace!(rid, "event for unknown request"),
        }
    }

    fn create_channel(self: &Arc<Self>, name: &str, priority: u8) -> Arc<ChannelInner> {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let channel = ChannelInner::new(cid, name.to_owned(), priority, Arc::downgrade(self));
        lock(&self.channels).insert(cid, Arc::downgrade(&channel));
        lock(&self.search).register(cid, name, false, Instant::now());
        self.search_wake.notify_one();
        tracing::debug!(cid, %name, "channel created, searching");
        channel
    }

    pub(crate) fn forget_channel(&self, cid: u32) {
        lock(&self.channels).remove(&cid);
        lock(&self.search).unregister(cid);
    }

    fn channel(&self, cid: u32) -> Option<Arc<ChannelInner>> {
        lock(&self.channels).get(&cid).and_then(Weak::upgrade)
    }

    // ---- discovery callbacks -------------------------------------------

    pub(crate) fn search_sleep(&self) -> Duration {
        let deadline = lock(&self.search).next_deadline();
        match deadline {
            None => Duration::from_millis(250),
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .clamp(Duration::from_millis(1), Duration::from_millis(250)),
        }
    }

    pub(crate) fn tick_search(&self, now: Instant) -> Vec<SearchBatch> {
        lock(&self.search).tick(now)
    }

    pub(crate) fn search_targets(&self) -> Vec<(SocketAddr, bool)> {
        discovery::targets(
            &self.config.address_list,
            self.config.auto_address_list,
            self.config.broadcast_port,
        )
    }

    pub(crate) fn on_search_response(self: &Arc<Self>, src: SocketAddr, resp: SearchResponse) {
        if !resp.found {
            return;
        }
        let now = Instant::now();
        let server = if resp.server_address.ip().is_unspecified() {
            SocketAddr::new(src.ip(), resp.server_address.port())
        } else {
            resp.server_address
        };

        for cid in resp.channel_ids {
            let resolved = lock(&self.search).on_response(cid, resp.sequence_id, now);
            if let Some(name) = resolved {
                tracing::debug!(cid, %name, %server, "channel resolved");
                let ctx = self.clone();
                tokio::spawn(async move {
                    ctx.bind_channel(cid, name, server).await;
                });
            }
        }
    }

    pub(crate) fn on_beacon(self: &Arc<Self>, src: SocketAddr, beacon: &Beacon) {
        let now = Instant::now();
        let anomaly =
            lock(&self.beacons).observe(src, beacon.guid, beacon.sequence_id, now);
        if anomaly {
            tracing::debug!(%src, "beacon anomaly; boosting search");
            lock(&self.search).new_server_detected(now);
            self.search_wake.notify_one();
        }
    }

    /// Attach a resolved channel to the (possibly shared) transport for
    /// its server.
    async fn bind_channel(self: Arc<Self>, cid: u32, name: String, server: SocketAddr) {
        let existing = lock(&self.transports).get(&server).cloned();
        let transport = match existing {
            Some(t) => t,
            None => {
                let options = ConnOptions {
                    heartbeat_interval: self.config.heartbeat_interval,
                    receive_buffer_size: self.config.receive_buffer_size,
                    auth_plugin: self.config.auth_plugin.clone(),
                };
                match Transport::connect(&self, server, options).await {
                    Ok(new) => {
                        let mut map = lock(&self.transports);
                        match map.get(&server) {
                            // lost a connect race: use the winner
                            Some(winner) => {
                                let winner = winner.clone();
                                drop(map);
                                new.close("duplicate transport");
                                winner
                            }
                            None => {
                                map.insert(server, new.clone());
                                new
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%server, error = %e, "connect failed; re-searching");
                        lock(&self.search).register(cid, &name, true, Instant::now());
                        self.search_wake.notify_one();
                        return;
                    }
                }
            }
        };
        transport.attach_channel(cid, &name);
    }

    // ---- transport callbacks -------------------------------------------

    pub(crate) fn on_channel_created(
        &self,
        transport: &Arc<Transport>,
        cid: u32,
        sid: u32,
        status: Status,
    ) {
        let Some(channel) = self.channel(cid) else {
            transport.detach_channel(cid);
            return;
        };
        if status.is_success() {
            tracing::debug!(cid, sid, name = %channel.name, "channel connected");
            channel.set_connected(sid, transport);
        } else {
            tracing::warn!(cid, name = %channel.name, %status, "channel create rejected");
            transport.detach_channel(cid);
            lock(&self.search).register(cid, &channel.name, true, Instant::now());
            self.search_wake.notify_one();
        }
    }

    /// Server-initiated channel teardown.
    pub(crate) fn on_channel_lost(&self, cid: u32) {
        if let Some(channel) = self.channel(cid) {
            channel.set_disconnected();
            lock(&self.search).register(cid, &channel.name, true, Instant::now());
            self.search_wake.notify_one();
        }
    }

    pub(crate) fn on_transport_closed(&self, transport: &Arc<Transport>, attached: &[u32]) {
        {
            let mut map = lock(&self.transports);
            if map.get(&transport.addr).is_some_and(|t| Arc::ptr_eq(t, transport)) {
                map.remove(&transport.addr);
            }
        }
        let now = Instant::now();
        for cid in attached {
            if let Some(channel) = self.channel(*cid) {
                channel.set_disconnected();
                lock(&self.search).register(*cid, &channel.name, true, now);
            }
        }
        if !attached.is_empty() {
            self.search_wake.notify_one();
        }
    }

    pub(crate) fn close(&self) {
        if *self.shutdown.borrow() {
            return;
        }
        let _ = self.shutdown.send(true);
        let transports: Vec<Arc<Transport>> =
            lock(&self.transports).values().cloned().collect();
        for transport in transports {
            transport.close("context closed");
        }
    }
}
