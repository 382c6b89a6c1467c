//! Loopback integration harness.
//!
//! [`TestCluster`] runs a real server and a real client in-process over
//! 127.0.0.1 with ephemeral ports and deterministic (unicast) discovery,
//! so end-to-end tests exercise the actual wire: search, validation,
//! channel creation, operations and monitors.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pva_client::ClientContext;
use pva_core::{ClientConfig, ServerConfig};
use pva_proto::{
    BitSet, FieldDesc, PvStructure, PvValue, ScalarKind, Status, StructDesc,
};
use pva_server::{
    ChannelRecord, MemoryProvider, MemoryRecord, MonitorSink, Provider, ServerContext,
    ServerError,
};

/// An in-process server + client pair wired over loopback.
pub struct TestCluster {
    /// The running server.
    pub server: ServerContext,
    /// The client context, discovery pointed at the server.
    pub client: ClientContext,
    /// The memory provider backing the server.
    pub provider: Arc<MemoryProvider>,
}

impl TestCluster {
    /// Start a cluster with an empty provider.
    pub async fn start() -> Result<Self, ServerError> {
        Self::start_with(Vec::new()).await
    }

    /// Start a cluster with extra providers registered after the memory
    /// provider.
    pub async fn start_with(extra: Vec<Arc<dyn Provider>>) -> Result<Self, ServerError> {
        let provider = MemoryProvider::new("memory");
        let mut providers: Vec<Arc<dyn Provider>> = vec![provider.clone()];
        providers.extend(extra);

        let server_config = ServerConfig {
            listen_address_list: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            server_port: 0,
            broadcast_port: 0,
            beacon_period: Duration::from_millis(500),
            ..Default::default()
        };
        let server = ServerContext::start(server_config, providers).await?;

        let client_config = ClientConfig {
            address_list: vec![server.udp_addr()],
            auto_address_list: false,
            broadcast_port: server.udp_addr().port(),
            heartbeat_interval: Duration::from_secs(2),
            ..Default::default()
        };
        let client = ClientContext::new(client_config)
            .await
            .map_err(|e| ServerError::Config(format!("client bind failed: {e}")))?;

        Ok(Self { server, client, provider })
    }

    /// Host an NTScalar-ish int record and return its handle.
    pub fn add_int_record(&self, name: &str, initial: i32) -> Arc<MemoryRecord> {
        let record = MemoryRecord::new(int_descriptor());
        record.post_field("value", initial.into());
        self.provider.insert(name, record.clone());
        record
    }

    /// Host a double-array record and return its handle.
    pub fn add_array_record(&self, name: &str, initial: Vec<f64>) -> Arc<MemoryRecord> {
        let record = MemoryRecord::new(
            StructDesc::builder("epics:nt/NTScalarArray:1.0")
                .field("value", FieldDesc::scalar_array(ScalarKind::F64))
                .build(),
        );
        record.post(
            |s| {
                let _ = s.set("value", PvValue::F64Array(initial));
            },
            BitSet::new(),
        );
        self.provider.insert(name, record.clone());
        record
    }
}

/// Descriptor used by [`TestCluster::add_int_record`]: value + alarm.
pub fn int_descriptor() -> Arc<StructDesc> {
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
        .build()
}

/// A record whose RPC echoes its arguments back with an `echoed` marker
/// field when present.
pub struct EchoRpcRecord {
    inner: Arc<MemoryRecord>,
}

impl EchoRpcRecord {
    /// A fresh echo record.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: MemoryRecord::new(int_descriptor()) })
    }
}

#[async_trait]
impl ChannelRecord for EchoRpcRecord {
    fn descriptor(&self) -> Arc<StructDesc> {
        self.inner.descriptor()
    }

    fn read(&self) -> (PvStructure, BitSet) {
        self.inner.read()
    }

    fn write(&self, value: &PvStructure, changed: &BitSet) -> Status {
        self.inner.write(value, changed)
    }

    async fn process(&self) -> Status {
        self.inner.process().await
    }

    async fn rpc(&self, args: PvStructure) -> Result<PvStructure, Status> {
        Ok(args)
    }

    fn subscribe(&self, id: u64, sink: MonitorSink) {
        self.inner.subscribe(id, sink);
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.unsubscribe(id);
    }
}

/// A record whose `process()` takes a configurable time, for cancel and
/// destroy-while-in-flight tests.
pub struct SlowProcessRecord {
    inner: Arc<MemoryRecord>,
    delay: Duration,
}

impl SlowProcessRecord {
    /// A record that processes in `delay`.
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self { inner: MemoryRecord::new(int_descriptor()), delay })
    }
}

#[async_trait]
impl ChannelRecord for SlowProcessRecord {
    fn descriptor(&self) -> Arc<StructDesc> {
        self.inner.descriptor()
    }

    fn read(&self) -> (PvStructure, BitSet) {
        self.inner.read()
    }

    fn write(&self, value: &PvStructure, changed: &BitSet) -> Status {
        self.inner.write(value, changed)
    }

    async fn process(&self) -> Status {
        tokio::time::sleep(self.delay).await;
        Status::ok()
    }

    fn subscribe(&self, id: u64, sink: MonitorSink) {
        self.inner.subscribe(id, sink);
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.unsubscribe(id);
    }
}

/// A single-record provider for the wrapper record types.
pub struct SingleRecordProvider {
    name: String,
    channel: String,
    record: Arc<dyn ChannelRecord>,
}

impl SingleRecordProvider {
    /// Host `record` under `channel`.
    pub fn new(channel: impl Into<String>, record: Arc<dyn ChannelRecord>) -> Arc<Self> {
        Arc::new(Self { name: "single".into(), channel: channel.into(), record })
    }
}

impl Provider for SingleRecordProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, channel: &str) -> Option<Arc<dyn ChannelRecord>> {
        (channel == self.channel).then(|| self.record.clone())
    }
}
