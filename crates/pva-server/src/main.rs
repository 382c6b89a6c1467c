//! PV Access server binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve the demo records on the default ports
//! pva-server --demo
//!
//! # Custom ports
//! pva-server --port 15075 --broadcast-port 15076 --demo
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pva_core::ServerConfig;
use pva_proto::{BitSet, FieldDesc, PvValue, ScalarKind, StructDesc};
use pva_server::{MemoryProvider, MemoryRecord, Provider, ServerContext};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// PV Access protocol server
#[derive(Parser, Debug)]
#[command(name = "pva-server")]
#[command(about = "PV Access protocol server")]
#[command(version)]
struct Args {
    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP listen port (0 = ephemeral)
    #[arg(short, long, default_value = "5075")]
    port: u16,

    /// UDP search/beacon port (0 = ephemeral)
    #[arg(long, default_value = "5076")]
    broadcast_port: u16,

    /// Beacon period in seconds
    #[arg(long, default_value = "15")]
    beacon_period: u64,

    /// Maximum concurrent connections
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Host a set of demo records (demo:counter, demo:wave)
    #[arg(long)]
    demo: bool,
}

fn demo_provider() -> Arc<MemoryProvider> {
    let provider = MemoryProvider::new("memory");

    let counter = MemoryRecord::new(
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
            .build(),
    );
    provider.insert("demo:counter", counter.clone());

    let wave = MemoryRecord::new(
        StructDesc::builder("epics:nt/NTScalarArray:1.0")
            .field("value", FieldDesc::scalar_array(ScalarKind::F64))
            .build(),
    );
    wave.post(
        |s| {
            let _ = s.set("value", PvValue::F64Array((0..32).map(f64::from).collect()));
        },
        BitSet::new(),
    );
    provider.insert("demo:wave", wave);

    // a slow counter gives monitors something to watch
    tokio::spawn(async move {
        let mut n = 0i32;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            n = n.wrapping_add(1);
            counter.post_field("value", n.into());
        }
    });

    provider
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ServerConfig {
        listen_address_list: vec![args.bind],
        server_port: args.port,
        broadcast_port: args.broadcast_port,
        beacon_period: Duration::from_secs(args.beacon_period.max(1)),
        max_connections: args.max_connections,
        ..Default::default()
    };

    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    if args.demo {
        providers.push(demo_provider());
    }

    let server = ServerContext::start(config, providers).await?;
    tracing::info!("pva server running on {}", server.tcp_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.close();

    Ok(())
}
