//! Tokio UDP driver for the discovery plane.
//!
//! One ephemeral socket carries outgoing search frames and their
//! responses; a second socket on the broadcast port (bound best-effort)
//! listens for server beacons. Datagrams may hold several messages; an
//! origin tag at the front of a datagram gates the rest of it through the
//! tap-list filter.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use pva_proto::{
    ByteOrder, Command, HEADER_SIZE, Header, LOCAL_MULTICAST_GROUP, Reader, Role, Writer,
    payloads::discovery::{Beacon, OriginTag, SEARCH_REPLY_REQUIRED, SEARCH_UNICAST,
                          SearchRequest, SearchResponse},
};
use tokio::net::UdpSocket;

use crate::{ContextInner, errors::ClientError};

/// Bound discovery sockets, pre-task-spawn.
pub(crate) struct Discovery {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) beacon_socket: Option<Arc<UdpSocket>>,
    pub(crate) response_addr: SocketAddr,
}

/// Bind the discovery sockets.
pub(crate) async fn bind(broadcast_port: u16) -> Result<Discovery, ClientError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let response_addr = socket.local_addr()?;

    // beacons arrive on the well-known broadcast port; losing the bind
    // (e.g. a server on the same host) only costs restart detection
    let beacon_socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, broadcast_port)).await {
        Ok(socket) => Some(Arc::new(socket)),
        Err(e) => {
            tracing::debug!(port = broadcast_port, error = %e,
                            "beacon port unavailable; beacon anomalies disabled");
            None
        }
    };

    Ok(Discovery { socket: Arc::new(socket), beacon_socket, response_addr })
}

/// Spawn the search sender and the receive loops.
pub(crate) fn spawn(discovery: Discovery, ctx: &Arc<ContextInner>) {
    let Discovery { socket, beacon_socket, response_addr } = discovery;

    tokio::spawn(run_search_sender(ctx.clone(), socket.clone(), response_addr));
    tokio::spawn(run_receiver(ctx.clone(), socket));
    if let Some(socket) = beacon_socket {
        tokio::spawn(run_receiver(ctx.clone(), socket));
    }
}

async fn run_search_sender(
    ctx: Arc<ContextInner>,
    socket: Arc<UdpSocket>,
    response_addr: SocketAddr,
) {
    let mut shutdown = ctx.shutdown_rx();
    let targets = ctx.search_targets();
    loop {
        let sleep_for = ctx.search_sleep();
        tokio::select! {
            _ = shutdown.changed() => return,
            () = ctx.search_wake.notified() => {}
            () = tokio::time::sleep(sleep_for) => {}
        }

        let batches = ctx.tick_search(Instant::now());
        for batch in batches {
            let request = SearchRequest {
                sequence_id: batch.sequence_id,
                flags: SEARCH_REPLY_REQUIRED,
                response_address: response_addr,
                protocols: vec!["tcp".to_owned()],
                channels: batch.channels,
            };
            for (target, unicast) in &targets {
                let mut request = request.clone();
                if *unicast {
                    request.flags |= SEARCH_UNICAST;
                }
                let frame = frame_search(&request);
                if let Err(e) = socket.send_to(&frame, target).await {
                    tracing::debug!(%target, error = %e, "search send failed");
                }
            }
        }
    }
}

fn frame_search(request: &SearchRequest) -> Vec<u8> {
    let order = ByteOrder::native();
    let mut payload = Vec::new();
    request.encode(&mut Writer::new(&mut payload, order));
    let mut framed = Vec::new();
    Header::data(Command::Search.to_u8(), Role::Client, order, payload.len() as u32)
        .encode(&mut framed);
    framed.extend_from_slice(&payload);
    framed
}

async fn run_receiver(ctx: Arc<ContextInner>, socket: Arc<UdpSocket>) {
    let mut shutdown = ctx.shutdown_rx();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => return,
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok((len, src)) => process_datagram(&ctx, src, &buf[..len]),
            // spurious errors (connection refused/reset reported on some
            // platforms for unconnected sockets) are retried silently
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                tracing::warn!(error = %e, "udp receive failed");
                return;
            }
        }
    }
}

/// Parse every message in one datagram, honoring the ignore list and the
/// origin-tag tap filter.
fn process_datagram(ctx: &Arc<ContextInner>, src: SocketAddr, data: &[u8]) {
    if ctx.config.ignore_address_list.contains(&src.ip()) {
        return;
    }

    let mut rest = data;
    while let Ok(Some((header, total))) = Header::peek_frame(rest) {
        let payload = &rest[HEADER_SIZE..total];
        rest = &rest[total..];
        if header.control {
            continue;
        }

        let mut r = Reader::new(payload, header.order);
        match Command::from_u8(header.command) {
            Some(Command::OriginTag) => {
                let Ok(tag) = OriginTag::decode(&mut r) else { return };
                if !tap_allows(&ctx.config.tap_address_list, tag.origin) {
                    // origin not on the tap list: drop the whole datagram
                    return;
                }
            }
            Some(Command::SearchResponse) => {
                if let Ok(resp) = SearchResponse::decode(&mut r) {
                    ctx.on_search_response(src, resp);
                }
            }
            Some(Command::Beacon) => {
                if let Ok(beacon) = Beacon::decode(&mut r) {
                    ctx.on_beacon(src, &beacon);
                }
            }
            _ => {}
        }
    }
}

fn tap_allows(tap_list: &[IpAddr], origin: IpAddr) -> bool {
    tap_list.is_empty() || tap_list.contains(&origin)
}

/// Search/beacon destinations for this configuration, paired with
/// whether each is a unicast target.
pub(crate) fn targets(
    address_list: &[SocketAddr],
    auto: bool,
    broadcast_port: u16,
) -> Vec<(SocketAddr, bool)> {
    let mut out: Vec<(SocketAddr, bool)> = address_list
        .iter()
        .map(|addr| (*addr, is_unicast(addr.ip())))
        .collect();
    if auto {
        out.push((SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), broadcast_port), false));
        out.push((SocketAddr::new(IpAddr::V4(LOCAL_MULTICAST_GROUP), broadcast_port), false));
    }
    out
}

fn is_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_multicast() && !v4.is_broadcast(),
        IpAddr::V6(v6) => !v6.is_multicast(),
    }
}
