//! Server side of the UDP discovery plane: the search responder and the
//! beacon emitter.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use pva_proto::{
    ByteOrder, Command, HEADER_SIZE, Header, LOCAL_MULTICAST_GROUP, Reader, Role, Writer,
    payloads::discovery::{Beacon, OriginTag, SEARCH_REPLY_REQUIRED, SearchRequest,
                          SearchResponse},
};
use tokio::net::UdpSocket;

use crate::ServerInner;

fn frame(command: Command, build: impl FnOnce(&mut Writer<'_>)) -> Vec<u8> {
    let order = ByteOrder::native();
    let mut payload = Vec::new();
    build(&mut Writer::new(&mut payload, order));
    let mut framed = Vec::new();
    Header::data(command.to_u8(), Role::Server, order, payload.len() as u32).encode(&mut framed);
    framed.extend_from_slice(&payload);
    framed
}

/// Answer name searches for hosted channels.
pub(crate) async fn run_responder(inner: Arc<ServerInner>, socket: Arc<UdpSocket>) {
    // tag our presence on the local multicast group once at startup
    let origin = socket.local_addr().map(|a| a.ip()).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let tag = frame(Command::OriginTag, |w| OriginTag { origin }.encode(w));
    let group = SocketAddr::new(IpAddr::V4(LOCAL_MULTICAST_GROUP), inner.config.broadcast_port);
    if let Err(e) = socket.send_to(&tag, group).await {
        tracing::debug!(error = %e, "origin tag emission failed");
    }

    let mut shutdown = inner.shutdown_rx();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => return,
            r = socket.recv_from(&mut buf) => r,
        };
        let (len, src) = match received {
            Ok(ok) => ok,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "udp receive failed");
                return;
            }
        };

        let mut rest = &buf[..len];
        while let Ok(Some((header, total))) = Header::peek_frame(rest) {
            let payload = &rest[HEADER_SIZE..total];
            rest = &rest[total..];
            if header.control || header.command != Command::Search.to_u8() {
                continue;
            }
            let mut r = Reader::new(payload, header.order);
            let Ok(request) = SearchRequest::decode(&mut r) else { continue };
            if let Some((target, response)) = answer(&inner, src, &request) {
                let bytes = frame(Command::SearchResponse, |w| response.encode(w));
                if let Err(e) = socket.send_to(&bytes, target).await {
                    tracing::debug!(%target, error = %e, "search response send failed");
                }
            }
        }
    }
}

/// Build the response (and its destination) for one search request.
fn answer(
    inner: &Arc<ServerInner>,
    src: SocketAddr,
    request: &SearchRequest,
) -> Option<(SocketAddr, SearchResponse)> {
    if !request.protocols.iter().any(|p| p == "tcp") && !request.protocols.is_empty() {
        return None;
    }

    let found: Vec<u32> = request
        .channels
        .iter()
        .filter(|ch| inner.providers.hosts(&ch.name))
        .map(|ch| ch.id)
        .collect();

    let (channel_ids, found_flag) = if found.is_empty() {
        if request.flags & SEARCH_REPLY_REQUIRED == 0 {
            return None;
        }
        (request.channels.iter().map(|ch| ch.id).collect(), false)
    } else {
        (found, true)
    };

    // an unspecified response address means "answer the datagram source"
    let mut target = request.response_address;
    if target.ip().is_unspecified() {
        target.set_ip(src.ip());
    }
    if target.port() == 0 {
        target.set_port(src.port());
    }

    let response = SearchResponse {
        guid: *inner.guid.as_bytes(),
        sequence_id: request.sequence_id,
        // unspecified: the client substitutes the datagram source
        server_address: SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            inner.tcp_addr.port(),
        ),
        protocol: "tcp".to_owned(),
        found: found_flag,
        channel_ids,
    };
    Some((target, response))
}

/// Periodic liveness broadcasts.
pub(crate) async fn run_beacons(inner: Arc<ServerInner>, socket: Arc<UdpSocket>) {
    let mut shutdown = inner.shutdown_rx();
    let mut sequence_id: u8 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(inner.config.beacon_period) => {}
        }

        let beacon = Beacon {
            guid: *inner.guid.as_bytes(),
            flags: 0,
            sequence_id,
            change_count: inner.change_count(),
            server_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                inner.tcp_addr.port(),
            ),
            protocol: "tcp".to_owned(),
            status: None,
        };
        sequence_id = sequence_id.wrapping_add(1);

        let bytes = frame(Command::Beacon, |w| beacon.encode(w));
        for target in beacon_targets(inner.as_ref()) {
            if let Err(e) = socket.send_to(&bytes, target).await {
                tracing::debug!(%target, error = %e, "beacon send failed");
            }
        }
    }
}

fn beacon_targets(inner: &ServerInner) -> Vec<SocketAddr> {
    let mut targets = inner.config.beacon_address_list.clone();
    if inner.config.auto_beacon_address_list {
        targets.push(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::BROADCAST),
            inner.config.broadcast_port,
        ));
    }
    targets
}
