//! UDP discovery plane payloads: search, search response, beacon, origin
//! tag.

use std::net::{IpAddr, SocketAddr};

use crate::{
    errors::{ProtocolError, Result},
    payloads::{AnyValue, decode_any, decode_ip, decode_socket_addr, encode_any, encode_ip,
               encode_socket_addr},
    wire::{Reader, Writer},
};

/// Search flag: reply is requested even for channels the server does not
/// host.
pub const SEARCH_REPLY_REQUIRED: u8 = 0x01;

/// Search flag: the request was sent unicast (the server should not apply
/// broadcast suppression).
pub const SEARCH_UNICAST: u8 = 0x80;

/// One channel being searched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchChannel {
    /// Client channel id, echoed in the response.
    pub id: u32,
    /// Channel name.
    pub name: String,
}

/// A batched channel-name search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Round sequence number, echoed in responses.
    pub sequence_id: u32,
    /// [`SEARCH_REPLY_REQUIRED`] | [`SEARCH_UNICAST`].
    pub flags: u8,
    /// Where responses should be sent.
    pub response_address: SocketAddr,
    /// Protocols the client accepts (normally just `"tcp"`).
    pub protocols: Vec<String>,
    /// Channels to resolve.
    pub channels: Vec<SearchChannel>,
}

impl SearchRequest {
    /// Serialize per the search wire format.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.sequence_id);
        w.put_u8(self.flags);
        w.put_bytes(&[0; 3]); // reserved
        encode_socket_addr(self.response_address, w);
        w.put_u8(self.protocols.len() as u8);
        for p in &self.protocols {
            w.put_string(p);
        }
        w.put_u16(self.channels.len() as u16);
        for ch in &self.channels {
            w.put_u32(ch.id);
            w.put_string(&ch.name);
        }
    }

    /// Deserialize the search wire format.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let sequence_id = r.get_u32()?;
        let flags = r.get_u8()?;
        let _ = r.get_bytes(3)?; // reserved
        let response_address = decode_socket_addr(r)?;
        let protocol_count = r.get_u8()?;
        let mut protocols = Vec::with_capacity(usize::from(protocol_count));
        for _ in 0..protocol_count {
            protocols.push(r.get_string()?);
        }
        let channel_count = r.get_u16()?;
        let mut channels = Vec::with_capacity(usize::from(channel_count).min(1024));
        for _ in 0..channel_count {
            let id = r.get_u32()?;
            let name = r.get_string()?;
            channels.push(SearchChannel { id, name });
        }
        Ok(Self { sequence_id, flags, response_address, protocols, channels })
    }
}

/// Reply to a search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Responding server's identity.
    pub guid: [u8; 12],
    /// Echo of the request sequence number.
    pub sequence_id: u32,
    /// Where the server accepts TCP connections.
    pub server_address: SocketAddr,
    /// Transport protocol, normally `"tcp"`.
    pub protocol: String,
    /// Whether the named channels exist on this server.
    pub found: bool,
    /// Client channel ids this response covers.
    pub channel_ids: Vec<u32>,
}

impl SearchResponse {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_bytes(&self.guid);
        w.put_u32(self.sequence_id);
        encode_socket_addr(self.server_address, w);
        w.put_string(&self.protocol);
        w.put_bool(self.found);
        w.put_u16(self.channel_ids.len() as u16);
        for id in &self.channel_ids {
            w.put_u32(*id);
        }
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let guid: [u8; 12] = r
            .get_bytes(12)?
            .try_into()
            .map_err(|_| ProtocolError::InvalidEncoding("short guid"))?;
        let sequence_id = r.get_u32()?;
        let server_address = decode_socket_addr(r)?;
        let protocol = r.get_string()?;
        let found = r.get_bool()?;
        let count = r.get_u16()?;
        let mut channel_ids = Vec::with_capacity(usize::from(count).min(1024));
        for _ in 0..count {
            channel_ids.push(r.get_u32()?);
        }
        Ok(Self { guid, sequence_id, server_address, protocol, found, channel_ids })
    }
}

/// Periodic server liveness broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    /// Server identity.
    pub guid: [u8; 12],
    /// Reserved flag bits.
    pub flags: u8,
    /// Wrapping beacon counter; a regression signals a restart.
    pub sequence_id: u8,
    /// Bumped when the server's channel population changes.
    pub change_count: u16,
    /// Where the server accepts TCP connections.
    pub server_address: SocketAddr,
    /// Transport protocol.
    pub protocol: String,
    /// Optional server status structure.
    pub status: AnyValue,
}

impl Beacon {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_bytes(&self.guid);
        w.put_u8(self.flags);
        w.put_u8(self.sequence_id);
        w.put_u16(self.change_count);
        encode_socket_addr(self.server_address, w);
        w.put_string(&self.protocol);
        encode_any(&self.status, w);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let guid: [u8; 12] = r
            .get_bytes(12)?
            .try_into()
            .map_err(|_| ProtocolError::InvalidEncoding("short guid"))?;
        let flags = r.get_u8()?;
        let sequence_id = r.get_u8()?;
        let change_count = r.get_u16()?;
        let server_address = decode_socket_addr(r)?;
        let protocol = r.get_string()?;
        let status = decode_any(r)?;
        Ok(Self { guid, flags, sequence_id, change_count, server_address, protocol, status })
    }
}

/// Ingress-interface tag prepended to UDP fan-out, used by the tap-list
/// filter to reject datagrams relayed across subnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginTag {
    /// Address of the interface the datagram entered on.
    pub origin: IpAddr,
}

impl OriginTag {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        encode_ip(self.origin, w);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { origin: decode_ip(r)? })
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::ByteOrder;

    use super::*;

    #[test]
    fn search_request_round_trip() {
        let req = SearchRequest {
            sequence_id: 3,
            flags: SEARCH_UNICAST,
            response_address: "10.0.0.2:44000".parse().unwrap(),
            protocols: vec!["tcp".into()],
            channels: vec![
                SearchChannel { id: 1, name: "temp:water".into() },
                SearchChannel { id: 2, name: "pressure".into() },
            ],
        };
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let mut buf = Vec::new();
            req.encode(&mut Writer::new(&mut buf, order));
            let back = SearchRequest::decode(&mut Reader::new(&buf, order)).unwrap();
            assert_eq!(back, req);
        }
    }

    #[test]
    fn search_response_round_trip() {
        let resp = SearchResponse {
            guid: *b"abcdefghijkl",
            sequence_id: 9,
            server_address: "10.0.0.1:5075".parse().unwrap(),
            protocol: "tcp".into(),
            found: true,
            channel_ids: vec![1, 2, 3],
        };
        let mut buf = Vec::new();
        resp.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = SearchResponse::decode(&mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn beacon_round_trip_without_status() {
        let beacon = Beacon {
            guid: [7; 12],
            flags: 0,
            sequence_id: 200,
            change_count: 3,
            server_address: "172.16.0.9:5075".parse().unwrap(),
            protocol: "tcp".into(),
            status: None,
        };
        let mut buf = Vec::new();
        beacon.encode(&mut Writer::new(&mut buf, ByteOrder::Little));
        let back = Beacon::decode(&mut Reader::new(&buf, ByteOrder::Little)).unwrap();
        assert_eq!(back, beacon);
    }

    #[test]
    fn origin_tag_round_trip() {
        let tag = OriginTag { origin: "192.168.7.1".parse().unwrap() };
        let mut buf = Vec::new();
        tag.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        assert_eq!(buf.len(), 16);
        let back = OriginTag::decode(&mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, tag);
    }
}
