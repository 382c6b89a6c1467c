//! Channel creation and teardown payloads.

use crate::{
    errors::Result,
    status::Status,
    wire::{Reader, Writer},
};

/// Client request to create one or more channels by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelRequest {
    /// `(client channel id, name)` pairs.
    pub channels: Vec<(u32, String)>,
}

impl CreateChannelRequest {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u16(self.channels.len() as u16);
        for (cid, name) in &self.channels {
            w.put_u32(*cid);
            w.put_string(name);
        }
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let count = r.get_u16()?;
        let mut channels = Vec::with_capacity(usize::from(count).min(1024));
        for _ in 0..count {
            let cid = r.get_u32()?;
            channels.push((cid, r.get_string()?));
        }
        Ok(Self { channels })
    }
}

/// Server reply to a channel creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    /// Echo of the client channel id.
    pub client_id: u32,
    /// Server-assigned channel id, unique within the connection. Zero
    /// when `status` is a failure.
    pub server_id: u32,
    /// Outcome.
    pub status: Status,
}

impl CreateChannelResponse {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.client_id);
        w.put_u32(self.server_id);
        self.status.encode(w);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            client_id: r.get_u32()?,
            server_id: r.get_u32()?,
            status: Status::decode(r)?,
        })
    }
}

/// Channel teardown; the same shape serves as request and acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyChannel {
    /// Server-assigned channel id.
    pub server_id: u32,
    /// Client channel id.
    pub client_id: u32,
}

impl DestroyChannel {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.server_id);
        w.put_u32(self.client_id);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { server_id: r.get_u32()?, client_id: r.get_u32()? })
    }
}

#[cfg(test)]
mod tests {
    use crate::wire::ByteOrder;

    use super::*;

    #[test]
    fn create_channel_round_trip() {
        let req = CreateChannelRequest {
            channels: vec![(1, "temp:water".into()), (2, "int1".into())],
        };
        let mut buf = Vec::new();
        req.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = CreateChannelRequest::decode(&mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn create_channel_response_round_trip() {
        let resp = CreateChannelResponse {
            client_id: 2,
            server_id: 0,
            status: Status::error("channel not found"),
        };
        let mut buf = Vec::new();
        resp.encode(&mut Writer::new(&mut buf, ByteOrder::Little));
        let back =
            CreateChannelResponse::decode(&mut Reader::new(&buf, ByteOrder::Little)).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn destroy_channel_round_trip() {
        let req = DestroyChannel { server_id: 17, client_id: 3 };
        let mut buf = Vec::new();
        req.encode(&mut Writer::new(&mut buf, ByteOrder::Big));
        let back = DestroyChannel::decode(&mut Reader::new(&buf, ByteOrder::Big)).unwrap();
        assert_eq!(back, req);
    }
}
