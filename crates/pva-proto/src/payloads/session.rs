//! Connection-lifecycle payloads: validation handshake, auth exchange,
//! echo heartbeat, and requester messages.

use crate::{
    errors::{ProtocolError, Result},
    payloads::{AnyValue, decode_any, encode_any},
    status::{Status, StatusKind},
    wire::{Reader, Writer},
};

/// Server's opening message on a fresh TCP connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRequest {
    /// Server's receive buffer size in bytes.
    pub server_receive_buffer_size: u32,
    /// Server's introspection registry capacity.
    pub server_registry_size: u16,
    /// Authentication plugins the server offers, in preference order.
    pub auth_plugins: Vec<String>,
    /// Server identity.
    pub server_guid: [u8; 12],
}

impl ValidationRequest {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.server_receive_buffer_size);
        w.put_u16(self.server_registry_size);
        w.put_size(self.auth_plugins.len());
        for p in &self.auth_plugins {
            w.put_string(p);
        }
        w.put_bytes(&self.server_guid);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let server_receive_buffer_size = r.get_u32()?;
        let server_registry_size = r.get_u16()?;
        let count = r.get_size()?;
        let mut auth_plugins = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            auth_plugins.push(r.get_string()?);
        }
        let server_guid: [u8; 12] = r
            .get_bytes(12)?
            .try_into()
            .map_err(|_| ProtocolError::InvalidEncoding("short guid"))?;
        Ok(Self { server_receive_buffer_size, server_registry_size, auth_plugins, server_guid })
    }
}

/// Client's reply selecting an auth plugin and buffer size.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResponse {
    /// Client's receive buffer size in bytes.
    pub client_receive_buffer_size: u32,
    /// Client's introspection registry capacity.
    pub client_registry_size: u16,
    /// The chosen authentication plugin.
    pub auth_plugin: String,
    /// Plugin-specific initialization data.
    pub auth_data: AnyValue,
}

impl ValidationResponse {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.client_receive_buffer_size);
        w.put_u16(self.client_registry_size);
        w.put_string(&self.auth_plugin);
        encode_any(&self.auth_data, w);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            client_receive_buffer_size: r.get_u32()?,
            client_registry_size: r.get_u16()?,
            auth_plugin: r.get_string()?,
            auth_data: decode_any(r)?,
        })
    }
}

/// One round of the authentication/authorization exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthNzMessage {
    /// Plugin-specific exchange data.
    pub data: AnyValue,
}

impl AuthNzMessage {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        encode_any(&self.data, w);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { data: decode_any(r)? })
    }
}

/// Handshake completion; application traffic is gated on a success
/// status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionValidated {
    /// Outcome of validation (including any auth rounds).
    pub status: Status,
}

impl ConnectionValidated {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        self.status.encode(w);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self { status: Status::decode(r)? })
    }
}

/// Echo heartbeat; the payload is opaque and echoed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Echo {
    /// Opaque bytes, echoed back by the peer.
    pub payload: Vec<u8>,
}

impl Echo {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_bytes(&self.payload);
    }

    /// Deserialize: the entire remaining payload.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let n = r.remaining();
        Ok(Self { payload: r.get_bytes(n)?.to_vec() })
    }
}

/// Informational text routed to the owner of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageNotify {
    /// The request this message is about.
    pub request_id: u32,
    /// Severity of the message.
    pub kind: StatusKind,
    /// The text.
    pub message: String,
}

impl MessageNotify {
    /// Serialize.
    pub fn encode(&self, w: &mut Writer<'_>) {
        w.put_u32(self.request_id);
        w.put_u8(self.kind as u8);
        w.put_string(&self.message);
    }

    /// Deserialize.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let request_id = r.get_u32()?;
        let kind = match r.get_u8()? {
            0 => StatusKind::Ok,
            1 => StatusKind::Warning,
            2 => StatusKind::Error,
            3 => StatusKind::Fatal,
            _ => return Err(ProtocolError::InvalidEncoding("message kind out of range")),
        };
        Ok(Self { request_id, kind, message: r.get_string()? })
    }
}
