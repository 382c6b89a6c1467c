//! Typed payload structs, one module per message family.
//!
//! Discovery and session payloads are self-contained (no introspection
//! cache involved); operation payloads thread the per-connection
//! [`crate::registry::IntrospectionRegistry`] through their encode/decode
//! because the descriptors they carry use the cached id forms.

pub mod channel;
pub mod discovery;
pub mod operation;
pub mod session;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{
    errors::Result,
    types::FieldDesc,
    value::PvValue,
    wire::{Reader, Writer},
};

/// Encode an IP address in the 16-byte IPv6-mapped form used by search,
/// beacon and origin-tag payloads.
pub fn encode_ip(addr: IpAddr, w: &mut Writer<'_>) {
    let v6 = match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    w.put_bytes(&v6.octets());
}

/// Decode a 16-byte IPv6-mapped address, collapsing mapped IPv4.
pub fn decode_ip(r: &mut Reader<'_>) -> Result<IpAddr> {
    let raw: [u8; 16] = r.get_bytes(16)?.try_into().unwrap_or([0; 16]);
    let v6 = Ipv6Addr::from(raw);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

/// Encode an address + port pair.
pub fn encode_socket_addr(addr: SocketAddr, w: &mut Writer<'_>) {
    encode_ip(addr.ip(), w);
    w.put_u16(addr.port());
}

/// Decode an address + port pair.
pub fn decode_socket_addr(r: &mut Reader<'_>) -> Result<SocketAddr> {
    let ip = decode_ip(r)?;
    let port = r.get_u16()?;
    Ok(SocketAddr::new(ip, port))
}

/// The unspecified IPv4 address, used when a response address is "any
/// local".
pub fn unspecified() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

/// A self-describing value: full descriptor plus data, with a null form.
///
/// Used where a payload carries arbitrary structure outside the cached-id
/// machinery (beacon status, auth exchange data).
pub type AnyValue = Option<(FieldDesc, PvValue)>;

/// Encode an [`AnyValue`]; `None` writes the null selector byte.
pub fn encode_any(value: &AnyValue, w: &mut Writer<'_>) {
    match value {
        None => w.put_u8(0xFF),
        Some((desc, data)) => {
            desc.encode_full(w);
            data.serialize(w);
        }
    }
}

/// Decode an [`AnyValue`].
pub fn decode_any(r: &mut Reader<'_>) -> Result<AnyValue> {
    let code = r.get_u8()?;
    if code == 0xFF {
        return Ok(None);
    }
    let desc = FieldDesc::decode_full_after_code(code, r)?;
    let value = PvValue::deserialize(&desc, r)?;
    Ok(Some((desc, value)))
}
