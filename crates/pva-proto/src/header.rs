//! The 8-byte message header.
//!
//! ```text
//! magic:u8 = 0xCA | version:u8 | flags:u8 | command:u8 | payload_size:u32
//! ```
//!
//! Flags: bit 7 = byte order of this message (1 = big endian), bit 6 =
//! sender role (1 = server), bits 4–5 = segmentation, bit 0 = control
//! message. The payload size is encoded in the byte order declared by the
//! header's own flags, so every header is self-describing.

use crate::{
    errors::{ProtocolError, Result},
    wire::{ByteOrder, Reader, Writer},
};

/// Protocol magic byte.
pub const MAGIC: u8 = 0xCA;

/// Protocol revision this implementation speaks.
pub const PROTOCOL_REVISION: u8 = 2;

/// Oldest peer revision accepted.
pub const MINIMUM_REVISION: u8 = 2;

/// Serialized header length in bytes.
pub const HEADER_SIZE: usize = 8;

const FLAG_CONTROL: u8 = 0x01;
const FLAG_SERVER_ROLE: u8 = 0x40;
const FLAG_BIG_ENDIAN: u8 = 0x80;
const SEGMENT_SHIFT: u8 = 4;
const SEGMENT_MASK: u8 = 0x30;

/// Position of a frame within a segmented logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Segmentation {
    /// Unsegmented message.
    Complete = 0,
    /// First frame of a chain.
    First = 1,
    /// Final frame of a chain.
    Last = 2,
    /// Interior frame of a chain.
    Middle = 3,
}

impl Segmentation {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => Self::First,
            2 => Self::Last,
            3 => Self::Middle,
            _ => Self::Complete,
        }
    }
}

/// Which side of the connection produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client side.
    Client,
    /// Server side.
    Server,
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Peer protocol revision.
    pub version: u8,
    /// Byte order of this message's payload (and its own size field).
    pub order: ByteOrder,
    /// Sender role.
    pub role: Role,
    /// Segmentation position.
    pub segmentation: Segmentation,
    /// True for control-plane messages (zero payload).
    pub control: bool,
    /// Command byte; application or control command depending on
    /// [`Header::control`].
    pub command: u8,
    /// Payload length in bytes. Carries the control payload for control
    /// messages.
    pub payload_size: u32,
}

impl Header {
    /// Build an application-message header.
    pub fn data(command: u8, role: Role, order: ByteOrder, payload_size: u32) -> Self {
        Self {
            version: PROTOCOL_REVISION,
            order,
            role,
            segmentation: Segmentation::Complete,
            control: false,
            command,
            payload_size,
        }
    }

    /// Build a control-message header. The size field doubles as the
    /// control payload and is zero for every currently assigned control
    /// command.
    pub fn control(command: u8, role: Role, order: ByteOrder) -> Self {
        Self {
            version: PROTOCOL_REVISION,
            order,
            role,
            segmentation: Segmentation::Complete,
            control: true,
            command,
            payload_size: 0,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.control {
            flags |= FLAG_CONTROL;
        }
        if self.role == Role::Server {
            flags |= FLAG_SERVER_ROLE;
        }
        if self.order == ByteOrder::Big {
            flags |= FLAG_BIG_ENDIAN;
        }
        flags | ((self.segmentation as u8) << SEGMENT_SHIFT)
    }

    /// Append the 8 header bytes to `dst`.
    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.push(MAGIC);
        dst.push(self.version);
        dst.push(self.flags());
        dst.push(self.command);
        let mut w = Writer::new(dst, self.order);
        w.put_u32(self.payload_size);
    }

    /// Decode a header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ShortFrame`] if fewer than 8 bytes are buffered
    /// - [`ProtocolError::BadMagic`] on a magic mismatch
    /// - [`ProtocolError::BadVersion`] for peers below the minimum revision
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortFrame {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != MAGIC {
            return Err(ProtocolError::BadMagic(bytes[0]));
        }
        let version = bytes[1];
        if version < MINIMUM_REVISION {
            return Err(ProtocolError::BadVersion { actual: version, minimum: MINIMUM_REVISION });
        }

        let flags = bytes[2];
        let order = if flags & FLAG_BIG_ENDIAN != 0 { ByteOrder::Big } else { ByteOrder::Little };
        let role = if flags & FLAG_SERVER_ROLE != 0 { Role::Server } else { Role::Client };
        let segmentation = Segmentation::from_bits((flags & SEGMENT_MASK) >> SEGMENT_SHIFT);
        let control = flags & FLAG_CONTROL != 0;

        let mut r = Reader::new(&bytes[4..HEADER_SIZE], order);
        let payload_size = r.get_u32()?;

        Ok(Self {
            version,
            order,
            role,
            segmentation,
            control,
            command: bytes[3],
            payload_size,
        })
    }

    /// Peek a complete frame at the front of `buf`.
    ///
    /// Returns `None` while the buffer holds less than a full frame, and
    /// the decoded header plus total frame length (header + payload) once
    /// one is available. Header-level errors surface immediately so a
    /// corrupt stream fails fast.
    pub fn peek_frame(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Self::decode(buf)?;
        let payload = if header.control { 0 } else { header.payload_size as usize };
        let total = HEADER_SIZE + payload;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((header, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let header = Header::data(13, Role::Server, order, 0xDEAD);
            let mut buf = Vec::new();
            header.encode(&mut buf);
            assert_eq!(buf.len(), HEADER_SIZE);
            assert_eq!(Header::decode(&buf).unwrap(), header);
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = Vec::new();
        Header::data(2, Role::Client, ByteOrder::Big, 0).encode(&mut buf);
        buf[0] = 0xCB;
        assert_eq!(Header::decode(&buf), Err(ProtocolError::BadMagic(0xCB)));
    }

    #[test]
    fn rejects_old_revision() {
        let mut buf = Vec::new();
        Header::data(2, Role::Client, ByteOrder::Big, 0).encode(&mut buf);
        buf[1] = 1;
        assert_eq!(
            Header::decode(&buf),
            Err(ProtocolError::BadVersion { actual: 1, minimum: MINIMUM_REVISION })
        );
    }

    #[test]
    fn short_header_is_short_frame() {
        assert_eq!(
            Header::decode(&[MAGIC, 2, 0]),
            Err(ProtocolError::ShortFrame { expected: HEADER_SIZE, actual: 3 })
        );
    }

    #[test]
    fn peek_waits_for_full_payload() {
        let mut buf = Vec::new();
        Header::data(10, Role::Server, ByteOrder::Big, 4).encode(&mut buf);
        assert_eq!(Header::peek_frame(&buf).unwrap(), None);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let (header, total) = Header::peek_frame(&buf).unwrap().unwrap();
        assert_eq!(header.command, 10);
        assert_eq!(total, HEADER_SIZE + 4);
    }

    #[test]
    fn control_flag_and_segmentation_survive() {
        let mut header = Header::control(2, Role::Client, ByteOrder::Little);
        header.segmentation = Segmentation::Middle;
        let mut buf = Vec::new();
        header.encode(&mut buf);
        let back = Header::decode(&buf).unwrap();
        assert!(back.control);
        assert_eq!(back.segmentation, Segmentation::Middle);
        assert_eq!(back.role, Role::Client);
    }
}
