//! PV Access wire protocol.
//!
//! The pure (no I/O, no async) layer of the stack: message framing with
//! negotiated byte order, segmentation, the self-describing type and
//! value model, the per-connection introspection cache, pvRequest parsing
//! and projection, and typed payload structs for every protocol command.
//!
//! Runtime crates (`pva-client`, `pva-server`) drive these codecs from
//! their transport loops; nothing in this crate touches a socket.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bitset;
pub mod command;
pub mod errors;
pub mod framer;
pub mod header;
pub mod mapper;
pub mod payloads;
pub mod registry;
pub mod request;
pub mod status;
pub mod types;
pub mod value;
pub mod wire;

pub use bitset::BitSet;
pub use command::{Command, ControlCommand, SubCommand};
pub use errors::{ProtocolError, Result};
pub use framer::{Reassembler, Segmenter};
pub use header::{HEADER_SIZE, Header, MAGIC, MINIMUM_REVISION, PROTOCOL_REVISION, Role,
                 Segmentation};
pub use mapper::Mapper;
pub use registry::IntrospectionRegistry;
pub use request::{PvRequest, RecordOptions};
pub use status::{Status, StatusKind};
pub use types::{FieldDesc, ScalarKind, StructDesc, StructDescBuilder};
pub use value::{PvStructure, PvUnion, PvValue, value_matches};
pub use wire::{ByteOrder, Reader, Writer};

/// Default TCP port servers listen on.
pub const DEFAULT_SERVER_PORT: u16 = 5075;

/// Default UDP port for search and beacons.
pub const DEFAULT_BROADCAST_PORT: u16 = 5076;

/// Multicast group for local-host discovery fan-out.
pub const LOCAL_MULTICAST_GROUP: std::net::Ipv4Addr = std::net::Ipv4Addr::new(224, 0, 0, 128);
