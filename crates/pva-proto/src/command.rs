//! Application and control command codes, and the subcommand bitfield
//! carried by data operations.

/// Application-level message commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Periodic server liveness broadcast.
    Beacon = 0,
    /// Server-initiated validation handshake.
    ConnectionValidation = 1,
    /// Heartbeat request/response.
    Echo = 2,
    /// Channel name search.
    Search = 3,
    /// Search reply.
    SearchResponse = 4,
    /// Authentication/authorization exchange round.
    AuthNz = 5,
    /// Access-control change notification.
    AclChange = 6,
    /// Channel creation.
    CreateChannel = 7,
    /// Channel teardown.
    DestroyChannel = 8,
    /// Handshake completion status.
    ConnectionValidated = 9,
    /// Get operation.
    Get = 10,
    /// Put operation.
    Put = 11,
    /// Combined put-then-get operation.
    PutGet = 12,
    /// Subscription operation.
    Monitor = 13,
    /// Array slice operation.
    Array = 14,
    /// Request teardown.
    DestroyRequest = 15,
    /// Record processing operation.
    Process = 16,
    /// Introspection lookup.
    GetField = 17,
    /// Informational message routed to a request's owner.
    Message = 18,
    /// Batched data (reserved).
    MultipleData = 19,
    /// Remote procedure call operation.
    Rpc = 20,
    /// Cancel an in-flight request.
    CancelRequest = 21,
    /// Ingress interface tag for UDP fan-out filtering.
    OriginTag = 22,
}

impl Command {
    /// Decode a command byte. `None` for unassigned codes.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Beacon,
            1 => Self::ConnectionValidation,
            2 => Self::Echo,
            3 => Self::Search,
            4 => Self::SearchResponse,
            5 => Self::AuthNz,
            6 => Self::AclChange,
            7 => Self::CreateChannel,
            8 => Self::DestroyChannel,
            9 => Self::ConnectionValidated,
            10 => Self::Get,
            11 => Self::Put,
            12 => Self::PutGet,
            13 => Self::Monitor,
            14 => Self::Array,
            15 => Self::DestroyRequest,
            16 => Self::Process,
            17 => Self::GetField,
            18 => Self::Message,
            19 => Self::MultipleData,
            20 => Self::Rpc,
            21 => Self::CancelRequest,
            22 => Self::OriginTag,
            _ => return None,
        })
    }

    /// The wire byte for this command.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Control-plane commands (zero payload, control bit set in flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    /// Flow-control marker (parsed, not acted upon).
    SetMarker = 0,
    /// Flow-control marker acknowledgement (parsed, not acted upon).
    AckMarker = 1,
    /// Fixes the sender's byte order for subsequent messages.
    SetByteOrder = 2,
}

impl ControlCommand {
    /// Decode a control command byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::SetMarker,
            1 => Self::AckMarker,
            2 => Self::SetByteOrder,
            _ => return None,
        })
    }

    /// The wire byte for this control command.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Subcommand bitfield carried by data-operation messages.
///
/// The monitor operation reuses three bits with operation-local meaning:
/// [`SubCommand::START`], [`SubCommand::STOP`] and [`SubCommand::ACK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubCommand(u8);

impl SubCommand {
    /// Reply expected even on success.
    pub const REPLY_REQUIRED: Self = Self(0x01);
    /// Process the record as part of the operation.
    pub const PROCESS: Self = Self(0x04);
    /// First message of an operation; negotiates the interface.
    pub const INIT: Self = Self(0x08);
    /// Last message of an operation; destroys it after completion.
    pub const DESTROY: Self = Self(0x10);
    /// Fetch data.
    pub const GET: Self = Self(0x40);
    /// Fetch the put-side structure.
    pub const GET_PUT: Self = Self(0x80);

    /// Monitor: begin delivering updates (aliases [`Self::GET`]).
    pub const START: Self = Self(0x40);
    /// Monitor: pause update delivery (aliases [`Self::PROCESS`]).
    pub const STOP: Self = Self(0x04);
    /// Monitor: pipeline flow-credit acknowledgement (aliases
    /// [`Self::GET_PUT`]).
    pub const ACK: Self = Self(0x80);

    /// An empty subcommand.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Wrap a raw subcommand byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two subcommands.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}
