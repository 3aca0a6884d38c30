//! Message definitions for the arena protocol.
//!
//! Every frame on the wire is a [`Packet`]: the id of the connection that
//! authored the message followed by one [`Msg`].

mod codec;

/// Message opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Connection identity assigned by the hub.
    Id = 0x01,
    /// Join the game with a display name.
    Join = 0x02,
    /// Join refused.
    Deny = 0x03,
    /// Full player snapshot.
    Player = 0x10,
    /// Heading change.
    PlayerDirection = 0x11,
    /// Chat line.
    Chat = 0x20,
    /// A single spore appeared.
    Spore = 0x30,
    /// Bulk spore sync.
    SporesBatch = 0x31,
    /// A spore was eaten.
    SporeConsumed = 0x32,
    /// A player was eaten.
    PlayerConsumed = 0x40,
}

impl TryFrom<u8> for Opcode {
    type Error = crate::ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Opcode::Id,
            0x02 => Opcode::Join,
            0x03 => Opcode::Deny,
            0x10 => Opcode::Player,
            0x11 => Opcode::PlayerDirection,
            0x20 => Opcode::Chat,
            0x30 => Opcode::Spore,
            0x31 => Opcode::SporesBatch,
            0x32 => Opcode::SporeConsumed,
            0x40 => Opcode::PlayerConsumed,
            other => return Err(crate::ProtocolError::InvalidOpcode(other)),
        })
    }
}

/// Full player snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerMessage {
    /// Connection id owning the player.
    pub id: u64,
    pub name: Option<String>,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    /// Heading in radians.
    pub direction: f64,
    pub speed: f64,
}

/// Single spore descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SporeMessage {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

/// A message exchanged between a connection and the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Id { id: u64 },
    Join { name: String },
    Deny { reason: String },
    Player(PlayerMessage),
    PlayerDirection { direction: f64 },
    Chat { text: String },
    Spore(SporeMessage),
    SporesBatch { spores: Vec<SporeMessage> },
    SporeConsumed { spore_id: u64 },
    PlayerConsumed { player_id: u64 },
}

impl Msg {
    /// Opcode this message is framed with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Msg::Id { .. } => Opcode::Id,
            Msg::Join { .. } => Opcode::Join,
            Msg::Deny { .. } => Opcode::Deny,
            Msg::Player(_) => Opcode::Player,
            Msg::PlayerDirection { .. } => Opcode::PlayerDirection,
            Msg::Chat { .. } => Opcode::Chat,
            Msg::Spore(_) => Opcode::Spore,
            Msg::SporesBatch { .. } => Opcode::SporesBatch,
            Msg::SporeConsumed { .. } => Opcode::SporeConsumed,
            Msg::PlayerConsumed { .. } => Opcode::PlayerConsumed,
        }
    }
}

/// A message tagged with the id of the connection that authored it.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub sender_id: u64,
    pub msg: Msg,
}

impl Packet {
    pub fn new(sender_id: u64, msg: Msg) -> Self {
        Self { sender_id, msg }
    }
}
