//! Shared protocol crate for the spore arena.
//!
//! This crate contains:
//! - Binary reading/writing utilities
//! - The message model exchanged between clients and the hub
//! - Frame encoding and decoding

mod binary;
mod error;
pub mod packets;

pub use binary::{BinaryReader, BinaryWriter};
pub use error::ProtocolError;
pub use packets::{Msg, Packet, PlayerMessage, SporeMessage};

/// Sender id used for messages authored by the server itself.
pub const SERVER_ID: u64 = 0;
