//! Frame encoding and decoding.
//!
//! Layout: `sender_id: u64`, `opcode: u8`, then the opcode's payload.

use bytes::Bytes;

use super::{Msg, Opcode, Packet, PlayerMessage, SporeMessage};
use crate::{BinaryReader, BinaryWriter, ProtocolError};

impl Packet {
    /// Encode this packet into a binary frame.
    pub fn encode(&self) -> Bytes {
        let mut w = BinaryWriter::with_capacity(32);
        w.put_u64(self.sender_id);
        w.put_u8(self.msg.opcode() as u8);

        match &self.msg {
            Msg::Id { id } => w.put_u64(*id),
            Msg::Join { name } => w.put_string_utf8(name),
            Msg::Deny { reason } => w.put_string_utf8(reason),
            Msg::Player(player) => {
                w.put_u64(player.id);
                w.put_f64(player.x);
                w.put_f64(player.y);
                w.put_f64(player.radius);
                w.put_f64(player.direction);
                w.put_f64(player.speed);
                match &player.name {
                    Some(name) => {
                        w.put_u8(1);
                        w.put_string_utf8(name);
                    }
                    None => w.put_u8(0),
                }
            }
            Msg::PlayerDirection { direction } => w.put_f64(*direction),
            Msg::Chat { text } => w.put_string_utf8(text),
            Msg::Spore(spore) => put_spore(&mut w, spore),
            Msg::SporesBatch { spores } => {
                w.put_u32(spores.len() as u32);
                for spore in spores {
                    put_spore(&mut w, spore);
                }
            }
            Msg::SporeConsumed { spore_id } => w.put_u64(*spore_id),
            Msg::PlayerConsumed { player_id } => w.put_u64(*player_id),
        }

        w.finish()
    }

    /// Decode a packet from a binary frame.
    pub fn decode(data: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let mut r = BinaryReader::new(data);
        let sender_id = r.get_u64()?;
        let opcode = Opcode::try_from(r.get_u8()?)?;

        let msg = match opcode {
            Opcode::Id => Msg::Id { id: r.get_u64()? },
            Opcode::Join => Msg::Join {
                name: r.get_string_utf8()?,
            },
            Opcode::Deny => Msg::Deny {
                reason: r.get_string_utf8()?,
            },
            Opcode::Player => {
                let id = r.get_u64()?;
                let x = r.get_f64()?;
                let y = r.get_f64()?;
                let radius = r.get_f64()?;
                let direction = r.get_f64()?;
                let speed = r.get_f64()?;
                let name = match r.get_u8()? {
                    0 => None,
                    1 => Some(r.get_string_utf8()?),
                    flag => return Err(ProtocolError::InvalidFlag(flag)),
                };
                Msg::Player(PlayerMessage {
                    id,
                    name,
                    x,
                    y,
                    radius,
                    direction,
                    speed,
                })
            }
            Opcode::PlayerDirection => Msg::PlayerDirection {
                direction: r.get_f64()?,
            },
            Opcode::Chat => Msg::Chat {
                text: r.get_string_utf8()?,
            },
            Opcode::Spore => Msg::Spore(get_spore(&mut r)?),
            Opcode::SporesBatch => {
                let count = r.get_u32()? as usize;
                // Each spore takes 32 bytes; cap the allocation by what is actually there.
                let mut spores = Vec::with_capacity(count.min(r.remaining() / 32));
                for _ in 0..count {
                    spores.push(get_spore(&mut r)?);
                }
                Msg::SporesBatch { spores }
            }
            Opcode::SporeConsumed => Msg::SporeConsumed {
                spore_id: r.get_u64()?,
            },
            Opcode::PlayerConsumed => Msg::PlayerConsumed {
                player_id: r.get_u64()?,
            },
        };

        Ok(Packet { sender_id, msg })
    }
}

fn put_spore(w: &mut BinaryWriter, spore: &SporeMessage) {
    w.put_u64(spore.id);
    w.put_f64(spore.x);
    w.put_f64(spore.y);
    w.put_f64(spore.radius);
}

fn get_spore(r: &mut BinaryReader) -> Result<SporeMessage, ProtocolError> {
    Ok(SporeMessage {
        id: r.get_u64()?,
        x: r.get_f64()?,
        y: r.get_f64()?,
        radius: r.get_f64()?,
    })
}
