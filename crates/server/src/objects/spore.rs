//! Spores: passive consumables.

use protocol::SporeMessage;
use tokio::time::Instant;

use super::player::{SharedPlayer, WeakPlayer};

#[derive(Debug, Clone)]
pub struct Spore {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    /// Player that shed this spore. Only used for the drop cooldown.
    pub dropped_by: Option<WeakPlayer>,
    pub dropped_at: Instant,
}

impl Spore {
    /// A spore created by the world rather than shed by a player.
    pub fn wild(x: f64, y: f64, radius: f64) -> Self {
        Self {
            x,
            y,
            radius,
            dropped_by: None,
            dropped_at: Instant::now(),
        }
    }

    /// A spore shed by `player` at its current position.
    pub fn shed_by(player: &SharedPlayer, x: f64, y: f64, radius: f64) -> Self {
        Self {
            x,
            y,
            radius,
            dropped_by: Some(player.downgrade()),
            dropped_at: Instant::now(),
        }
    }

    pub fn was_dropped_by(&self, player: &SharedPlayer) -> bool {
        self.dropped_by.as_ref().is_some_and(|weak| weak.is(player))
    }

    pub fn to_message(&self, id: u64) -> SporeMessage {
        SporeMessage {
            id,
            x: self.x,
            y: self.y,
            radius: self.radius,
        }
    }
}
