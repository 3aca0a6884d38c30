//! World objects shared between connections.

mod collection;
mod player;
mod spawn;
mod spore;

pub use collection::SharedCollection;
pub use player::{
    grow_radius, mass_to_radius, radius_to_mass, Player, PlayerRecord, SharedPlayer, WeakPlayer,
};
pub use spawn::spawn_coords;
pub use spore::Spore;

use rand::Rng;
use std::sync::Arc;

/// Players and spores visible to every connection.
#[derive(Debug, Default)]
pub struct SharedGameObjects {
    /// Players keyed by their connection id.
    pub players: SharedCollection<SharedPlayer>,
    pub spores: SharedCollection<Arc<Spore>>,
}

impl SharedGameObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a wild spore somewhere clear of live players and store it.
    pub fn spawn_wild_spore(&self, bound: f64) -> (u64, Arc<Spore>) {
        let radius = rand::rng().random_range(5.0..15.0);
        let at = spawn_coords(radius, bound, &self.players);
        let spore = Arc::new(Spore::wild(at.x, at.y, radius));
        let id = self.spores.add(Arc::clone(&spore));
        (id, spore)
    }
}
