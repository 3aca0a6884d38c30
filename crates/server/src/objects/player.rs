//! Player entity and the mass/radius relation.

use glam::DVec2;
use protocol::PlayerMessage;
use std::f64::consts::PI;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Convert a radius to its mass (`π·r²`).
#[inline]
pub fn radius_to_mass(radius: f64) -> f64 {
    PI * radius * radius
}

/// Convert a mass back to a radius.
#[inline]
pub fn mass_to_radius(mass: f64) -> f64 {
    (mass.max(0.0) / PI).sqrt()
}

/// Radius after gaining (or, when negative, losing) `mass_diff`.
#[inline]
pub fn grow_radius(radius: f64, mass_diff: f64) -> f64 {
    mass_to_radius(radius_to_mass(radius) + mass_diff)
}

/// Durable player row the best score is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: i64,
    pub name: String,
    pub best_score: i64,
}

/// A player controlled by one connection.
#[derive(Debug, Clone)]
pub struct Player {
    pub name: String,
    pub position: DVec2,
    /// Heading in radians.
    pub direction: f64,
    pub speed: f64,
    pub radius: f64,
    pub best_score: i64,
    /// Row id in the score database.
    pub db_id: i64,
}

impl Player {
    /// A player that has not been placed yet.
    pub fn from_record(record: &PlayerRecord) -> Self {
        Self {
            name: record.name.clone(),
            position: DVec2::ZERO,
            direction: 0.0,
            speed: 0.0,
            radius: 0.0,
            best_score: record.best_score,
            db_id: record.id,
        }
    }

    pub fn mass(&self) -> f64 {
        radius_to_mass(self.radius)
    }

    /// Score the player would be credited with right now.
    pub fn score(&self) -> i64 {
        self.mass().floor() as i64
    }

    /// Add (or remove) mass, keeping `mass = π·r²`.
    pub fn gain_mass(&mut self, mass_diff: f64) {
        self.radius = grow_radius(self.radius, mass_diff);
    }

    /// Advance along the current heading.
    pub fn advance(&mut self, dt: f64) {
        let heading = DVec2::new(self.direction.cos(), self.direction.sin());
        self.position += heading * self.speed * dt;
    }

    pub fn to_message(&self, id: u64) -> PlayerMessage {
        PlayerMessage {
            id,
            name: Some(self.name.clone()),
            x: self.position.x,
            y: self.position.y,
            radius: self.radius,
            direction: self.direction,
            speed: self.speed,
        }
    }
}

/// A player shared between its owning state, its tick task and other connections.
#[derive(Debug, Clone)]
pub struct SharedPlayer(Arc<RwLock<Player>>);

impl SharedPlayer {
    pub fn new(player: Player) -> Self {
        Self(Arc::new(RwLock::new(player)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Player> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Player> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles point at the same player instance.
    pub fn same_as(&self, other: &SharedPlayer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakPlayer {
        WeakPlayer(Arc::downgrade(&self.0))
    }
}

/// Non-owning reference to a player, used to remember who dropped a spore.
#[derive(Debug, Clone)]
pub struct WeakPlayer(std::sync::Weak<RwLock<Player>>);

impl WeakPlayer {
    /// Whether this refers to `player`. Compares identity, not contents.
    pub fn is(&self, player: &SharedPlayer) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&player.0))
    }
}
