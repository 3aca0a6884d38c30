//! Spawn placement.

use glam::DVec2;
use rand::Rng;

use super::{SharedCollection, SharedPlayer};

const TRIES_PER_ROUND: usize = 25;
const ROUNDS: usize = 3;

/// Find a point in `[-bound, bound]²` where a circle of `radius` overlaps no live player.
///
/// The square is doubled after each unsuccessful round; after the last round
/// the origin is returned.
pub fn spawn_coords(radius: f64, bound: f64, players: &SharedCollection<SharedPlayer>) -> DVec2 {
    let occupied: Vec<(DVec2, f64)> = players
        .snapshot()
        .into_iter()
        .map(|(_, player)| {
            let player = player.read();
            (player.position, player.radius)
        })
        .collect();

    let mut rng = rand::rng();
    let mut bound = bound.max(1.0);
    for _ in 0..ROUNDS {
        for _ in 0..TRIES_PER_ROUND {
            let candidate = DVec2::new(
                rng.random_range(-bound..=bound),
                rng.random_range(-bound..=bound),
            );
            if is_clear(candidate, radius, &occupied) {
                return candidate;
            }
        }
        bound *= 2.0;
    }
    DVec2::ZERO
}

fn is_clear(candidate: DVec2, radius: f64, occupied: &[(DVec2, f64)]) -> bool {
    occupied.iter().all(|&(position, other_radius)| {
        let min_dist = radius + other_radius;
        candidate.distance_squared(position) > min_dist * min_dist
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Player, PlayerRecord};

    fn player_at(x: f64, y: f64, radius: f64) -> SharedPlayer {
        let mut player = Player::from_record(&PlayerRecord {
            id: 0,
            name: "p".into(),
            best_score: 0,
        });
        player.position = DVec2::new(x, y);
        player.radius = radius;
        SharedPlayer::new(player)
    }

    #[test]
    fn test_spawn_avoids_players() {
        let players = SharedCollection::new();
        players.insert(1, player_at(0.0, 0.0, 90.0));
        for _ in 0..50 {
            let at = spawn_coords(20.0, 100.0, &players);
            assert!(at.length() > 110.0 || at == DVec2::ZERO);
        }
    }

    #[test]
    fn test_spawn_in_empty_world_stays_in_bound() {
        let players = SharedCollection::new();
        let at = spawn_coords(20.0, 50.0, &players);
        assert!(at.x.abs() <= 50.0 && at.y.abs() <= 50.0);
    }
}
