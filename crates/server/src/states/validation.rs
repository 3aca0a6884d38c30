//! Checks applied to consumption claims made by a connection about itself.

use glam::DVec2;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::objects::{SharedPlayer, Spore};

/// Why a consumption claim was refused. Never reported to the client.
#[derive(Debug, Error, PartialEq)]
pub enum ClaimError {
    #[error("spore {0} does not exist")]
    SporeNotFound(u64),

    #[error("player {0} does not exist")]
    PlayerNotFound(u64),

    #[error("player is too far from the object (dist_sq: {dist_sq:.1}, threshold_sq: {threshold_sq:.1})")]
    TooFar { dist_sq: f64, threshold_sq: f64 },

    #[error("player radius {radius:.1} is not big enough to eat radius {victim_radius:.1}")]
    TooSmall { radius: f64, victim_radius: f64 },

    #[error("player dropped the spore too recently ({elapsed:?} since drop, need {required:?})")]
    DropCooldown { elapsed: Duration, required: Duration },

    #[error("object {0} was already consumed")]
    AlreadyConsumed(u64),
}

/// The consumer must overlap the target, give or take `buffer`.
///
/// Compares squared distances.
pub fn check_proximity(
    position: DVec2,
    radius: f64,
    target: DVec2,
    target_radius: f64,
    buffer: f64,
) -> Result<(), ClaimError> {
    let dist_sq = position.distance_squared(target);
    let threshold = radius + buffer + target_radius;
    let threshold_sq = threshold * threshold;
    if dist_sq > threshold_sq {
        return Err(ClaimError::TooFar {
            dist_sq,
            threshold_sq,
        });
    }
    Ok(())
}

/// A player may only eat another player more than `ratio` times smaller.
pub fn check_eat_ratio(radius: f64, victim_radius: f64, ratio: f64) -> Result<(), ClaimError> {
    if radius <= victim_radius * ratio {
        return Err(ClaimError::TooSmall {
            radius,
            victim_radius,
        });
    }
    Ok(())
}

/// A player cannot eat its own spore before it could have moved clear of it.
pub fn check_drop_cooldown(
    spore: &Spore,
    claimant: &SharedPlayer,
    radius: f64,
    speed: f64,
    buffer: f64,
    now: Instant,
) -> Result<(), ClaimError> {
    if !spore.was_dropped_by(claimant) {
        return Ok(());
    }

    let min_distance = spore.radius + radius - buffer;
    let secs = min_distance / speed;
    let required = if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    };

    let elapsed = now.saturating_duration_since(spore.dropped_at);
    if elapsed < required {
        return Err(ClaimError::DropCooldown { elapsed, required });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Player, PlayerRecord};

    fn shared_player() -> SharedPlayer {
        SharedPlayer::new(Player::from_record(&PlayerRecord {
            id: 1,
            name: "p".into(),
            best_score: 0,
        }))
    }

    #[test]
    fn test_proximity_boundary() {
        // 20 + 10 + 5 = 35
        let at = DVec2::ZERO;
        assert!(check_proximity(at, 20.0, DVec2::new(35.0, 0.0), 5.0, 10.0).is_ok());
        assert!(matches!(
            check_proximity(at, 20.0, DVec2::new(35.1, 0.0), 5.0, 10.0),
            Err(ClaimError::TooFar { .. })
        ));
    }

    #[test]
    fn test_eat_ratio() {
        assert!(check_eat_ratio(31.0, 20.0, 1.5).is_ok());
        assert!(check_eat_ratio(30.0, 20.0, 1.5).is_err());
        assert!(check_eat_ratio(10.0, 20.0, 1.5).is_err());
    }

    #[test]
    fn test_cooldown_only_applies_to_own_spores() {
        let me = shared_player();
        let other = shared_player();
        let now = Instant::now();
        let spore = Spore::shed_by(&other, 0.0, 0.0, 5.0);
        assert!(check_drop_cooldown(&spore, &me, 20.0, 150.0, 10.0, now).is_ok());
        let wild = Spore::wild(0.0, 0.0, 5.0);
        assert!(check_drop_cooldown(&wild, &me, 20.0, 150.0, 10.0, now).is_ok());
    }

    #[test]
    fn test_cooldown_elapses() {
        let me = shared_player();
        let spore = Spore::shed_by(&me, 0.0, 0.0, 5.0);
        // (5 + 20 - 10) / 150 = 100ms
        let dropped = spore.dropped_at;
        assert!(matches!(
            check_drop_cooldown(&spore, &me, 20.0, 150.0, 10.0, dropped + Duration::from_millis(50)),
            Err(ClaimError::DropCooldown { .. })
        ));
        assert!(
            check_drop_cooldown(&spore, &me, 20.0, 150.0, 10.0, dropped + Duration::from_millis(101))
                .is_ok()
        );
    }

    #[test]
    fn test_cooldown_without_speed_is_skipped() {
        let me = shared_player();
        let spore = Spore::shed_by(&me, 0.0, 0.0, 5.0);
        assert!(check_drop_cooldown(&spore, &me, 20.0, 0.0, 10.0, spore.dropped_at).is_ok());
    }
}
