//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from `config.toml` or use defaults.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    /// Load configuration from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            info!("No {} found, creating default config", path.display());
            let default_config = Self::default();
            std::fs::write(path, toml::to_string_pretty(&default_config)?)?;
            Ok(default_config)
        }
    }
}

/// Server networking settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Connections per IP limit.
    #[serde(default = "default_ip_limit")]
    pub ip_limit: usize,
    /// Capacity of each connection's event and outbound queues. A connection
    /// whose queue fills up is closed.
    #[serde(default = "default_client_queue_size")]
    pub client_queue_size: usize,
    /// Capacity of the hub's broadcast queue. Broadcasts are dropped while it is full.
    #[serde(default = "default_broadcast_queue_size")]
    pub broadcast_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            max_connections: default_max_connections(),
            ip_limit: default_ip_limit(),
            client_queue_size: default_client_queue_size(),
            broadcast_queue_size: default_broadcast_queue_size(),
        }
    }
}

fn default_port() -> u16 {
    8080
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_connections() -> usize {
    100
}
fn default_ip_limit() -> usize {
    10
}
fn default_client_queue_size() -> usize {
    256
}
fn default_broadcast_queue_size() -> usize {
    4096
}

/// Gameplay rules and simulation timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GameConfig {
    /// Target spore population, also scales the shedding probability.
    #[serde(default = "default_max_spores")]
    pub max_spores: usize,
    #[serde(default = "default_spore_replenish_interval")]
    pub spore_replenish_interval_ms: u64,
    /// Most spores added per replenish period.
    #[serde(default = "default_spore_replenish_batch")]
    pub spore_replenish_batch: usize,
    /// Half-width of the initial spawn square.
    #[serde(default = "default_spawn_bound")]
    pub spawn_bound: f64,
    #[serde(default = "default_start_speed")]
    pub start_speed: f64,
    #[serde(default = "default_start_radius")]
    pub start_radius: f64,
    /// Players at or below this radius never shed spores.
    #[serde(default = "default_shed_min_radius")]
    pub shed_min_radius: f64,
    /// Slack added to proximity checks on consumption claims.
    #[serde(default = "default_claim_buffer")]
    pub claim_buffer: f64,
    /// A player must be this many times larger than its victim.
    #[serde(default = "default_eat_ratio")]
    pub eat_ratio: f64,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Spores per batch in the initial sync of a new player.
    #[serde(default = "default_spore_batch_size")]
    pub spore_batch_size: usize,
    #[serde(default = "default_spore_batch_delay")]
    pub spore_batch_delay_ms: u64,
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

impl GameConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn spore_batch_delay(&self) -> Duration {
        Duration::from_millis(self.spore_batch_delay_ms)
    }

    pub fn spore_replenish_interval(&self) -> Duration {
        Duration::from_millis(self.spore_replenish_interval_ms)
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            max_spores: default_max_spores(),
            spore_replenish_interval_ms: default_spore_replenish_interval(),
            spore_replenish_batch: default_spore_replenish_batch(),
            spawn_bound: default_spawn_bound(),
            start_speed: default_start_speed(),
            start_radius: default_start_radius(),
            shed_min_radius: default_shed_min_radius(),
            claim_buffer: default_claim_buffer(),
            eat_ratio: default_eat_ratio(),
            tick_interval_ms: default_tick_interval(),
            spore_batch_size: default_spore_batch_size(),
            spore_batch_delay_ms: default_spore_batch_delay(),
            max_name_length: default_max_name_length(),
        }
    }
}

fn default_max_spores() -> usize {
    1000
}
fn default_spore_replenish_interval() -> u64 {
    2000
}
fn default_spore_replenish_batch() -> usize {
    10
}
fn default_spawn_bound() -> f64 {
    3000.0
}
fn default_start_speed() -> f64 {
    150.0
}
fn default_start_radius() -> f64 {
    20.0
}
fn default_shed_min_radius() -> f64 {
    10.0
}
fn default_claim_buffer() -> f64 {
    10.0
}
fn default_eat_ratio() -> f64 {
    1.5
}
fn default_tick_interval() -> u64 {
    50
}
fn default_spore_batch_size() -> usize {
    20
}
fn default_spore_batch_delay() -> u64 {
    50
}
fn default_max_name_length() -> usize {
    16
}

/// Score database settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "db.sqlite".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [game]
            max_spores = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.client_queue_size, 256);
        assert_eq!(config.game.max_spores, 50);
        assert_eq!(config.game.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.game.spore_batch_size, 20);
        assert_eq!(config.database.path, "db.sqlite");
    }

    #[test]
    fn test_default_config_survives_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.game.eat_ratio, 1.5);
        assert_eq!(parsed.game.claim_buffer, 10.0);
    }
}
