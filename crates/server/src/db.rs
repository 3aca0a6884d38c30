//! Score persistence.
//!
//! The in-game core only ever writes a player's best score; looking up (or
//! creating) the player row happens once when a connection joins. Both run on
//! the blocking pool through [`DbTx`], never on a connection's own task.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::info;

use crate::objects::PlayerRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS players (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    best_score  INTEGER NOT NULL DEFAULT 0
);
";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("player {0} does not exist")]
    PlayerNotFound(i64),

    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Parameters of the best-score write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateBestScore {
    pub id: i64,
    pub best_score: i64,
}

/// Durable player storage.
pub trait ScoreStore: Send + Sync {
    /// Fetch the player row for `name`, creating it with a zero best score if missing.
    fn find_or_create_player(&self, name: &str) -> Result<PlayerRecord, DbError>;

    /// Raise the stored best score to `params.best_score`. Never lowers it.
    fn update_player_best_score(&self, params: UpdateBestScore) -> Result<(), DbError>;
}

/// Handle for one persistence call, handed out by the session actor.
#[derive(Clone)]
pub struct DbTx {
    store: Arc<dyn ScoreStore>,
}

impl DbTx {
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self { store }
    }

    pub async fn find_or_create_player(&self, name: &str) -> Result<PlayerRecord, DbError> {
        let store = Arc::clone(&self.store);
        let name = name.to_owned();
        tokio::task::spawn_blocking(move || store.find_or_create_player(&name)).await?
    }

    pub async fn update_player_best_score(&self, params: UpdateBestScore) -> Result<(), DbError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.update_player_best_score(params)).await?
    }
}

/// SQLite-backed [`ScoreStore`].
pub struct SqliteScoreStore {
    conn: Mutex<Connection>,
}

impl SqliteScoreStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self::with_connection(conn)?;
        info!("Score database opened at {}", path.as_ref().display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ScoreStore for SqliteScoreStore {
    fn find_or_create_player(&self, name: &str) -> Result<PlayerRecord, DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO players (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        let record = tx.query_row(
            "SELECT id, name, best_score FROM players WHERE name = ?1",
            params![name],
            |row| {
                Ok(PlayerRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    best_score: row.get(2)?,
                })
            },
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn update_player_best_score(&self, params: UpdateBestScore) -> Result<(), DbError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE players SET best_score = MAX(best_score, ?2) WHERE id = ?1",
            params![params.id, params.best_score],
        )?;
        if updated == 0 {
            return Err(DbError::PlayerNotFound(params.id));
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
impl SqliteScoreStore {
    /// Current best score of player `id`, if the row exists.
    fn best_score(&self, id: i64) -> Result<Option<i64>, DbError> {
        use rusqlite::OptionalExtension;

        Ok(self
            .conn()
            .query_row(
                "SELECT best_score FROM players WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }
}
