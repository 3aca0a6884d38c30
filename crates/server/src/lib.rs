//! Spore arena server library.

pub mod client;
pub mod config;
pub mod db;
pub mod hub;
pub mod objects;
pub mod states;
pub mod websocket;

// Re-export commonly used types
pub use client::{Client, ClientContext, ClientError, ClientHandle, Connection};
pub use config::Config;
pub use db::{DbError, DbTx, ScoreStore, SqliteScoreStore};
pub use hub::{Hub, HubHandle};
pub use websocket::{accept, run};
