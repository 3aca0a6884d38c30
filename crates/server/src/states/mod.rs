//! Client states.
//!
//! Exactly one state is active per connection. Handlers never swap the state
//! themselves; they return the next state and the owning client performs the
//! transition (`on_exit` of the old state, then `set_client` and `on_enter`
//! of the new one).

mod connected;
mod ingame;
mod validation;

pub use connected::Connected;
pub use ingame::InGame;
pub use validation::{check_drop_cooldown, check_eat_ratio, check_proximity, ClaimError};

use protocol::Msg;
use tracing::debug;

use crate::client::ClientContext;
use crate::db::DbError;
use crate::objects::{Player, PlayerRecord};

pub enum ClientState {
    Connected(Connected),
    InGame(InGame),
}

impl ClientState {
    pub fn connected() -> Self {
        ClientState::Connected(Connected::new())
    }

    pub fn in_game(player: Player) -> Self {
        ClientState::InGame(InGame::new(player))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Connected(_) => Connected::NAME,
            ClientState::InGame(_) => InGame::NAME,
        }
    }

    pub fn as_in_game(&self) -> Option<&InGame> {
        match self {
            ClientState::InGame(state) => Some(state),
            _ => None,
        }
    }

    /// Bind the state to the connection it will run on.
    pub fn set_client(&mut self, ctx: &ClientContext) {
        match self {
            ClientState::Connected(state) => state.set_client(ctx),
            ClientState::InGame(state) => state.set_client(ctx),
        }
    }

    pub fn on_enter(&mut self, ctx: &ClientContext) {
        match self {
            ClientState::Connected(state) => state.on_enter(ctx),
            ClientState::InGame(state) => state.on_enter(ctx),
        }
    }

    /// Handle one message. Returns the state to switch to, if any.
    pub fn handle_message(
        &mut self,
        ctx: &ClientContext,
        sender_id: u64,
        msg: Msg,
    ) -> Option<ClientState> {
        match self {
            ClientState::Connected(state) => state.handle_message(ctx, sender_id, msg),
            ClientState::InGame(state) => state.handle_message(ctx, sender_id, msg),
        }
    }

    /// Apply the outcome of a player lookup. Only the lobby waits for one.
    pub fn handle_joined(
        &mut self,
        ctx: &ClientContext,
        result: Result<PlayerRecord, DbError>,
    ) -> Option<ClientState> {
        match self {
            ClientState::Connected(state) => state.handle_joined(ctx, result),
            ClientState::InGame(_) => {
                debug!(client_id = ctx.id(), "Ignoring join result outside the lobby");
                None
            }
        }
    }

    pub fn on_exit(&mut self, ctx: &ClientContext) {
        match self {
            ClientState::Connected(state) => state.on_exit(ctx),
            ClientState::InGame(state) => state.on_exit(ctx),
        }
    }
}
