//! Lobby state: waits for the connection to pick a display name.

use protocol::Msg;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::ClientState;
use crate::client::ClientContext;
use crate::db::DbError;
use crate::objects::{Player, PlayerRecord};

pub struct Connected {
    span: Span,
    /// A player lookup is in flight.
    joining: bool,
}

impl Connected {
    pub const NAME: &'static str = "Connected";

    pub fn new() -> Self {
        Self {
            span: Span::none(),
            joining: false,
        }
    }

    pub fn set_client(&mut self, ctx: &ClientContext) {
        self.span = info_span!("client", id = ctx.id(), state = Self::NAME);
    }

    pub fn on_enter(&mut self, _ctx: &ClientContext) {}

    pub fn handle_message(
        &mut self,
        ctx: &ClientContext,
        sender_id: u64,
        msg: Msg,
    ) -> Option<ClientState> {
        let _span = self.span.clone().entered();
        if let Msg::Join { name } = msg {
            if sender_id == ctx.id() {
                self.handle_join(ctx, &name);
            }
        }
        None
    }

    pub fn on_exit(&mut self, _ctx: &ClientContext) {}

    /// Validate the name, then resolve the player row on the blocking pool.
    /// The result comes back through [`Connected::handle_joined`].
    fn handle_join(&mut self, ctx: &ClientContext, name: &str) {
        let name = name.trim();
        let max = ctx.config().max_name_length;
        if name.is_empty() || name.chars().count() > max {
            ctx.socket_send(Msg::Deny {
                reason: format!("Name must be 1 to {max} characters"),
            });
            return;
        }
        if self.joining {
            debug!(name, "Join already in progress");
            return;
        }

        self.joining = true;
        let ctx = ctx.clone();
        let name = name.to_owned();
        tokio::spawn(
            async move {
                let result = ctx.db_tx().find_or_create_player(&name).await;
                ctx.handle().joined(result);
            }
            .instrument(self.span.clone()),
        );
    }

    pub fn handle_joined(
        &mut self,
        ctx: &ClientContext,
        result: Result<PlayerRecord, DbError>,
    ) -> Option<ClientState> {
        let _span = self.span.clone().entered();
        self.joining = false;
        match result {
            Ok(record) => {
                info!(name = %record.name, best_score = record.best_score, "Joined");
                Some(ClientState::in_game(Player::from_record(&record)))
            }
            Err(e) => {
                warn!(error = %e, "Could not load player");
                ctx.socket_send(Msg::Deny {
                    reason: "Could not join right now".to_string(),
                });
                None
            }
        }
    }
}

impl Default for Connected {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::client::testing::{channel_transport, next_packet};
    use crate::client::Client;
    use crate::config::Config;
    use crate::db::testing::RecordingStore;
    use crate::hub::Hub;
    use protocol::{Msg, Packet};
    use std::sync::Arc;

    async fn joined_client(
        store: Arc<RecordingStore>,
    ) -> (
        Hub,
        u64,
        tokio::sync::mpsc::UnboundedSender<Result<Packet, crate::client::ClientError>>,
        tokio::sync::mpsc::UnboundedReceiver<Packet>,
    ) {
        let mut hub = Hub::new(Config::default(), store);
        let (frames_in, reader, mut frames_out, writer) = channel_transport();
        let client = Client::new(hub.handle());
        hub.handle().register(client.handle());
        let _pumps = client.start(reader, writer);
        hub.drain();
        let id = match next_packet(&mut frames_out).await.msg {
            Msg::Id { id } => id,
            other => panic!("expected Id, got {other:?}"),
        };
        (hub, id, frames_in, frames_out)
    }

    fn join(name: &str) -> Result<Packet, crate::client::ClientError> {
        Ok(Packet::new(0, Msg::Join { name: name.into() }))
    }

    #[tokio::test]
    async fn test_bad_names_are_denied() {
        let (hub, id, frames_in, mut frames_out) =
            joined_client(Arc::new(RecordingStore::default())).await;

        for name in ["   ", "a-name-that-is-far-too-long"] {
            frames_in.send(join(name)).unwrap();
            assert!(matches!(
                next_packet(&mut frames_out).await.msg,
                Msg::Deny { .. }
            ));
        }
        assert!(!hub.handle().objects().players.contains(id));
    }

    #[tokio::test]
    async fn test_failed_lookup_denies_and_allows_retry() {
        let store = Arc::new(RecordingStore::default());
        store.set_failing_lookups(true);
        let (hub, id, frames_in, mut frames_out) = joined_client(store.clone()).await;

        frames_in.send(join("ann")).unwrap();
        assert!(matches!(
            next_packet(&mut frames_out).await.msg,
            Msg::Deny { .. }
        ));

        store.set_failing_lookups(false);
        frames_in.send(join("ann")).unwrap();
        match next_packet(&mut frames_out).await.msg {
            Msg::Player(player) => assert_eq!(player.name.as_deref(), Some("ann")),
            other => panic!("expected player snapshot, got {other:?}"),
        }
        assert!(hub.handle().objects().players.contains(id));
    }

    #[tokio::test]
    async fn test_other_messages_are_ignored_in_lobby() {
        let (mut hub, _id, frames_in, mut frames_out) =
            joined_client(Arc::new(RecordingStore::default())).await;

        frames_in
            .send(Ok(Packet::new(0, Msg::Chat { text: "hi".into() })))
            .unwrap();
        frames_in.send(join("bo")).unwrap();

        // The chat produced nothing; the join is the next thing seen.
        assert!(matches!(
            next_packet(&mut frames_out).await.msg,
            Msg::Player(_)
        ));
        assert_eq!(hub.try_next_broadcast(), None);
    }
}
