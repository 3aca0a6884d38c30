//! Connection hub.
//!
//! A single loop owns admission, removal and broadcast fan-out. Fan-out only
//! tries to queue the message on each target's own bounded event channel, so
//! one slow connection never stalls the loop; it gets closed instead.
//! Registration and removal stay unbounded: there is at most one of each per
//! admitted connection.

use protocol::{Msg, Packet, SERVER_ID};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{ClientError, ClientHandle, Connection};
use crate::config::{Config, GameConfig};
use crate::db::{DbTx, ScoreStore};
use crate::objects::{SharedCollection, SharedGameObjects};

struct HubShared {
    config: Config,
    clients: SharedCollection<ClientHandle>,
    objects: SharedGameObjects,
    store: Arc<dyn ScoreStore>,
}

/// Cheap, cloneable access to the hub for connections and tasks.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<HubShared>,
    register_tx: mpsc::UnboundedSender<ClientHandle>,
    unregister_tx: mpsc::UnboundedSender<u64>,
    broadcast_tx: mpsc::Sender<Packet>,
}

impl HubHandle {
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn game_config(&self) -> &GameConfig {
        &self.shared.config.game
    }

    /// Registered connections keyed by connection id.
    pub fn clients(&self) -> &SharedCollection<ClientHandle> {
        &self.shared.clients
    }

    pub fn objects(&self) -> &SharedGameObjects {
        &self.shared.objects
    }

    /// Fresh persistence handle for a single call.
    pub fn db_tx(&self) -> DbTx {
        DbTx::new(Arc::clone(&self.shared.store))
    }

    /// Queue a connection for registration; the hub assigns its id.
    pub fn register(&self, client: ClientHandle) {
        if self.register_tx.send(client).is_err() {
            warn!("Hub is not running, dropping registration");
        }
    }

    pub fn unregister(&self, id: u64) {
        let _ = self.unregister_tx.send(id);
    }

    /// Deliver `packet` to every registered connection except its sender.
    ///
    /// Dropped if the hub has fallen behind by a full queue.
    pub fn broadcast(&self, packet: Packet) {
        if let Err(TrySendError::Full(packet)) = self.broadcast_tx.try_send(packet) {
            warn!(
                sender_id = packet.sender_id,
                opcode = ?packet.msg.opcode(),
                "Broadcast queue full, dropping message"
            );
        }
    }

    /// Admit a new connection.
    ///
    /// Builds the client with `factory`, registers it and starts its pumps.
    /// Returns the read pump task, which finishes once the connection is gone,
    /// or `None` if the client could not be built.
    pub async fn serve<F, Fut, T>(&self, factory: F, transport: T) -> Option<JoinHandle<()>>
    where
        F: FnOnce(HubHandle, T) -> Fut,
        Fut: Future<Output = Result<Connection, ClientError>>,
    {
        let connection = match factory(self.clone(), transport).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Error obtaining client for new connection: {}", e);
                return None;
            }
        };

        let Connection {
            client,
            reader,
            writer,
        } = connection;
        self.register(client.handle());
        Some(client.start(reader, writer))
    }
}

/// The coordination loop. Construct with [`Hub::new`], hand out
/// [`Hub::handle`]s, then drive it with [`Hub::run`].
pub struct Hub {
    handle: HubHandle,
    register_rx: mpsc::UnboundedReceiver<ClientHandle>,
    unregister_rx: mpsc::UnboundedReceiver<u64>,
    broadcast_rx: mpsc::Receiver<Packet>,
}

impl Hub {
    pub fn new(config: Config, store: Arc<dyn ScoreStore>) -> Self {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) =
            mpsc::channel(config.server.broadcast_queue_size.max(1));

        let shared = Arc::new(HubShared {
            clients: SharedCollection::with_capacity(config.server.max_connections),
            objects: SharedGameObjects::new(),
            config,
            store,
        });

        Self {
            handle: HubHandle {
                shared,
                register_tx,
                unregister_tx,
                broadcast_tx,
            },
            register_rx,
            unregister_rx,
            broadcast_rx,
        }
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Fill the world with spores, start replenishing them, then coordinate
    /// connections until the process exits.
    pub async fn run(mut self) {
        let game = self.handle.game_config().clone();
        let objects = self.handle.objects();
        while objects.spores.len() < game.max_spores {
            objects.spawn_wild_spore(game.spawn_bound);
        }
        info!("Spawned {} spores", objects.spores.len());

        tokio::spawn(replenish_spores(self.handle.clone()));

        info!("Awaiting client registrations");
        loop {
            tokio::select! {
                Some(client) = self.register_rx.recv() => self.handle_register(client),
                Some(id) = self.unregister_rx.recv() => self.handle_unregister(id),
                Some(packet) = self.broadcast_rx.recv() => self.handle_broadcast(packet),
                else => break,
            }
        }
    }

    fn handle_register(&self, client: ClientHandle) {
        let id = self.handle.clients().add(client.clone());
        client.initialize(id);
        info!(client_id = id, "Client registered");
    }

    fn handle_unregister(&self, id: u64) {
        if self.handle.clients().remove(id) {
            info!(client_id = id, "Client unregistered");
        } else {
            debug!(client_id = id, "Unregister for unknown client");
        }
    }

    fn handle_broadcast(&self, packet: Packet) {
        let Packet { sender_id, msg } = packet;
        self.handle.clients().for_each(|id, client| {
            if id != sender_id && !client.is_closed() {
                client.process_message(sender_id, msg.clone());
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn try_next_broadcast(&mut self) -> Option<Packet> {
        self.broadcast_rx.try_recv().ok()
    }

    /// Apply queued removals only, returning the ids in order.
    #[cfg(test)]
    pub(crate) fn take_unregisters(&mut self) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Ok(id) = self.unregister_rx.try_recv() {
            self.handle_unregister(id);
            ids.push(id);
        }
        ids
    }

    /// Process everything queued so far without blocking.
    #[cfg(test)]
    pub(crate) fn drain(&mut self) {
        loop {
            if let Ok(client) = self.register_rx.try_recv() {
                self.handle_register(client);
            } else if let Ok(id) = self.unregister_rx.try_recv() {
                self.handle_unregister(id);
            } else if let Ok(packet) = self.broadcast_rx.try_recv() {
                self.handle_broadcast(packet);
            } else {
                break;
            }
        }
    }
}

/// Periodically top the spore population back up to the configured target.
async fn replenish_spores(hub: HubHandle) {
    let game = hub.game_config().clone();
    let mut ticker = interval(game.spore_replenish_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let missing = game.max_spores.saturating_sub(hub.objects().spores.len());
        for _ in 0..missing.min(game.spore_replenish_batch) {
            let (id, spore) = hub.objects().spawn_wild_spore(game.spawn_bound);
            hub.broadcast(Packet::new(SERVER_ID, Msg::Spore(spore.to_message(id))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientEvent;
    use crate::db::testing::RecordingStore;

    fn test_hub() -> Hub {
        Hub::new(Config::default(), Arc::new(RecordingStore::default()))
    }

    fn recv_initialized(rx: &mut mpsc::Receiver<ClientEvent>) -> u64 {
        match rx.try_recv() {
            Ok(ClientEvent::Initialize(id)) => id,
            other => panic!("expected Initialize, got {other:?}"),
        }
    }

    #[test]
    fn test_register_assigns_identity() {
        let mut hub = test_hub();
        let (a, mut a_rx) = ClientHandle::channel(8);
        let (b, mut b_rx) = ClientHandle::channel(8);
        hub.handle().register(a);
        hub.handle().register(b);
        hub.drain();

        let a_id = recv_initialized(&mut a_rx);
        let b_id = recv_initialized(&mut b_rx);
        assert_ne!(a_id, b_id);
        assert_ne!(a_id, SERVER_ID);
        assert_eq!(hub.handle().clients().len(), 2);
    }

    #[test]
    fn test_unregister_removes_client() {
        let mut hub = test_hub();
        let (a, mut a_rx) = ClientHandle::channel(8);
        hub.handle().register(a);
        hub.drain();
        let id = recv_initialized(&mut a_rx);

        hub.handle().unregister(id);
        hub.handle().unregister(id);
        hub.drain();
        assert!(hub.handle().clients().is_empty());
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut hub = test_hub();
        let (a, mut a_rx) = ClientHandle::channel(8);
        let (b, mut b_rx) = ClientHandle::channel(8);
        hub.handle().register(a);
        hub.handle().register(b);
        hub.drain();
        let a_id = recv_initialized(&mut a_rx);
        let b_id = recv_initialized(&mut b_rx);

        let chat = Msg::Chat {
            text: "hi".to_string(),
        };
        hub.handle().broadcast(Packet::new(a_id, chat.clone()));
        hub.drain();

        assert!(a_rx.try_recv().is_err());
        match b_rx.try_recv() {
            Ok(ClientEvent::Message { sender_id, msg }) => {
                assert_eq!(sender_id, a_id);
                assert_eq!(msg, chat);
            }
            other => panic!("expected relayed chat, got {other:?}"),
        }
        assert_ne!(a_id, b_id);
    }

    #[tokio::test]
    async fn test_failed_factory_is_not_registered() {
        let mut hub = test_hub();
        let served = hub
            .handle()
            .serve(
                |_hub, _transport: ()| async { Err(ClientError::Closed) },
                (),
            )
            .await;
        hub.drain();

        assert!(served.is_none());
        assert!(hub.handle().clients().is_empty());
    }

    #[test]
    fn test_full_event_queue_closes_slow_client() {
        let mut hub = test_hub();
        let (slow, mut slow_rx) = ClientHandle::channel(2);
        let (fast, mut fast_rx) = ClientHandle::channel(64);
        hub.handle().register(slow.clone());
        hub.handle().register(fast);
        hub.drain();
        let _ = recv_initialized(&mut slow_rx);
        let _ = recv_initialized(&mut fast_rx);

        for i in 0..5 {
            hub.handle().broadcast(Packet::new(
                SERVER_ID,
                Msg::SporeConsumed { spore_id: i },
            ));
        }
        hub.drain();

        assert!(slow.is_closed());
        let mut slow_seen = 0;
        while slow_rx.try_recv().is_ok() {
            slow_seen += 1;
        }
        assert_eq!(slow_seen, 2);
        let mut fast_seen = 0;
        while fast_rx.try_recv().is_ok() {
            fast_seen += 1;
        }
        assert_eq!(fast_seen, 5);
    }

    #[test]
    fn test_full_broadcast_queue_drops() {
        let mut config = Config::default();
        config.server.broadcast_queue_size = 1;
        let mut hub = Hub::new(config, Arc::new(RecordingStore::default()));

        let first = Packet::new(1, Msg::Chat { text: "a".into() });
        hub.handle().broadcast(first.clone());
        hub.handle().broadcast(Packet::new(1, Msg::Chat { text: "b".into() }));

        assert_eq!(hub.try_next_broadcast(), Some(first));
        assert_eq!(hub.try_next_broadcast(), None);
    }
}
