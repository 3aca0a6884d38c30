//! Per-connection session actor.
//!
//! Each connection runs two pumps. The read pump owns the client state and
//! serializes everything that reaches it: frames from the socket, messages
//! relayed by the hub or passed by peers, and lifecycle events. The write pump
//! drains the outbound queue into the transport.
//!
//! Both queues are bounded. Producers never wait on them: a connection that
//! cannot keep up with its queue is closed.

use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use protocol::{Msg, Packet, ProtocolError};
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GameConfig;
use crate::db::{DbError, DbTx};
use crate::hub::HubHandle;
use crate::objects::{PlayerRecord, SharedGameObjects};
use crate::states::ClientState;

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("decode error: {0}")]
    Decode(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,
}

/// Inbound half of a transport, already decoded into packets.
pub type PacketStream = BoxStream<'static, Result<Packet, ClientError>>;

/// Outbound half of a transport, encoding packets as it goes.
pub type PacketSink = Pin<Box<dyn Sink<Packet, Error = ClientError> + Send>>;

/// What a connection factory hands to the hub.
pub struct Connection {
    pub client: Client,
    pub reader: PacketStream,
    pub writer: PacketSink,
}

/// Events delivered to a client's read pump.
#[derive(Debug)]
pub enum ClientEvent {
    /// The hub registered this client under `id`.
    Initialize(u64),
    /// A message from another connection (or from the server).
    Message { sender_id: u64, msg: Msg },
    /// Outcome of the player lookup started by a `Join`.
    Joined(Result<PlayerRecord, DbError>),
    Close(String),
}

/// Address of a client's read pump, stored in the hub.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    events: mpsc::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl ClientHandle {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            events,
            shutdown: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn initialize(&self, id: u64) {
        self.deliver(ClientEvent::Initialize(id));
    }

    /// Queue `msg` for this client's current state.
    pub fn process_message(&self, sender_id: u64, msg: Msg) {
        self.deliver(ClientEvent::Message { sender_id, msg });
    }

    pub(crate) fn joined(&self, result: Result<PlayerRecord, DbError>) {
        self.deliver(ClientEvent::Joined(result));
    }

    /// Ask the connection to shut down.
    pub fn close(&self, reason: impl Into<String>) {
        self.deliver(ClientEvent::Close(reason.into()));
    }

    /// True once the connection is shutting down or gone.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.events.is_closed()
    }

    fn deliver(&self, event: ClientEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                if !self.shutdown.is_cancelled() {
                    warn!("Client event queue full, closing connection");
                }
                self.shutdown.cancel();
            }
        }
    }
}

/// The primitives a client state works with.
///
/// Cloneable so background tasks started by a state (the tick, the initial
/// spore sync, database calls) can keep talking to the connection.
#[derive(Clone)]
pub struct ClientContext {
    id: u64,
    hub: HubHandle,
    handle: ClientHandle,
    outbound: mpsc::Sender<Packet>,
    shutdown: CancellationToken,
}

impl ClientContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &GameConfig {
        self.hub.game_config()
    }

    pub fn objects(&self) -> &SharedGameObjects {
        self.hub.objects()
    }

    /// This connection's own event queue.
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Queue `msg` for this connection's socket, authored by this connection.
    ///
    /// Returns `false` once the connection is gone.
    pub fn socket_send(&self, msg: Msg) -> bool {
        self.socket_send_as(msg, self.id)
    }

    /// Queue `msg` for this connection's socket, authored by `sender_id`.
    pub fn socket_send_as(&self, msg: Msg, sender_id: u64) -> bool {
        match self.outbound.try_send(Packet::new(sender_id, msg)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.shutdown.is_cancelled() {
                    warn!(client_id = self.id, "Outbound queue full, closing connection");
                }
                self.shutdown.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Hand `msg` straight to another connection's state.
    pub fn pass_to_peer(&self, msg: Msg, peer_id: u64) {
        match self.hub.clients().get(peer_id) {
            Some(peer) => peer.process_message(self.id, msg),
            None => debug!(peer_id, "Peer is gone, dropping message"),
        }
    }

    /// Send `msg` to every other connection.
    pub fn broadcast(&self, msg: Msg) {
        self.hub.broadcast(Packet::new(self.id, msg));
    }

    pub fn db_tx(&self) -> DbTx {
        self.hub.db_tx()
    }

    /// Cancelled when the connection shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A connection's session actor.
pub struct Client {
    hub: HubHandle,
    handle: ClientHandle,
    events: mpsc::Receiver<ClientEvent>,
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Option<mpsc::Receiver<Packet>>,
    shutdown: CancellationToken,
    ctx: Option<ClientContext>,
    state: Option<ClientState>,
}

impl Client {
    pub fn new(hub: HubHandle) -> Self {
        let queue_size = hub.config().server.client_queue_size.max(1);
        let (handle, events) = ClientHandle::channel(queue_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_size);
        let shutdown = handle.shutdown.clone();
        Self {
            hub,
            handle,
            events,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            shutdown,
            ctx: None,
            state: None,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Connection id, once the hub has assigned one.
    pub fn id(&self) -> Option<u64> {
        self.ctx.as_ref().map(ClientContext::id)
    }

    pub fn state(&self) -> Option<&ClientState> {
        self.state.as_ref()
    }

    /// Bind the id assigned by the hub and enter the lobby state.
    pub fn initialize(&mut self, id: u64) {
        if let Some(existing) = self.id() {
            warn!(client_id = existing, new_id = id, "Client already initialized");
            return;
        }

        let ctx = ClientContext {
            id,
            hub: self.hub.clone(),
            handle: self.handle.clone(),
            outbound: self.outbound_tx.clone(),
            shutdown: self.shutdown.clone(),
        };
        ctx.socket_send(Msg::Id { id });
        self.ctx = Some(ctx);
        self.set_state(Some(ClientState::connected()));
    }

    /// Replace the current state: the old one exits before the new one enters.
    pub fn set_state(&mut self, next: Option<ClientState>) {
        let Some(ctx) = self.ctx.as_ref() else {
            return;
        };

        let prev_name = self.state.as_ref().map(ClientState::name);
        if let Some(mut prev) = self.state.take() {
            prev.on_exit(ctx);
        }

        if let Some(mut next) = next {
            debug!(
                client_id = ctx.id(),
                from = prev_name.unwrap_or("None"),
                to = next.name(),
                "Switching state"
            );
            next.set_client(ctx);
            next.on_enter(ctx);
            self.state = Some(next);
        }
    }

    /// Hand `msg` to the current state, applying any transition it asks for.
    pub fn process_message(&mut self, sender_id: u64, msg: Msg) {
        let (Some(ctx), Some(state)) = (self.ctx.as_ref(), self.state.as_mut()) else {
            return;
        };
        if let Some(next) = state.handle_message(ctx, sender_id, msg) {
            self.set_state(Some(next));
        }
    }

    fn process_joined(&mut self, result: Result<PlayerRecord, DbError>) {
        let (Some(ctx), Some(state)) = (self.ctx.as_ref(), self.state.as_mut()) else {
            return;
        };
        if let Some(next) = state.handle_joined(ctx, result) {
            self.set_state(Some(next));
        }
    }

    /// Spawn both pumps. The returned task finishes after the client has
    /// unregistered from the hub.
    pub fn start(mut self, reader: PacketStream, writer: PacketSink) -> JoinHandle<()> {
        if let Some(outbound_rx) = self.outbound_rx.take() {
            tokio::spawn(write_pump(outbound_rx, writer, self.shutdown.clone()));
        }
        tokio::spawn(self.read_pump(reader))
    }

    async fn read_pump(mut self, mut reader: PacketStream) {
        loop {
            let initialized = self.ctx.is_some();
            tokio::select! {
                _ = self.shutdown.cancelled(), if initialized => break,
                event = self.events.recv() => match event {
                    Some(ClientEvent::Initialize(id)) => self.initialize(id),
                    Some(ClientEvent::Message { sender_id, msg }) => {
                        self.process_message(sender_id, msg);
                    }
                    Some(ClientEvent::Joined(result)) => self.process_joined(result),
                    Some(ClientEvent::Close(reason)) => {
                        info!(client_id = ?self.id(), %reason, "Closing client");
                        break;
                    }
                    None => break,
                },
                frame = reader.next(), if initialized => match frame {
                    // The claimed sender id is never trusted.
                    Some(Ok(packet)) => {
                        if let Some(id) = self.id() {
                            self.process_message(id, packet.msg);
                        }
                    }
                    Some(Err(ClientError::Closed)) | None => {
                        info!(client_id = ?self.id(), "Client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client_id = ?self.id(), error = %e, "Error reading from client");
                        break;
                    }
                },
            }
        }

        self.close();
    }

    /// Leave the current state, stop the write pump and unregister. Runs once,
    /// at the end of the read pump.
    fn close(&mut self) {
        self.set_state(None);
        self.shutdown.cancel();
        if let Some(id) = self.id() {
            self.hub.unregister(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn take_outbound(&mut self) -> mpsc::Receiver<Packet> {
        self.outbound_rx.take().expect("outbound receiver already taken")
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &ClientContext {
        self.ctx.as_ref().expect("client not initialized")
    }
}

async fn write_pump(
    mut outbound: mpsc::Receiver<Packet>,
    mut writer: PacketSink,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = writer.send(packet).await {
                        warn!(error = %e, "Error writing to client");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    shutdown.cancel();
    let _ = writer.close().await;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process transport for driving both pumps from a test.

    use super::*;
    use futures_util::stream;
    use std::time::Duration;

    /// A transport backed by channels: feed frames in, read frames out.
    pub fn channel_transport() -> (
        mpsc::UnboundedSender<Result<Packet, ClientError>>,
        PacketStream,
        mpsc::UnboundedReceiver<Packet>,
        PacketSink,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let reader = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Packet>();
        let writer: PacketSink = Box::pin(futures_util::sink::unfold(
            out_tx,
            |tx, packet: Packet| async move {
                tx.send(packet).map_err(|_| ClientError::Closed)?;
                Ok::<_, ClientError>(tx)
            },
        ));
        (in_tx, reader, out_rx, writer)
    }

    pub async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("outbound closed")
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{channel_transport, next_packet};
    use super::*;
    use crate::config::Config;
    use crate::db::testing::{wait_until, RecordingStore};
    use crate::hub::Hub;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_hub() -> Hub {
        Hub::new(Config::default(), Arc::new(RecordingStore::default()))
    }

    #[tokio::test]
    async fn test_initialize_sends_id_and_enters_lobby() {
        let hub = test_hub();
        let mut client = Client::new(hub.handle());
        let mut outbound = client.take_outbound();
        client.initialize(5);

        assert_eq!(client.id(), Some(5));
        assert_eq!(client.state().map(ClientState::name), Some("Connected"));
        assert_eq!(
            outbound.try_recv().unwrap(),
            Packet::new(5, Msg::Id { id: 5 })
        );

        client.initialize(6);
        assert_eq!(client.id(), Some(5));
    }

    #[tokio::test]
    async fn test_pass_to_peer_targets_one_connection() {
        let mut hub = test_hub();
        let (peer, mut peer_rx) = ClientHandle::channel(8);
        let (other, mut other_rx) = ClientHandle::channel(8);
        hub.handle().register(peer);
        hub.handle().register(other);
        hub.drain();
        let peer_id = match peer_rx.try_recv() {
            Ok(ClientEvent::Initialize(id)) => id,
            other => panic!("unexpected {other:?}"),
        };
        let _ = other_rx.try_recv();

        let mut client = Client::new(hub.handle());
        client.initialize(99);
        client
            .context()
            .pass_to_peer(Msg::Chat { text: "psst".into() }, peer_id);

        match peer_rx.try_recv() {
            Ok(ClientEvent::Message { sender_id, msg }) => {
                assert_eq!(sender_id, 99);
                assert_eq!(msg, Msg::Chat { text: "psst".into() });
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pumps_register_and_unregister_once() {
        let store = Arc::new(RecordingStore::default());
        let mut hub = Hub::new(Config::default(), store.clone());
        let (frames_in, reader, mut frames_out, writer) = channel_transport();
        let client = Client::new(hub.handle());
        hub.handle().register(client.handle());
        let done = client.start(reader, writer);
        hub.drain();

        let id = match next_packet(&mut frames_out).await.msg {
            Msg::Id { id } => id,
            other => panic!("expected Id, got {other:?}"),
        };
        assert!(hub.handle().clients().contains(id));

        // Frames are attributed to the connection's own id, whatever sender they claim.
        frames_in
            .send(Ok(Packet::new(1234, Msg::Join { name: "blob".into() })))
            .unwrap();
        match next_packet(&mut frames_out).await {
            Packet {
                sender_id,
                msg: Msg::Player(player),
            } => {
                assert_eq!(sender_id, id);
                assert_eq!(player.id, id);
            }
            other => panic!("expected player snapshot, got {other:?}"),
        }

        frames_in
            .send(Ok(Packet::new(1234, Msg::Chat { text: "hey".into() })))
            .unwrap();
        drop(frames_in);
        done.await.unwrap();

        assert_eq!(
            hub.try_next_broadcast(),
            Some(Packet::new(id, Msg::Chat { text: "hey".into() }))
        );
        assert_eq!(hub.take_unregisters(), vec![id]);
        assert!(!hub.handle().clients().contains(id));
        assert!(hub.handle().objects().players.is_empty());
        // Leaving the game synced the starting mass as the first best score.
        wait_until(|| store.writes().len() == 1).await;
    }

    #[tokio::test]
    async fn test_close_event_ends_both_pumps() {
        let mut hub = test_hub();
        let (_frames_in, reader, mut frames_out, writer) = channel_transport();
        let client = Client::new(hub.handle());
        let handle = client.handle();
        hub.handle().register(client.handle());
        let done = client.start(reader, writer);
        hub.drain();
        let id = match next_packet(&mut frames_out).await.msg {
            Msg::Id { id } => id,
            other => panic!("expected Id, got {other:?}"),
        };

        handle.close("kick");
        done.await.unwrap();

        // The write pump dropped its sink, so the outbound side ends.
        tokio::time::timeout(Duration::from_secs(1), async {
            while frames_out.recv().await.is_some() {}
        })
        .await
        .expect("write pump still running");

        assert!(handle.is_closed());
        assert_eq!(hub.take_unregisters(), vec![id]);
        assert!(hub.handle().clients().is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_closes_connection() {
        let mut hub = test_hub();
        let (frames_in, reader, mut frames_out, writer) = channel_transport();
        let client = Client::new(hub.handle());
        hub.handle().register(client.handle());
        let done = client.start(reader, writer);
        hub.drain();
        let _ = next_packet(&mut frames_out).await;

        frames_in
            .send(Err(ClientError::Decode(ProtocolError::UnexpectedEof)))
            .unwrap();
        done.await.unwrap();
        hub.drain();
        assert!(hub.handle().clients().is_empty());
    }

    #[tokio::test]
    async fn test_full_outbound_queue_closes_connection() {
        let config = Config {
            server: crate::config::ServerConfig {
                client_queue_size: 2,
                ..Default::default()
            },
            ..Config::default()
        };
        let hub = Hub::new(config, Arc::new(RecordingStore::default()));
        let mut client = Client::new(hub.handle());
        let outbound = client.take_outbound();
        client.initialize(3);
        let ctx = client.context().clone();

        assert!(ctx.socket_send(Msg::Chat { text: "1".into() }));
        assert!(!ctx.socket_send(Msg::Chat { text: "2".into() }));
        assert!(ctx.is_closed());
        assert!(client.handle().is_closed());

        // Id and the first chat are all that was queued.
        assert_eq!(outbound.len(), 2);
    }
}
