//! WebSocket transport and the accept loop.

use futures_util::{future, SinkExt, StreamExt};
use protocol::Packet;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{info, warn};

use crate::client::{Client, ClientError, Connection};
use crate::config::Config;
use crate::db::ScoreStore;
use crate::hub::{Hub, HubHandle};

/// Total and per-IP connection accounting.
#[derive(Debug, Default)]
struct ConnectionLimits {
    ip_connections: HashMap<IpAddr, usize>,
    total_connections: usize,
}

impl ConnectionLimits {
    /// Try to add a connection, returns true if allowed.
    fn try_add_connection(&mut self, ip: IpAddr, max_total: usize, max_per_ip: usize) -> bool {
        if self.total_connections >= max_total {
            return false;
        }

        let current = self.ip_connections.get(&ip).copied().unwrap_or(0);
        if current >= max_per_ip {
            return false;
        }

        *self.ip_connections.entry(ip).or_insert(0) += 1;
        self.total_connections += 1;
        true
    }

    fn remove_connection(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_connections.get_mut(&ip) {
            if *count > 0 {
                *count -= 1;
                self.total_connections = self.total_connections.saturating_sub(1);
            }
            if *count == 0 {
                self.ip_connections.remove(&ip);
            }
        }
    }
}

/// Connection factory: upgrade `stream` to a WebSocket and wrap both halves
/// in the packet codec.
pub async fn accept(hub: HubHandle, stream: TcpStream) -> Result<Connection, ClientError> {
    let ws_stream = accept_async(stream).await?;
    let (sink, stream) = ws_stream.split();

    let reader = stream
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Binary(data)) => Some(Packet::decode(data).map_err(ClientError::from)),
                Ok(Message::Close(_)) => Some(Err(ClientError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        })
        .boxed();

    let writer = Box::pin(sink.with(|packet: Packet| {
        future::ready(Ok::<_, ClientError>(Message::Binary(packet.encode())))
    }));

    Ok(Connection {
        client: Client::new(hub),
        reader,
        writer,
    })
}

/// Run the arena server until the listener fails.
pub async fn run(config: Config, store: Arc<dyn ScoreStore>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on ws://{}", addr);

    let hub = Hub::new(config, store);
    let handle = hub.handle();
    tokio::spawn(hub.run());

    accept_loop(listener, handle).await
}

/// Admit connections from `listener` into the hub behind `handle`.
pub async fn accept_loop(listener: TcpListener, hub: HubHandle) -> anyhow::Result<()> {
    let limits = Arc::new(RwLock::new(ConnectionLimits::default()));
    let max_connections = hub.config().server.max_connections;
    let ip_limit = hub.config().server.ip_limit;

    loop {
        let (stream, addr) = listener.accept().await?;
        let ip = addr.ip();

        if !limits
            .write()
            .await
            .try_add_connection(ip, max_connections, ip_limit)
        {
            warn!("Connection rejected (limit reached): {}", addr);
            continue;
        }
        info!("New connection from {}", addr);

        let hub = hub.clone();
        let limits = Arc::clone(&limits);
        tokio::spawn(async move {
            if let Some(session) = hub.serve(accept, stream).await {
                if let Err(e) = session.await {
                    warn!("Session task for {} failed: {}", addr, e);
                }
            }

            limits.write().await.remove_connection(ip);
            info!("Connection from {} closed", addr);
        });
    }
}
