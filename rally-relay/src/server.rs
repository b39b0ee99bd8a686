//! WebSocket relay serving a [`MemoryStore`] to remote devices.
//!
//! Architecture:
//! ```text
//! Host device ──────┐                         ┌── watch task ──► snapshot frames
//!                    ├── connection task ──────┤
//! Spectator device ──┘   (one per socket)      └── watch task ──► memberSnapshot frames
//!                              │
//!                              ▼
//!                         MemoryStore
//!                     (documents, rosters,
//!                      broadcast fan-out)
//! ```
//!
//! Each connection handles its requests in arrival order and multiplexes
//! watch pushes onto the same socket through an outbound channel. Watches
//! are torn down with the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use rally_sync::{MemoryStore, SessionStore, StoreError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::{MemberEntry, RelayFault, RelayFrame, RelayOp, RelayRequest};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before watch tasks wait
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            channel_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub rejected_frames: u64,
    pub active_watches: u64,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    store: MemoryStore,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    /// Serve an existing store, e.g. one a test also inspects directly.
    pub fn with_store(config: RelayConfig, store: MemoryStore) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let store = self.store.clone();
            let stats = self.stats.clone();
            let capacity = self.config.channel_capacity;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, store, stats, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Serve one WebSocket connection until it closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    store: MemoryStore,
    stats: Arc<RwLock<RelayStats>>,
    capacity: usize,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let conn_id = Uuid::new_v4();
    log::info!("Relay connection {conn_id} established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (push_tx, mut push_rx) = mpsc::channel::<RelayFrame>(capacity);
    let mut watches: HashMap<u64, AbortHandle> = HashMap::new();

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let request = match RelayRequest::decode(text.as_str()) {
                            Ok(request) => request,
                            Err(e) => {
                                log::warn!("Rejecting malformed frame on {conn_id}: {e}");
                                stats.write().await.rejected_frames += 1;
                                let frame = RelayFrame::error(0, &StoreError::Malformed(e.to_string()));
                                if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                                    break Err(e);
                                }
                                continue;
                            }
                        };
                        stats.write().await.total_requests += 1;

                        let response = match request.op {
                            RelayOp::Watch { session_id } => {
                                let snapshots = store.watch(&session_id).await;
                                start_watch(request.id, snapshots, push_tx.clone(), &mut watches, &stats, |watch_id, doc| {
                                    RelayFrame::Snapshot { watch_id, doc }
                                }).await;
                                RelayFrame::Ack { id: request.id }
                            }
                            RelayOp::WatchMembers { session_id, roster } => {
                                let members = store.watch_members(&session_id, roster).await;
                                start_watch(request.id, members, push_tx.clone(), &mut watches, &stats, |watch_id, members| {
                                    RelayFrame::MemberSnapshot { watch_id, members }
                                }).await;
                                RelayFrame::Ack { id: request.id }
                            }
                            RelayOp::Unwatch { watch_id } => {
                                if let Some(handle) = watches.remove(&watch_id) {
                                    handle.abort();
                                    let mut s = stats.write().await;
                                    s.active_watches = s.active_watches.saturating_sub(1);
                                }
                                RelayFrame::Ack { id: request.id }
                            }
                            op => execute(&store, request.id, op).await,
                        };

                        // the ack must precede the watch's first snapshot, which
                        // waits in push_rx until this branch finishes
                        if let Err(e) = send_frame(&mut ws_sender, &response).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Relay connection {conn_id} closed by {addr}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                }
            }
            Some(frame) = push_rx.recv() => {
                if let Err(e) = send_frame(&mut ws_sender, &frame).await {
                    break Err(e);
                }
            }
        }
    };

    let closed_watches = watches.len() as u64;
    for (_, handle) in watches.drain() {
        handle.abort();
    }
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_watches = s.active_watches.saturating_sub(closed_watches);
    }
    result
}

/// Forward a store stream as push frames until it errors or the
/// connection goes away.
async fn start_watch<T, F>(
    watch_id: u64,
    mut stream: BoxStream<'static, Result<T, StoreError>>,
    push_tx: mpsc::Sender<RelayFrame>,
    watches: &mut HashMap<u64, AbortHandle>,
    stats: &RwLock<RelayStats>,
    to_frame: F,
) where
    T: Send + 'static,
    F: Fn(u64, T) -> RelayFrame + Send + 'static,
{
    let task = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let frame = match item {
                Ok(value) => to_frame(watch_id, value),
                Err(e) => {
                    let _ = push_tx
                        .send(RelayFrame::WatchError {
                            watch_id,
                            error: RelayFault::from(&e),
                        })
                        .await;
                    return;
                }
            };
            if push_tx.send(frame).await.is_err() {
                return;
            }
        }
        let ended = StoreError::Unavailable("watch ended".into());
        let _ = push_tx
            .send(RelayFrame::WatchError {
                watch_id,
                error: RelayFault::from(&ended),
            })
            .await;
    });

    if let Some(previous) = watches.insert(watch_id, task.abort_handle()) {
        previous.abort();
    } else {
        stats.write().await.active_watches += 1;
    }
}

/// Run a one-shot store operation and build its response.
async fn execute(store: &MemoryStore, id: u64, op: RelayOp) -> RelayFrame {
    let result = match op {
        RelayOp::Create { session_id, doc } => {
            store.create(&session_id, doc).await.map(|()| RelayFrame::Ack { id })
        }
        RelayOp::Merge { session_id, patch } => {
            store.merge(&session_id, patch).await.map(|()| RelayFrame::Ack { id })
        }
        RelayOp::Get { session_id } => store
            .get(&session_id)
            .await
            .map(|doc| RelayFrame::Document { id, doc }),
        RelayOp::Delete { session_id } => {
            store.delete(&session_id).await.map(|()| RelayFrame::Ack { id })
        }
        RelayOp::PutMember {
            session_id,
            roster,
            member_id,
            value,
        } => store
            .put_member(&session_id, roster, &member_id, value)
            .await
            .map(|()| RelayFrame::Ack { id }),
        RelayOp::RemoveMember {
            session_id,
            roster,
            member_id,
        } => store
            .remove_member(&session_id, roster, &member_id)
            .await
            .map(|()| RelayFrame::Ack { id }),
        RelayOp::ListMembers { session_id, roster } => {
            store
                .list_members(&session_id, roster)
                .await
                .map(|members| RelayFrame::Members {
                    id,
                    members: members
                        .into_iter()
                        .map(|(member_id, value)| MemberEntry { member_id, value })
                        .collect(),
                })
        }
        RelayOp::DeleteMembers {
            session_id,
            roster,
            member_ids,
        } => store
            .delete_members(&session_id, roster, &member_ids)
            .await
            .map(|()| RelayFrame::Ack { id }),
        RelayOp::Watch { .. } | RelayOp::WatchMembers { .. } | RelayOp::Unwatch { .. } => Err(
            StoreError::Backend("watch operations are connection-scoped".into()),
        ),
    };

    result.unwrap_or_else(|e| {
        log::debug!("Request {id} failed: {e}");
        RelayFrame::error(id, &e)
    })
}

async fn send_frame(sink: &mut WsSink, frame: &RelayFrame) -> Result<(), RelayError> {
    let text = frame.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
