//! [`SessionStore`] backed by a relay connection.
//!
//! One WebSocket carries every request and every watch of the device:
//!
//! ```text
//!  SessionStore call ──► out channel ──► writer task ──► socket
//!        ▲                                                 │
//!        │ oneshot (by request id)                         ▼
//!        └──────────────────────────────────────── reader task
//!  watch stream ◄── mpsc (by watch id) ◄────────────────────┘
//! ```
//!
//! When the socket closes every waiting request fails with
//! [`StoreError::Unavailable`], every open watch yields one error and ends,
//! and later calls fail immediately. The engine's reconnect logic treats that
//! like any other transport failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use rally_sync::{
    MemberStream, Roster, SessionDocument, SessionPatch, SessionStore, SnapshotStream, StoreError,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::error::RelayError;
use crate::protocol::{RelayFrame, RelayOp, RelayRequest};

/// How long a request waits for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type DocSender = mpsc::UnboundedSender<Result<Option<SessionDocument>, StoreError>>;
type MemberSender = mpsc::UnboundedSender<Result<Vec<Value>, StoreError>>;

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, oneshot::Sender<RelayFrame>>,
    doc_watches: HashMap<u64, DocSender>,
    member_watches: HashMap<u64, MemberSender>,
}

struct ClientInner {
    url: String,
    out_tx: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    connected: AtomicBool,
    routes: Mutex<Routes>,
}

impl ClientInner {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> StoreError {
        StoreError::Unavailable(format!("relay connection to {} closed", self.url))
    }

    /// Route one frame from the relay.
    fn dispatch(&self, frame: RelayFrame) {
        if let Some(id) = frame.request_id() {
            match self.routes().pending.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => log::debug!("Dropping response to unknown request {id}"),
            }
            return;
        }

        let abandoned = match frame {
            RelayFrame::Snapshot { watch_id, doc } => {
                let mut routes = self.routes();
                let delivered = routes
                    .doc_watches
                    .get(&watch_id)
                    .is_some_and(|tx| tx.send(Ok(doc)).is_ok());
                if !delivered {
                    routes.doc_watches.remove(&watch_id);
                }
                (!delivered).then_some(watch_id)
            }
            RelayFrame::MemberSnapshot { watch_id, members } => {
                let mut routes = self.routes();
                let delivered = routes
                    .member_watches
                    .get(&watch_id)
                    .is_some_and(|tx| tx.send(Ok(members)).is_ok());
                if !delivered {
                    routes.member_watches.remove(&watch_id);
                }
                (!delivered).then_some(watch_id)
            }
            RelayFrame::WatchError { watch_id, error } => {
                let error = StoreError::from(error);
                let mut routes = self.routes();
                if let Some(tx) = routes.doc_watches.remove(&watch_id) {
                    let _ = tx.send(Err(error));
                } else if let Some(tx) = routes.member_watches.remove(&watch_id) {
                    let _ = tx.send(Err(error));
                }
                None
            }
            _ => None,
        };

        // consumer dropped its stream
        if let Some(watch_id) = abandoned {
            self.send_untracked(RelayOp::Unwatch { watch_id });
        }
    }

    /// Fire-and-forget request; the ack is ignored.
    fn send_untracked(&self, op: RelayOp) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RelayRequest { id, op };
        if let Ok(text) = request.encode() {
            let _ = self.out_tx.send(text);
        }
    }

    /// Fail everything in flight after the socket closed.
    fn shut_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let routes = std::mem::take(&mut *self.routes());
        let error = self.closed_error();
        // dropping the oneshot senders wakes the waiting requests
        drop(routes.pending);
        for (_, tx) in routes.doc_watches {
            let _ = tx.send(Err(error.clone()));
        }
        for (_, tx) in routes.member_watches {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

/// A remote session store reached through the relay.
#[derive(Clone)]
pub struct RelayStore {
    inner: Arc<ClientInner>,
}

impl RelayStore {
    /// Open the WebSocket and start the reader and writer tasks.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let inner = Arc::new(ClientInner {
            url: url.to_string(),
            out_tx,
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            routes: Mutex::new(Routes::default()),
        });
        log::info!("Connected to relay at {url}");

        // Writer task: forward outgoing requests to the socket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    log::warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses and pushes
        let reader = inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match RelayFrame::decode(text.as_str()) {
                        Ok(frame) => reader.dispatch(frame),
                        Err(e) => log::warn!("Ignoring malformed relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Relay connection error: {e}");
                        break;
                    }
                }
            }
            log::info!("Relay connection to {} closed", reader.url);
            reader.shut_down();
        });

        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    async fn call(&self, op: RelayOp) -> Result<RelayFrame, StoreError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.call_with_id(id, op).await
    }

    async fn call_with_id(&self, id: u64, op: RelayOp) -> Result<RelayFrame, StoreError> {
        if !self.is_connected() {
            return Err(self.inner.closed_error());
        }
        let text = RelayRequest { id, op }.encode()?;

        let (tx, rx) = oneshot::channel();
        self.inner.routes().pending.insert(id, tx);
        if self.inner.out_tx.send(text).is_err() {
            self.inner.routes().pending.remove(&id);
            return Err(self.inner.closed_error());
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(RelayFrame::Error { error, .. })) => Err(error.into()),
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(self.inner.closed_error()),
            Err(_) => {
                self.inner.routes().pending.remove(&id);
                Err(StoreError::Unavailable(format!("relay request {id} timed out")))
            }
        }
    }

    async fn call_ack(&self, op: RelayOp) -> Result<(), StoreError> {
        match self.call(op).await? {
            RelayFrame::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(frame: &RelayFrame) -> StoreError {
    StoreError::Malformed(format!("unexpected relay response {frame:?}"))
}

fn channel_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<Result<T, StoreError>>,
) -> futures_util::stream::BoxStream<'static, Result<T, StoreError>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn failed<T: Send + 'static>(
    error: StoreError,
) -> futures_util::stream::BoxStream<'static, Result<T, StoreError>> {
    stream::once(async move { Err(error) }).boxed()
}

#[async_trait]
impl SessionStore for RelayStore {
    async fn create(&self, session_id: &str, doc: SessionDocument) -> Result<(), StoreError> {
        self.call_ack(RelayOp::Create {
            session_id: session_id.to_string(),
            doc,
        })
        .await
    }

    async fn merge(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        self.call_ack(RelayOp::Merge {
            session_id: session_id.to_string(),
            patch,
        })
        .await
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError> {
        let op = RelayOp::Get {
            session_id: session_id.to_string(),
        };
        match self.call(op).await? {
            RelayFrame::Document { doc, .. } => Ok(doc),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.call_ack(RelayOp::Delete {
            session_id: session_id.to_string(),
        })
        .await
    }

    async fn watch(&self, session_id: &str) -> SnapshotStream {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        // registered first so the initial snapshot cannot outrun the route
        self.inner.routes().doc_watches.insert(id, tx);

        let op = RelayOp::Watch {
            session_id: session_id.to_string(),
        };
        match self.call_with_id(id, op).await {
            Ok(_) => channel_stream(rx),
            Err(e) => {
                self.inner.routes().doc_watches.remove(&id);
                failed(e)
            }
        }
    }

    async fn put_member(
        &self,
        session_id: &str,
        roster: Roster,
        member_id: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.call_ack(RelayOp::PutMember {
            session_id: session_id.to_string(),
            roster,
            member_id: member_id.to_string(),
            value,
        })
        .await
    }

    async fn remove_member(
        &self,
        session_id: &str,
        roster: Roster,
        member_id: &str,
    ) -> Result<(), StoreError> {
        self.call_ack(RelayOp::RemoveMember {
            session_id: session_id.to_string(),
            roster,
            member_id: member_id.to_string(),
        })
        .await
    }

    async fn list_members(
        &self,
        session_id: &str,
        roster: Roster,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let op = RelayOp::ListMembers {
            session_id: session_id.to_string(),
            roster,
        };
        match self.call(op).await? {
            RelayFrame::Members { members, .. } => Ok(members
                .into_iter()
                .map(|m| (m.member_id, m.value))
                .collect()),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_members(
        &self,
        session_id: &str,
        roster: Roster,
        member_ids: &[String],
    ) -> Result<(), StoreError> {
        self.call_ack(RelayOp::DeleteMembers {
            session_id: session_id.to_string(),
            roster,
            member_ids: member_ids.to_vec(),
        })
        .await
    }

    async fn watch_members(&self, session_id: &str, roster: Roster) -> MemberStream {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes().member_watches.insert(id, tx);

        let op = RelayOp::WatchMembers {
            session_id: session_id.to_string(),
            roster,
        };
        match self.call_with_id(id, op).await {
            Ok(_) => channel_stream(rx),
            Err(e) => {
                self.inner.routes().member_watches.remove(&id);
                failed(e)
            }
        }
    }
}
