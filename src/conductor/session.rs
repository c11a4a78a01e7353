//! Request/response session over one WebSocket
//!
//! Both the admin and the app interface speak the same envelope protocol:
//! requests carry an id, responses echo it. A `Session` owns the send half,
//! a receiver task routes responses to their waiting callers, and a watch
//! flag flips once the socket is gone.
//!
//! A `Session` only exists after its transport connected. When the
//! conductor closes the socket, every pending request fails with a
//! transport error and `closed()` resolves.

use futures_util::{SinkExt, StreamExt};
use rmpv::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info};

use super::protocol::{decode_incoming, encode_request, Incoming};
use super::transport::{Transport, WsSink, WsStream};
use crate::error::{ConnectError, Result};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

pub struct Session {
    label: &'static str,
    sink: Mutex<WsSink>,
    next_id: AtomicU64,
    pending: Pending,
    open: watch::Receiver<bool>,
    request_timeout: Duration,
    recv_task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Start routing responses on an already-connected (and, for app
    /// interfaces, already-authenticated) transport.
    pub fn start(label: &'static str, transport: Transport, request_timeout: Duration) -> Self {
        let (sink, stream) = transport.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (open_tx, open_rx) = watch::channel(true);

        let pending_for_recv = Arc::clone(&pending);
        let recv_task = tokio::spawn(async move {
            receiver_loop(label, stream, pending_for_recv).await;
            let _ = open_tx.send(false);
        });

        Self {
            label,
            sink: Mutex::new(sink),
            next_id: AtomicU64::new(1),
            pending,
            open: open_rx,
            request_timeout,
            recv_task,
        }
    }

    /// Send an inner request and wait for its inner response.
    pub async fn request(&self, inner: &Value) -> Result<Value> {
        if !self.is_open() {
            return Err(ConnectError::Transport(format!(
                "{} websocket closed",
                self.label
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bytes = encode_request(id, inner)?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, response_tx);

        let sent = self.sink.lock().await.send(Message::Binary(bytes)).await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(ConnectError::Transport(format!("Failed to send: {}", e)));
        }

        match tokio::time::timeout(self.request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectError::Transport("Response channel closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ConnectError::Timeout(format!("{} request {}", self.label, id)))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow() && !self.recv_task.is_finished()
    }

    /// Resolves once the socket has closed, immediately if it already has.
    pub async fn closed(&self) {
        let mut open = self.open.clone();
        let _ = open.wait_for(|is_open| !*is_open).await;
    }

    /// Close the socket. Errors are only logged.
    pub async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(channel = self.label, error = %e, "Error closing websocket");
        }
        self.recv_task.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

/// Routes responses to their pending request until the socket ends.
async fn receiver_loop(label: &'static str, mut stream: WsStream, pending: Pending) {
    debug!(channel = label, "Receiver loop started");

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Binary(data)) => match decode_incoming(&data) {
                Ok(Incoming::Response { id, result }) => {
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(result.map_err(ConnectError::Zome));
                    }
                }
                Ok(Incoming::Signal) => {}
                Err(e) => error!(channel = label, error = %e, "Failed to decode message"),
            },
            Ok(Message::Close(frame)) => {
                info!(channel = label, frame = ?frame, "Conductor closed connection");
                break;
            }
            Err(e) => {
                error!(channel = label, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    debug!(channel = label, "Receiver loop ended");

    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(ConnectError::Transport(format!(
            "{} websocket closed",
            label
        ))));
    }
}
