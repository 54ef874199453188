use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::clock::{now_millis, RoundTrip};
use crate::error::SyncError;
use crate::protocol::{ClientMessage, PlaybackAction, ReplyResult, RoomSnapshot, ServerMessage};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);

/// WebSocket transport with request/acknowledgment correlation.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<SyncClientState>,
}

struct SyncClientState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    /// Bumped on every new transport; tasks of older sockets carry a stale value.
    generation: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>,
    next_request_id: AtomicU64,
    request_timeout: Duration,
    stats: Mutex<SyncStats>,
}

#[derive(Default, Clone)]
struct SyncStats {
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_nonce: Option<u64>,
    last_rtt_ms: Option<f32>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct SyncStatsSnapshot {
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_rtt_ms: Option<f32>,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
}

/// Acknowledged room membership.
#[derive(Debug, Clone)]
pub struct Joined {
    pub participant_id: Uuid,
    pub room: RoomSnapshot,
    pub round_trip: RoundTrip,
}

/// Fresh authoritative state from a `request_sync`.
#[derive(Debug, Clone)]
pub struct SyncSample {
    pub room: RoomSnapshot,
    pub round_trip: RoundTrip,
}

impl SyncClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SyncClientState {
                tx: Mutex::new(None),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                request_timeout,
                stats: Mutex::new(SyncStats::default()),
            }),
        }
    }

    /// Connect to the sync server. Replies are routed to their waiting
    /// requests; every other message goes to `on_message`. Returns a receiver
    /// that resolves when the socket closes.
    pub async fn connect<F>(&self, server_url: &str, on_message: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(ServerMessage) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to server")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let keepalive_tx = tx.downgrade();
        let generation = self.inner.install(tx);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport(generation);
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let handler = Arc::new(on_message);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if let Some(message) = recv_inner.handle_text(&text) {
                            handler(message);
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => {
                        recv_inner.handle_ws_pong(&payload);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(err) => {
                        tracing::debug!("Socket error: {}", err);
                        break;
                    }
                    _ => {}
                }
            }
            recv_inner.clear_transport(generation);
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        spawn_keepalive(Arc::clone(&self.inner), keepalive_tx);

        Ok(disconnect_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    pub fn mark_connected(&self) {
        self.inner.stats.lock().connected_since = Some(Instant::now());
    }

    pub fn mark_disconnected(&self) {
        let mut stats = self.inner.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
    }

    pub fn stats_snapshot(&self) -> SyncStatsSnapshot {
        self.inner.snapshot()
    }

    /// Create a room for `video_url`; the caller becomes its host.
    pub async fn create_room(
        &self,
        video_url: String,
        display_name: Option<String>,
    ) -> Result<Joined, SyncError> {
        let (result, round_trip) = self
            .request(|request_id| ClientMessage::CreateRoom {
                request_id,
                video_url,
                display_name,
            })
            .await?;
        match result {
            ReplyResult::RoomCreated {
                participant_id,
                room,
            } => Ok(Joined {
                participant_id,
                room,
                round_trip,
            }),
            other => Err(reply_error(other)),
        }
    }

    pub async fn join_room(
        &self,
        room_id: String,
        display_name: Option<String>,
    ) -> Result<Joined, SyncError> {
        let (result, round_trip) = self
            .request(|request_id| ClientMessage::JoinRoom {
                request_id,
                room_id,
                display_name,
            })
            .await?;
        match result {
            ReplyResult::RoomJoined {
                participant_id,
                room,
            } => Ok(Joined {
                participant_id,
                room,
                round_trip,
            }),
            other => Err(reply_error(other)),
        }
    }

    pub async fn request_sync(&self, room_id: String) -> Result<SyncSample, SyncError> {
        let (result, round_trip) = self
            .request(|request_id| ClientMessage::RequestSync {
                request_id,
                room_id,
            })
            .await?;
        match result {
            ReplyResult::Synced { room } => Ok(SyncSample { room, round_trip }),
            other => Err(reply_error(other)),
        }
    }

    pub fn leave_room(&self, room_id: String, participant_id: Uuid) -> Result<(), SyncError> {
        self.send_message(ClientMessage::LeaveRoom {
            room_id,
            participant_id,
        })
    }

    pub fn send_control(
        &self,
        room_id: String,
        action: PlaybackAction,
        position: f64,
        duration: Option<f64>,
    ) -> Result<(), SyncError> {
        self.send_message(ClientMessage::ControlEvent {
            room_id,
            action,
            position,
            duration,
        })
    }

    pub fn set_video(&self, room_id: String, video_url: String) -> Result<(), SyncError> {
        self.send_message(ClientMessage::SetVideo { room_id, video_url })
    }

    async fn request<F>(&self, build: F) -> Result<(ReplyResult, RoundTrip), SyncError>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, reply_tx);

        let sent_at = now_millis();
        if let Err(err) = self.send_message(build(request_id)) {
            self.inner.pending.lock().remove(&request_id);
            return Err(err);
        }

        let outcome = tokio::time::timeout(self.inner.request_timeout, reply_rx).await;
        let received_at = now_millis();
        match outcome {
            Ok(Ok(result)) => Ok((
                result,
                RoundTrip {
                    sent_at,
                    received_at,
                },
            )),
            Ok(Err(_)) => Err(SyncError::Transient(
                "connection closed before reply".into(),
            )),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(SyncError::Transient(format!(
                    "no reply within {:?}",
                    self.inner.request_timeout
                )))
            }
        }
    }

    fn send_message(&self, msg: ClientMessage) -> Result<(), SyncError> {
        let json = serde_json::to_string(&msg)
            .map_err(|err| SyncError::Invalid(format!("failed to serialize message: {err}")))?;
        self.inner
            .enqueue_ws(WsMessage::Text(json.into()))
            .map_err(|_| SyncError::Transient("not connected".into()))?;
        self.inner.record_outgoing();
        Ok(())
    }

    /// In-memory transport standing in for the socket.
    #[cfg(test)]
    pub(crate) fn attach(&self) -> mpsc::UnboundedReceiver<WsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.install(tx);
        rx
    }

    #[cfg(test)]
    pub(crate) fn deliver(&self, text: &str) -> Option<ServerMessage> {
        self.inner.handle_text(text)
    }
}

/// Ping the socket behind `tx` until that socket is gone. Holding only a weak
/// handle lets the task end once the transport is cleared or replaced.
fn spawn_keepalive(
    inner: Arc<SyncClientState>,
    tx: mpsc::WeakUnboundedSender<WsMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(KEEPALIVE_INTERVAL).await;
            let Some(tx) = tx.upgrade() else {
                break;
            };
            if inner.send_keepalive(&tx).is_err() {
                break;
            }
        }
    })
}

fn reply_error(result: ReplyResult) -> SyncError {
    match result {
        ReplyResult::Failed { kind, message } => SyncError::from_reply(kind, message),
        other => SyncError::Invalid(format!("unexpected reply: {other:?}")),
    }
}

impl SyncClientState {
    /// Resolve replies against pending requests; hand back anything else.
    fn handle_text(&self, text: &str) -> Option<ServerMessage> {
        self.record_incoming();
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("Ignoring undecodable server message: {}", err);
                return None;
            }
        };

        match message {
            ServerMessage::Reply { request_id, result } => {
                match self.pending.lock().remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => tracing::debug!("Late reply for request {}", request_id),
                }
                None
            }
            other => Some(other),
        }
    }

    fn record_outgoing(&self) {
        let mut stats = self.stats.lock();
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self) {
        let mut stats = self.stats.lock();
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        if payload.len() < 8 {
            return;
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&payload[..8]);
        let nonce = u64::from_le_bytes(nonce_bytes);

        let mut stats = self.stats.lock();
        if stats.last_ping_nonce == Some(nonce) {
            if let Some(sent) = stats.last_ping_sent {
                stats.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
            }
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    fn send_keepalive(&self, tx: &mpsc::UnboundedSender<WsMessage>) -> Result<(), ()> {
        let nonce = Uuid::new_v4().as_u128() as u64;
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = Some(nonce);
            stats.last_ping_sent = Some(Instant::now());
        }
        tx.send(WsMessage::Ping(nonce.to_le_bytes().to_vec().into()))
            .map_err(|_| ())
    }

    /// Make `tx` the live transport and return its generation.
    fn install(&self, tx: mpsc::UnboundedSender<WsMessage>) -> u64 {
        let mut slot = self.tx.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(tx);
        generation
    }

    /// Drop the socket handle and fail every in-flight request, unless a newer
    /// transport has been installed since `generation`.
    fn clear_transport(&self, generation: u64) {
        {
            let mut slot = self.tx.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("Ignoring close of superseded connection {}", generation);
                return;
            }
            *slot = None;
        }
        self.pending.lock().clear();
        let mut stats = self.stats.lock();
        stats.last_ping_nonce = None;
        stats.last_ping_sent = None;
    }

    fn enqueue_ws(&self, message: WsMessage) -> Result<(), ()> {
        if let Some(tx) = self.tx.lock().clone() {
            tx.send(message).map_err(|_| ())
        } else {
            Err(())
        }
    }

    fn snapshot(&self) -> SyncStatsSnapshot {
        let stats = self.stats.lock();
        SyncStatsSnapshot {
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_rtt_ms: stats.last_rtt_ms,
            last_message_age: stats
                .last_message_at
                .map(|inst| inst.elapsed().as_secs_f32()),
            connected_duration: stats
                .connected_since
                .map(|inst| inst.elapsed().as_secs_f32()),
            reconnect_attempts: stats.reconnect_attempts,
        }
    }
}
