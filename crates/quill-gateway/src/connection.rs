use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use quill_sync::ReactiveBackend;
use quill_types::events::{GatewayCommand, GatewayEvent};
use quill_types::{PostId, RoomId, ViewerId};

use crate::store::Store;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Events queued for one client before it counts as stalled.
const OUTBOUND_CAPACITY: usize = 256;

/// A single socket write that takes longer than this drops the client.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest slice of a bad command echoed into the log, in characters.
const LOG_PREVIEW_CHARS: usize = 200;

/// The per-connection event queue. A client that lets it fill up is dropped
/// instead of buffering without bound.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<GatewayEvent>,
    stalled: CancellationToken,
}

impl Outbound {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let out = Self {
            tx,
            stalled: CancellationToken::new(),
        };
        (out, rx)
    }

    /// Queue an event. Returns `false` once the client is gone or stalled.
    fn push(&self, event: GatewayEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.stalled.is_cancelled() {
                    warn!("Outbound queue full ({} events), dropping client", OUTBOUND_CAPACITY);
                    self.stalled.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Serve one WebSocket client. `viewer_id` is `None` for anonymous readers,
/// who may follow comment feeds but not take part in presence.
pub async fn handle_connection(socket: WebSocket, store: Arc<Store>, viewer_id: Option<ViewerId>) {
    let (mut sender, mut receiver) = socket.split();

    match viewer_id {
        Some(id) => info!("{} connected to gateway", id),
        None => info!("Anonymous reader connected to gateway"),
    }

    if send_event(&mut sender, &GatewayEvent::Ready { viewer_id }).await.is_err() {
        return;
    }

    let (out, out_rx) = Outbound::new(OUTBOUND_CAPACITY);
    let stalled = out.stalled.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut send_task = tokio::spawn(run_send_loop(sender, out_rx, pong_received.clone()));

    let mut session = Session::new(store, viewer_id, out);

    let clean = tokio::select! {
        _ = &mut send_task => false,
        _ = stalled.cancelled() => false,
        clean = read_commands(&mut receiver, &mut session, &pong_received) => clean,
    };
    send_task.abort();

    session.finish(clean).await;

    match viewer_id {
        Some(id) => info!("{} disconnected from gateway (clean: {})", id, clean),
        None => info!("Anonymous reader disconnected from gateway"),
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    send_message(sender, Message::Text(text.into())).await
}

async fn send_message(sender: &mut SplitSink<WebSocket, Message>, msg: Message) -> Result<(), ()> {
    match tokio::time::timeout(SEND_TIMEOUT, sender.send(msg)).await {
        Ok(result) => result.map_err(|_| ()),
        Err(_) => {
            warn!("Socket write stalled for {:?}, dropping connection", SEND_TIMEOUT);
            Err(())
        }
    }
}

/// At most `max_chars` characters of `text`, cut on a character boundary.
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(i, _)| &text[..i])
}

/// Forward queued events to the client and keep the ping/pong heartbeat.
async fn run_send_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<GatewayEvent>,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            event = out_rx.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if send_message(&mut sender, Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Read client commands until the socket ends. Returns `true` for a clean
/// Close frame.
async fn read_commands(
    receiver: &mut SplitStream<WebSocket>,
    session: &mut Session,
    pong_received: &AtomicBool,
) -> bool {
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("WebSocket read error: {}", e);
                return false;
            }
        };

        match msg {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Pong(_) => {
                pong_received.store(true, Ordering::Release);
            }
            Message::Close(_) => return true,
            _ => {}
        }
    }
    false
}

/// Per-connection state: which feeds this client follows and which rooms it
/// has joined. Every feed runs as its own forwarding task.
struct Session {
    store: Arc<Store>,
    viewer_id: Option<ViewerId>,
    out: Outbound,
    cancel: CancellationToken,
    feeds: HashMap<PostId, CancellationToken>,
    rooms: HashMap<RoomId, CancellationToken>,
}

impl Session {
    fn new(store: Arc<Store>, viewer_id: Option<ViewerId>, out: Outbound) -> Self {
        Self {
            store,
            viewer_id,
            out,
            cancel: CancellationToken::new(),
            feeds: HashMap::new(),
            rooms: HashMap::new(),
        }
    }

    fn emit(&self, event: GatewayEvent) {
        self.out.push(event);
    }

    async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<GatewayCommand>(text) {
            Ok(cmd) => self.handle(cmd).await,
            Err(e) => {
                warn!("Bad gateway command: {} (raw: {})", e, preview(text, LOG_PREVIEW_CHARS));
                self.emit(GatewayEvent::Error {
                    message: format!("bad command: {}", e),
                });
            }
        }
    }

    async fn handle(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Subscribe { post_id, since_version } => {
                trace!("Subscribe to post {} after {}", post_id, since_version);
                let token = self.cancel.child_token();
                if let Some(previous) = self.feeds.insert(post_id, token.clone()) {
                    previous.cancel();
                }
                tokio::spawn(forward_comments(
                    self.store.clone(),
                    post_id,
                    since_version,
                    self.out.clone(),
                    token,
                ));
            }

            GatewayCommand::Unsubscribe { post_id } => {
                if let Some(token) = self.feeds.remove(&post_id) {
                    token.cancel();
                }
            }

            GatewayCommand::PresenceJoin { room_id } => {
                let Some(viewer_id) = self.viewer_id else {
                    return self.unauthenticated();
                };
                self.watch_room(room_id).await;
                match self.store.join(room_id, viewer_id).await {
                    Ok(viewers) => self.emit(GatewayEvent::PresenceSync { room_id, viewers }),
                    Err(e) => warn!("Join for {} in room {} failed: {}", viewer_id, room_id, e),
                }
            }

            GatewayCommand::PresenceHeartbeat { room_id } => {
                let Some(viewer_id) = self.viewer_id else {
                    return self.unauthenticated();
                };
                // A heartbeat after a reap re-registers, so watch the room again too.
                if !self.rooms.contains_key(&room_id) {
                    self.watch_room(room_id).await;
                }
                if let Err(e) = self.store.heartbeat(room_id, viewer_id).await {
                    warn!("Heartbeat for {} in room {} failed: {}", viewer_id, room_id, e);
                }
            }

            GatewayCommand::PresenceLeave { room_id } => {
                let Some(viewer_id) = self.viewer_id else {
                    return self.unauthenticated();
                };
                if let Some(token) = self.rooms.remove(&room_id) {
                    token.cancel();
                }
                match self.store.leave(room_id, viewer_id).await {
                    Ok(viewers) => self.emit(GatewayEvent::PresenceSync { room_id, viewers }),
                    Err(e) => warn!("Leave for {} in room {} failed: {}", viewer_id, room_id, e),
                }
            }
        }
    }

    fn unauthenticated(&self) {
        self.emit(GatewayEvent::Error {
            message: "unauthenticated".into(),
        });
    }

    async fn watch_room(&mut self, room_id: RoomId) {
        let rx = match self.store.subscribe_presence(room_id).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Presence feed for room {} unavailable: {}", room_id, e);
                return;
            }
        };

        let token = self.cancel.child_token();
        if let Some(previous) = self.rooms.insert(room_id, token.clone()) {
            previous.cancel();
        }

        let out = self.out.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            loop {
                let pushed = tokio::select! {
                    _ = token.cancelled() => break,
                    pushed = rx.recv() => pushed,
                };
                match pushed {
                    Ok(viewers) => {
                        if !out.push(GatewayEvent::PresenceSync { room_id, viewers }) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!("Presence relay for room {} skipped {} pushes", room_id, n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn leave_all(&mut self) {
        let Some(viewer_id) = self.viewer_id else {
            return;
        };
        for (room_id, token) in self.rooms.drain() {
            token.cancel();
            if let Err(e) = self.store.leave(room_id, viewer_id).await {
                warn!("Leave for {} in room {} failed: {}", viewer_id, room_id, e);
            }
        }
    }

    fn release(&mut self) {
        self.cancel.cancel();
        self.feeds.clear();
        self.rooms.clear();
    }

    /// End the session. A clean close leaves every joined room right away;
    /// after a transport failure the reaper times the viewer out instead.
    async fn finish(mut self, clean: bool) {
        if clean {
            self.leave_all().await;
        }
        self.release();
    }
}

/// Relay one post's comment feed to the client, starting after `since`.
/// A lagging relay resubscribes from the last version it forwarded.
async fn forward_comments(
    store: Arc<Store>,
    post_id: PostId,
    mut since: u64,
    out: Outbound,
    cancel: CancellationToken,
) {
    loop {
        let feed = tokio::select! {
            _ = cancel.cancelled() => return,
            feed = store.subscribe_comments(post_id, since) => feed,
        };
        let mut feed = match feed {
            Ok(feed) => feed,
            Err(e) => {
                warn!("Comment feed for post {} unavailable: {}", post_id, e);
                out.push(GatewayEvent::Error {
                    message: format!("comment feed unavailable: {}", e),
                });
                return;
            }
        };

        since = since.max(feed.catch_up.version());
        if !out.push(GatewayEvent::CommentsUpdated {
            post_id,
            update: feed.catch_up,
        }) {
            return;
        }

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = feed.updates.recv() => received,
            };
            match received {
                Ok(update) => {
                    since = since.max(update.version());
                    if !out.push(GatewayEvent::CommentsUpdated { post_id, update }) {
                        return;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Comment relay for post {} lagged by {}, resubscribing after {}", post_id, n, since);
                    break;
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}
