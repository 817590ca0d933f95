use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quill_types::models::PresenceRecord;
use quill_types::{RoomId, ViewerId};

use crate::backend::ReactiveBackend;
use crate::config::PresenceConfig;

/// A viewer's presence in one room while a page is mounted.
///
/// Mounting joins the room and starts a heartbeat task. `leave` is the clean
/// unmount and removes the record right away. Dropping the session only stops
/// the heartbeat, so the record lapses at the next reap after the timeout.
pub struct PresenceSession<B: ReactiveBackend> {
    room_id: RoomId,
    viewer_id: ViewerId,
    backend: Arc<B>,
    live: Arc<watch::Sender<Vec<PresenceRecord>>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<B: ReactiveBackend> PresenceSession<B> {
    /// Join `room_id` as `viewer`. Anonymous viewers get no session and the
    /// backend is never contacted.
    pub async fn mount(
        backend: Arc<B>,
        room_id: RoomId,
        viewer: Option<ViewerId>,
        config: &PresenceConfig,
    ) -> Option<Self> {
        let Some(viewer_id) = viewer else {
            debug!("Presence skipped for anonymous viewer in room {}", room_id);
            return None;
        };

        let updates = match backend.subscribe_presence(room_id).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Presence feed for room {} unavailable: {}", room_id, e);
                None
            }
        };

        // A failed join is recovered by the first heartbeat.
        let initial = match backend.join(room_id, viewer_id).await {
            Ok(live) => {
                info!("{} joined room {}", viewer_id, room_id);
                live
            }
            Err(e) => {
                warn!("Presence join for {} in room {} failed: {}", viewer_id, room_id, e);
                Vec::new()
            }
        };

        let (tx, _) = watch::channel(initial);
        let live = Arc::new(tx);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_heartbeat(
            backend.clone(),
            room_id,
            viewer_id,
            config.heartbeat_interval,
            updates,
            live.clone(),
            cancel.clone(),
        ));

        Some(Self {
            room_id,
            viewer_id,
            backend,
            live,
            cancel,
            task: Some(task),
        })
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn viewer_id(&self) -> ViewerId {
        self.viewer_id
    }

    /// Last known live set of the room, ordered by viewer id.
    pub fn viewers(&self) -> Vec<PresenceRecord> {
        self.live.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.live.subscribe()
    }

    /// Stop heartbeating and remove the record immediately.
    pub async fn leave(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        match self.backend.leave(self.room_id, self.viewer_id).await {
            Ok(live) => {
                self.live.send_replace(live);
                info!("{} left room {}", self.viewer_id, self.room_id);
            }
            Err(e) => warn!(
                "Presence leave for {} in room {} failed: {}",
                self.viewer_id, self.room_id, e
            ),
        }
    }
}

impl<B: ReactiveBackend> Drop for PresenceSession<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn next_push(
    updates: &mut Option<broadcast::Receiver<Vec<PresenceRecord>>>,
) -> Result<Vec<PresenceRecord>, RecvError> {
    match updates {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn run_heartbeat<B: ReactiveBackend>(
    backend: Arc<B>,
    room_id: RoomId,
    viewer_id: ViewerId,
    period: Duration,
    mut updates: Option<broadcast::Receiver<Vec<PresenceRecord>>>,
    live: Arc<watch::Sender<Vec<PresenceRecord>>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match backend.heartbeat(room_id, viewer_id).await {
                    Ok(set) => {
                        live.send_replace(set);
                    }
                    Err(e) => warn!(
                        "Presence heartbeat for {} in room {} failed: {}",
                        viewer_id, room_id, e
                    ),
                }
            }
            pushed = next_push(&mut updates) => match pushed {
                Ok(set) => {
                    live.send_replace(set);
                }
                Err(RecvError::Lagged(n)) => {
                    debug!("Presence feed for room {} skipped {} pushes", room_id, n);
                }
                Err(RecvError::Closed) => {
                    debug!("Presence feed for room {} closed", room_id);
                    updates = None;
                }
            },
        }
    }

    debug!("Heartbeat for {} in room {} stopped", viewer_id, room_id);
}
