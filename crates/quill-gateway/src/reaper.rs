use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::Store;

/// Background task that evicts viewers whose heartbeats stopped, and drops
/// broadcast channels nobody is listening to.
///
/// Rooms are also evaluated on every read; this loop covers rooms nobody
/// reads, so watchers still see a silent viewer disappear.
pub async fn run_reaper_loop(store: Arc<Store>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (evicted, pruned) = reap_once(&store).await;
        if evicted > 0 {
            info!("Reaper: evicted {} stale viewers", evicted);
        }
        if pruned > 0 {
            debug!("Reaper: dropped {} idle channels", pruned);
        }
    }

    debug!("Reaper stopped");
}

/// One reaper pass. Returns (evicted viewers, pruned channels).
pub async fn reap_once(store: &Store) -> (usize, usize) {
    let dispatcher = store.dispatcher();
    let evicted = dispatcher.reap(store.clock().now()).await;
    let pruned = dispatcher.prune().await;
    (evicted, pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use chrono::{DateTime, TimeDelta, Utc};
    use quill_db::Database;
    use quill_sync::{ManualClock, ReactiveBackend};
    use uuid::Uuid;

    #[tokio::test]
    async fn pass_evicts_after_timeout_only() {
        let clock = Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH));
        let store = Store::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Dispatcher::new(TimeDelta::seconds(30)),
            clock.clone(),
            "test-secret".into(),
        );
        let room = Uuid::new_v4();
        let _watch = store.subscribe_presence(room).await.unwrap();
        store.join(room, Uuid::new_v4()).await.unwrap();

        clock.advance(TimeDelta::seconds(30));
        assert_eq!(reap_once(&store).await, (0, 0));

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(reap_once(&store).await, (1, 0));
        assert!(store.presence(room).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let store = Arc::new(Store::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Dispatcher::new(TimeDelta::seconds(30)),
            Arc::new(ManualClock::new(Utc::now())),
            "test-secret".into(),
        ));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_reaper_loop(store, Duration::from_secs(5), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
