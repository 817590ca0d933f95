use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use tokio::sync::watch;
use uuid::Uuid;

use quill_db::Database;
use quill_gateway::reaper::reap_once;
use quill_gateway::store::timestamp;
use quill_gateway::{Dispatcher, Store};
use quill_sync::{
    CommentLimits, CommentStream, CommentView, FeedStatus, Handoff, HydrationBridge, ManualClock, PresenceConfig,
    PresenceSession, Preloaded, ReactiveBackend, SnapshotPreloader, SubmitError, SystemClock,
};
use quill_types::api::Claims;
use quill_types::models::PresenceRecord;

const SECRET: &str = "integration-secret";

fn store_with(clock: Arc<dyn quill_sync::Clock>) -> Arc<Store> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    Arc::new(Store::new(db, Dispatcher::new(TimeDelta::seconds(30)), clock, SECRET.into()))
}

fn add_user(store: &Store, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    store
        .db()
        .create_user(&id.to_string(), name, &format!("{}@example.com", name), "hash", &timestamp(Utc::now()))
        .unwrap();
    id
}

fn add_post(store: &Store, author: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    store
        .db()
        .insert_post(&id.to_string(), &author.to_string(), "Post", "Body", None, &timestamp(Utc::now()))
        .unwrap();
    id
}

async fn until_view(rx: &mut watch::Receiver<CommentView>, pred: impl FnMut(&CommentView) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for comment view")
        .expect("view sender dropped");
}

async fn until_presence(rx: &mut watch::Receiver<Vec<PresenceRecord>>, pred: impl FnMut(&Vec<PresenceRecord>) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for presence")
        .expect("presence sender dropped");
}

#[tokio::test]
async fn hydration_over_sqlite_catches_up_without_gaps() {
    let store = store_with(Arc::new(SystemClock));
    let ada = add_user(&store, "ada");
    let post = add_post(&store, ada);

    store.create_comment(post, ada, "A".into()).await.unwrap();
    store.create_comment(post, ada, "B".into()).await.unwrap();

    let preloader = SnapshotPreloader::new(store.clone(), Arc::new(SystemClock));
    let Preloaded::Found { comments, .. } = preloader.preload(post).await.unwrap() else {
        panic!("post should exist");
    };
    assert_eq!(comments.version(), 2);
    let handoff = Handoff::new(comments);

    // written between preload and mount
    store.create_comment(post, ada, "C".into()).await.unwrap();

    let stream = HydrationBridge::new(store.clone(), CommentLimits::default())
        .hydrate(post, &handoff)
        .unwrap();
    assert_eq!(stream.comments().len(), 2);

    let mut rx = stream.subscribe();
    until_view(&mut rx, |v| v.status == FeedStatus::Live && v.list.len() == 3).await;

    stream.submit(Some(ada), "D").await.unwrap();
    until_view(&mut rx, |v| v.list.len() == 4).await;

    let bodies: Vec<_> = stream.comments().into_iter().map(|c| c.body).collect();
    assert_eq!(bodies, ["A", "B", "C", "D"]);
    assert_eq!(stream.view().list.version(), 4);
}

#[tokio::test]
async fn anonymous_reader_can_read_but_not_write() {
    let store = store_with(Arc::new(SystemClock));
    let ada = add_user(&store, "ada");
    let post = add_post(&store, ada);
    store.create_comment(post, ada, "hello".into()).await.unwrap();

    let stream = CommentStream::connect(store.clone(), post, CommentLimits::default());
    let mut rx = stream.subscribe();
    until_view(&mut rx, |v| v.list.len() == 1).await;

    assert_eq!(stream.submit(None, "hi").await, Err(SubmitError::Unauthenticated));
    let session = PresenceSession::mount(store.clone(), post, None, &PresenceConfig::default()).await;
    assert!(session.is_none());

    assert_eq!(store.get_comments_by_post_id(post).await.unwrap().version, 1);
    assert!(store.presence(post).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_viewer_is_reaped_while_active_viewer_stays() {
    let clock = Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH));
    let store = store_with(clock.clone());
    let ada = add_user(&store, "ada");
    let bob = add_user(&store, "bob");
    let post = add_post(&store, ada);
    let config = PresenceConfig::default();

    let silent = PresenceSession::mount(store.clone(), post, Some(ada), &config).await.unwrap();
    let active = PresenceSession::mount(store.clone(), post, Some(bob), &config).await.unwrap();
    let mut rx = active.subscribe();
    until_presence(&mut rx, |set| set.len() == 2).await;
    drop(silent);

    clock.advance(TimeDelta::seconds(20));
    tokio::time::sleep(Duration::from_secs(25)).await;
    clock.advance(TimeDelta::seconds(15));

    let (evicted, _) = reap_once(&store).await;
    assert_eq!(evicted, 1);
    until_presence(&mut rx, |set| set.len() == 1).await;
    assert_eq!(active.viewers()[0].viewer_id, bob);

    active.leave().await;
    assert!(store.presence(post).await.is_empty());
}

#[tokio::test]
async fn bearer_token_resolves_to_viewer() {
    let store = store_with(Arc::new(SystemClock));
    let viewer = Uuid::new_v4();
    let claims = Claims {
        sub: viewer,
        name: "ada".into(),
        exp: (Utc::now() + TimeDelta::days(1)).timestamp() as usize,
    };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();

    assert_eq!(store.get_user_id(&token).await, Some(viewer));

    let forged = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"other")).unwrap();
    assert_eq!(store.get_user_id(&forged).await, None);
}
