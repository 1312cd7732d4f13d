//! End-to-end flows through the public API.

use std::sync::{Arc, Mutex};

use eventfold_streams::{
    BoxError, CheckpointFile, Commit, CommitReceipt, DEFAULT_BUCKET, EventMessage, EventStore,
    InMemoryPersistence, PersistStreams, PollingClient, PollingConfig, PublishCommits,
    ScheduleDispatches, Snapshot, StreamState, SyncDispatchScheduler,
};
use serde_json::json;
use tokio_stream::StreamExt;
use uuid::Uuid;

fn deposit(amount: u64) -> EventMessage {
    EventMessage::new("Deposited", json!({ "amount": amount }))
}

fn store() -> (Arc<InMemoryPersistence>, EventStore<InMemoryPersistence>) {
    let engine = Arc::new(InMemoryPersistence::new());
    let store = EventStore::builder(engine.clone())
        .build()
        .expect("store should build");
    (engine, store)
}

#[test]
fn two_commits_read_back_in_order() {
    let (_engine, store) = store();
    let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

    let mut stream = store.create_stream(DEFAULT_BUCKET, "S").expect("create");
    stream.add(deposit(1)).expect("add");
    stream.commit_changes(c1).expect("first commit");
    assert_eq!(stream.stream_revision(), 1);

    stream.add(deposit(2)).expect("add");
    stream.add(deposit(3)).expect("add");
    stream.commit_changes(c2).expect("second commit");
    assert_eq!(stream.stream_revision(), 3);
    assert_eq!(stream.commit_sequence(), 2);

    let commits = store.get_from(DEFAULT_BUCKET, "S", 0, 3).expect("read");
    let ids: Vec<Uuid> = commits.iter().map(|c| c.commit_id).collect();
    assert_eq!(ids, vec![c1, c2]);
}

#[test]
fn benign_concurrent_write_is_absorbed() {
    let (_engine, store) = store();
    let mut a = store
        .open_stream(DEFAULT_BUCKET, "S", 0, u64::MAX)
        .expect("open a");
    let mut b = store
        .open_stream(DEFAULT_BUCKET, "S", 0, u64::MAX)
        .expect("open b");

    a.add(deposit(5)).expect("add");
    a.commit_changes(Uuid::new_v4()).expect("a wins");
    assert_eq!(a.stream_revision(), 1);

    b.add(deposit(7)).expect("add");
    let receipt = b
        .commit_changes(Uuid::new_v4())
        .expect("no error should surface");
    let CommitReceipt::Resolved { concurrent } = receipt else {
        panic!("expected Resolved, got {receipt:?}");
    };
    assert_eq!(concurrent.len(), 1);
    assert!(b.uncommitted_events().is_empty());
    assert_eq!(b.stream_revision(), 1);
    assert_eq!(b.state(), StreamState::Ready);
}

#[test]
fn snapshot_requires_an_existing_stream() {
    let (engine, store) = store();
    let orphan = Snapshot::from_state(DEFAULT_BUCKET, "ghost", 1, &json!({})).expect("snapshot");
    assert!(!engine.add_snapshot(orphan).expect("add snapshot"));
    assert!(
        engine
            .get_snapshot(DEFAULT_BUCKET, "ghost", u64::MAX)
            .expect("read")
            .is_none()
    );

    let mut stream = store.create_stream(DEFAULT_BUCKET, "real").expect("create");
    stream.add(deposit(1)).expect("add");
    stream.commit_changes(Uuid::new_v4()).expect("commit");
    let snapshot = Snapshot::from_state(DEFAULT_BUCKET, "real", 1, &json!({ "total": 1 }))
        .expect("snapshot");
    assert!(engine.add_snapshot(snapshot).expect("add snapshot"));
}

#[derive(Default)]
struct Flaky {
    down: Mutex<bool>,
    seen: Mutex<Vec<u64>>,
}

impl PublishCommits for Flaky {
    fn publish(&self, commit: &Commit) -> Result<(), BoxError> {
        if *self.down.lock().expect("lock") {
            return Err("broker down".into());
        }
        self.seen.lock().expect("lock").push(commit.checkpoint_token);
        Ok(())
    }
}

#[test]
fn undelivered_commits_are_replayed_by_the_next_scheduler() {
    let engine = Arc::new(InMemoryPersistence::new());
    let publisher = Arc::new(Flaky::default());
    *publisher.down.lock().expect("lock") = true;

    let store = EventStore::builder(engine.clone())
        .synchronous_dispatch(publisher.clone())
        .build()
        .expect("store should build");
    for id in ["a", "b"] {
        let mut stream = store.create_stream(DEFAULT_BUCKET, id).expect("create");
        stream.add(deposit(1)).expect("add");
        stream.commit_changes(Uuid::new_v4()).expect("commit");
    }
    assert_eq!(engine.get_undispatched_commits().expect("read").len(), 2);

    *publisher.down.lock().expect("lock") = false;
    let restarted = SyncDispatchScheduler::new(engine.clone(), publisher.clone());
    restarted.start().expect("start should succeed");

    assert_eq!(*publisher.seen.lock().expect("lock"), vec![1, 2]);
    assert!(engine.get_undispatched_commits().expect("read").is_empty());
}

#[tokio::test]
async fn projection_resumes_from_saved_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = CheckpointFile::new(dir.path().join("balances.json"));
    let (engine, store) = store();
    for amount in 1..=3 {
        let mut stream = store
            .create_stream(DEFAULT_BUCKET, format!("acc-{amount}"))
            .expect("create");
        stream.add(deposit(amount)).expect("add");
        stream.commit_changes(Uuid::new_v4()).expect("commit");
    }

    let config = PollingConfig {
        interval: std::time::Duration::from_millis(10),
        ..PollingConfig::default()
    };
    let client = PollingClient::with_config(engine.clone(), config);

    let (handle, mut commits) = client.start_from(file.load_or_start().expect("load"));
    for expected in 1..=2u64 {
        let commit = commits.next().await.expect("commit");
        assert_eq!(commit.checkpoint_token, expected);
        file.save(commit.checkpoint_token).expect("save");
    }
    handle.stop().await;

    let (handle, mut commits) = client.start_from(file.load_or_start().expect("load"));
    let commit = commits.next().await.expect("commit");
    assert_eq!(commit.checkpoint_token, 3);
    handle.stop().await;
}
