//! Integration tests for the sync engine against in-memory remotes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use worldsync_core::{Author, LocalWorld, WorldId};
use worldsync_sync_engine::{
    Backoff, ConflictSide, Direction, EngineConfig, FailureReason, Jitter, JobOutcome,
    MemoryRemote, RegistryEvent, RemoteError, RemoteOp, RetryConfig, SessionProvider,
    SessionToken, StaticSession, SyncAction, SyncEngine, SyncError, SyncState, WorldStatus,
};
use worldsync_testkit::prelude::*;

type Engine = SyncEngine<MemoryRemote, StaticSession>;

fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig::new(attempts)
        .with_backoff(Backoff::Doubling {
            first: Duration::from_millis(1),
            cap: Duration::from_millis(5),
        })
        .with_jitter(Jitter::None)
}

fn engine_with(remote: &MemoryRemote, config: EngineConfig) -> Engine {
    SyncEngine::open(
        config,
        Author::new("u1", "Alex"),
        remote.clone(),
        StaticSession::new("token"),
    )
    .unwrap()
}

fn engine(remote: &MemoryRemote) -> Engine {
    engine_with(remote, EngineConfig::new().with_retry(fast_retry(3)))
}

fn register(engine: &Engine, world: &TempWorld) -> WorldId {
    engine.register_world(&LocalWorld {
        name: world.name().to_string(),
        path: world.path().to_path_buf(),
    })
}

async fn run(engine: &Engine, id: &WorldId, direction: Direction) -> JobOutcome {
    engine.start_sync(id, direction).unwrap();
    engine.wait(id).await.unwrap()
}

fn expect_synced(outcome: JobOutcome, action: SyncAction) {
    match outcome {
        JobOutcome::Synced(summary) => assert_eq!(summary.action, action),
        other => panic!("expected {action:?}, got {other:?}"),
    }
}

fn expect_failed(outcome: JobOutcome, reason: FailureReason) {
    match outcome {
        JobOutcome::Failed(failure) => assert_eq!(failure.reason, reason, "{failure}"),
        other => panic!("expected {reason}, got {other:?}"),
    }
}

#[tokio::test]
async fn first_push_commits_and_uploads() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::Pushed);

    let history = engine.get_history(&id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message(), "Backup");
    assert_eq!(remote.history(&id), history);
    // Four files plus the manifest; session.lock is never uploaded.
    assert_eq!(remote.blob_count(), 5);

    let record = engine.world(&id).unwrap();
    assert_eq!(record.status(), WorldStatus::Synced);
    assert_eq!(record.progress(), None);
    assert_eq!(record.commits(), &[*history[0].id()]);
    assert_eq!(engine.state(&id), Some(SyncState::Synced));
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_100() {
    let remote = MemoryRemote::new();
    let engine = engine_with(
        &remote,
        EngineConfig::new()
            .with_retry(fast_retry(3))
            .with_max_concurrent_transfers(1),
    );
    let events = engine.registry().subscribe();
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::Pushed);

    let statuses: Vec<_> = events
        .try_iter()
        .filter_map(|e| match e {
            RegistryEvent::Updated(r) => Some((r.status(), r.progress())),
            RegistryEvent::Removed(_) => None,
        })
        .collect();
    let progress: Vec<u8> = statuses.iter().filter_map(|(_, p)| *p).collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));
    assert!(statuses.iter().any(|(s, _)| *s == WorldStatus::Scanning));
    assert_eq!(statuses.last().map(|(s, _)| *s), Some(WorldStatus::Synced));
}

#[tokio::test]
async fn unchanged_world_moves_nothing() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);
    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::Pushed);

    remote.reset_calls();
    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::UpToDate);
    expect_synced(run(&engine, &id, Direction::Auto).await, SyncAction::UpToDate);

    assert_eq!(remote.calls(RemoteOp::PutBlob), 0);
    assert_eq!(remote.calls(RemoteOp::GetBlob), 0);
    assert_eq!(remote.calls(RemoteOp::Publish), 0);
    assert_eq!(engine.get_history(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn only_changed_blobs_are_uploaded() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);
    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::Pushed);

    remote.reset_calls();
    world.play(1200);
    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::Pushed);

    // The new level file and the new manifest.
    assert_eq!(remote.calls(RemoteOp::PutBlob), 2);
    let history = engine.get_history(&id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].parent(), Some(history[1].id()));
    assert_eq!(remote.history(&id), history);
}

#[tokio::test]
async fn push_then_pull_between_two_machines() {
    let remote = MemoryRemote::new();
    let alice = engine(&remote);
    let bob = engine(&remote);

    let source = TempWorld::sample("Shared");
    let id = register(&alice, &source);
    expect_synced(run(&alice, &id, Direction::Push).await, SyncAction::Pushed);

    let target = TempWorld::empty("Shared");
    bob.register_hosted_world(id, "Shared", Author::new("u1", "Alex"));
    assert!(matches!(
        bob.start_sync(&id, Direction::Pull),
        Err(SyncError::NoLocalPath(_))
    ));
    bob.attach_path(&id, target.path()).unwrap();
    expect_synced(run(&bob, &id, Direction::Pull).await, SyncAction::Pulled);

    assert_eq!(target.read("level.dat"), source.read("level.dat"));
    assert_eq!(target.read("region/r.0.-1.mca"), source.read("region/r.0.-1.mca"));
    assert!(!target.exists("session.lock"));
    assert_eq!(bob.get_history(&id).unwrap(), alice.get_history(&id).unwrap());

    // Bob plays and pushes; Alice pulls only what changed.
    target.play(40);
    expect_synced(run(&bob, &id, Direction::Auto).await, SyncAction::Pushed);
    remote.reset_calls();
    expect_synced(run(&alice, &id, Direction::Auto).await, SyncAction::Pulled);

    assert_eq!(source.read("level.dat"), target.read("level.dat"));
    // The manifest and the level file.
    assert_eq!(remote.calls(RemoteOp::GetBlob), 2);
    assert_eq!(alice.get_history(&id).unwrap().len(), 2);
}

#[tokio::test]
async fn conflicts_leave_both_sides_untouched_until_resolved() {
    let remote = MemoryRemote::new();
    let alice = engine(&remote);
    let bob = engine(&remote);

    let alice_world = TempWorld::sample("Shared");
    let id = register(&alice, &alice_world);
    expect_synced(run(&alice, &id, Direction::Push).await, SyncAction::Pushed);
    let bob_world = TempWorld::empty("Shared");
    register(&bob, &bob_world);
    expect_synced(run(&bob, &id, Direction::Pull).await, SyncAction::Pulled);

    alice_world.play(10);
    expect_synced(run(&alice, &id, Direction::Push).await, SyncAction::Pushed);

    // Bob played too without pulling first.
    bob_world.play(99);
    expect_failed(run(&bob, &id, Direction::Push).await, FailureReason::Conflict);
    assert_eq!(bob.get_history(&id).unwrap().len(), 1);
    assert_eq!(remote.history(&id).len(), 2);
    let record = bob.world(&id).unwrap();
    assert_eq!(record.status(), WorldStatus::Error);
    assert!(record.last_failure().unwrap().is_conflict());

    // Bob keeps his side: a new commit on top of his lineage becomes the
    // remote head.
    bob.resolve_conflict(&id, ConflictSide::KeepLocal).unwrap();
    expect_synced(bob.wait(&id).await.unwrap(), SyncAction::Pushed);
    assert_eq!(remote.history(&id).len(), 3);
    assert_eq!(remote.history(&id)[0].message(), "Keep local");

    // Alice's head is no longer an ancestor of the remote head.
    let before = alice.get_history(&id).unwrap();
    expect_failed(run(&alice, &id, Direction::Auto).await, FailureReason::Conflict);
    assert_eq!(alice.get_history(&id).unwrap(), before);
    assert_eq!(remote.history(&id).len(), 3);

    alice.resolve_conflict(&id, ConflictSide::KeepRemote).unwrap();
    expect_synced(alice.wait(&id).await.unwrap(), SyncAction::Pulled);
    assert_eq!(alice_world.read("level.dat"), bob_world.read("level.dat"));
    let history = alice.get_history(&id).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].id(), remote.history(&id)[0].id());
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    engine.start_sync(&id, Direction::Push).unwrap();
    assert!(matches!(
        engine.start_sync(&id, Direction::Push),
        Err(SyncError::JobInProgress(_))
    ));
    expect_synced(engine.wait(&id).await.unwrap(), SyncAction::Pushed);
}

#[tokio::test]
async fn cancel_during_upload_commits_nothing() {
    let remote = MemoryRemote::new();
    remote.set_latency(Duration::from_millis(200));
    let engine = engine_with(
        &remote,
        EngineConfig::new()
            .with_retry(fast_retry(3))
            .with_max_concurrent_transfers(1),
    );
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    engine.start_sync(&id, Direction::Push).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.cancel_sync(&id).unwrap());

    assert_eq!(engine.wait(&id).await.unwrap(), JobOutcome::Cancelled);
    assert!(engine.get_history(&id).unwrap().is_empty());
    assert!(remote.history(&id).is_empty());
    assert_eq!(engine.state(&id), Some(SyncState::Idle));
    assert_eq!(engine.world(&id).unwrap().status(), WorldStatus::Idle);

    // Nothing running any more.
    assert!(!engine.cancel_sync(&id).unwrap());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let remote = MemoryRemote::new();
    remote.fail_next(RemoteOp::PutBlob, 2, RemoteError::transient("throttled"));
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::Pushed);
    assert_eq!(remote.blob_count(), 5);
    assert_eq!(remote.calls(RemoteOp::PutBlob), 7);
}

#[tokio::test]
async fn exhausted_retries_fail_then_retry_succeeds() {
    let remote = MemoryRemote::new();
    remote.fail_next(RemoteOp::PutBlob, 2, RemoteError::transient("offline"));
    let engine = engine_with(
        &remote,
        EngineConfig::new()
            .with_retry(fast_retry(2))
            .with_max_concurrent_transfers(1),
    );
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_failed(
        run(&engine, &id, Direction::Push).await,
        FailureReason::TransferFailed,
    );
    assert!(engine.get_history(&id).unwrap().is_empty());
    assert!(remote.history(&id).is_empty());
    assert_eq!(engine.state(&id), Some(SyncState::Error));

    engine.retry(&id).unwrap();
    expect_synced(engine.wait(&id).await.unwrap(), SyncAction::Pushed);
    assert_eq!(engine.get_history(&id).unwrap().len(), 1);
    assert!(engine.world(&id).unwrap().last_failure().is_none());
}

#[tokio::test]
async fn rejected_session_is_an_auth_error() {
    let remote = MemoryRemote::new();
    remote.accept_tokens(["someone-else"]);
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_failed(run(&engine, &id, Direction::Push).await, FailureReason::AuthError);
    assert_eq!(remote.calls(RemoteOp::PutBlob), 0);
}

#[tokio::test]
async fn moved_remote_head_is_rescanned() {
    let remote = MemoryRemote::new();
    remote.fail_next(
        RemoteOp::Publish,
        1,
        RemoteError::Conflict {
            expected: None,
            actual: None,
        },
    );
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_synced(run(&engine, &id, Direction::Push).await, SyncAction::Pushed);
    assert_eq!(remote.calls(RemoteOp::Publish), 2);
    assert_eq!(remote.history(&id), engine.get_history(&id).unwrap());
    assert_eq!(engine.get_history(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn rescan_after_moved_head_can_be_cancelled() {
    let remote = MemoryRemote::new();
    remote.fail_next(
        RemoteOp::Publish,
        1,
        RemoteError::Conflict {
            expected: None,
            actual: None,
        },
    );
    remote.set_op_latency(RemoteOp::FetchHistory, Duration::from_millis(300));
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    engine.start_sync(&id, Direction::Push).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while remote.calls(RemoteOp::Publish) == 0 || engine.state(&id) != Some(SyncState::Scanning) {
        assert!(tokio::time::Instant::now() < deadline, "job never went back to scanning");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(engine.cancel_sync(&id).unwrap());
    assert_eq!(engine.wait(&id).await.unwrap(), JobOutcome::Cancelled);
    assert!(engine.get_history(&id).unwrap().is_empty());
    assert!(remote.history(&id).is_empty());
    assert_eq!(remote.calls(RemoteOp::Publish), 1);
}

#[tokio::test]
async fn failed_publish_leaves_local_history_alone() {
    let remote = MemoryRemote::new();
    remote.fail_next(RemoteOp::Publish, 2, RemoteError::transient("gateway timeout"));
    let engine = engine_with(&remote, EngineConfig::new().with_retry(fast_retry(2)));
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_failed(
        run(&engine, &id, Direction::Push).await,
        FailureReason::TransferFailed,
    );
    assert!(engine.get_history(&id).unwrap().is_empty());
    assert!(remote.history(&id).is_empty());

    // Blobs landed the first time; the retry only publishes.
    remote.reset_calls();
    engine.retry(&id).unwrap();
    expect_synced(engine.wait(&id).await.unwrap(), SyncAction::Pushed);
    let history = engine.get_history(&id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(remote.history(&id), history);
    assert_eq!(remote.calls(RemoteOp::Publish), 1);
    assert_eq!(remote.calls(RemoteOp::PutBlob), 0);
}

#[tokio::test]
async fn two_worlds_sync_at_once_under_one_ceiling() {
    let remote = MemoryRemote::new();
    remote.set_latency(Duration::from_millis(20));
    let engine = engine_with(
        &remote,
        EngineConfig::new()
            .with_retry(fast_retry(3))
            .with_max_concurrent_transfers(2),
    );
    let survival = TempWorld::sample("Survival");
    let creative = TempWorld::sample("Creative");
    creative.play(7);
    let first = register(&engine, &survival);
    let second = register(&engine, &creative);

    engine.start_sync(&first, Direction::Push).unwrap();
    engine.start_sync(&second, Direction::Push).unwrap();
    let (a, b) = tokio::join!(engine.wait(&first), engine.wait(&second));
    expect_synced(a.unwrap(), SyncAction::Pushed);
    expect_synced(b.unwrap(), SyncAction::Pushed);

    assert!(remote.peak_in_flight() <= 2, "{}", remote.peak_in_flight());
    let (first_history, second_history) = (
        engine.get_history(&first).unwrap(),
        engine.get_history(&second).unwrap(),
    );
    assert_eq!(first_history.len(), 1);
    assert_eq!(second_history.len(), 1);
    assert_ne!(first_history[0].snapshot(), second_history[0].snapshot());
    assert_eq!(remote.history(&first), first_history);
    assert_eq!(remote.history(&second), second_history);
}

/// Hands out a valid token only once the user has signed in.
#[derive(Clone, Default)]
struct PromptedLogin {
    signed_in: Arc<AtomicBool>,
}

impl SessionProvider for PromptedLogin {
    async fn login(&self) -> Result<SessionToken, RemoteError> {
        let token = if self.signed_in.load(Ordering::SeqCst) {
            "fresh"
        } else {
            "expired"
        };
        Ok(SessionToken::new(token))
    }
}

#[tokio::test]
async fn auth_failure_waits_for_login() {
    let remote = MemoryRemote::new();
    remote.accept_tokens(["fresh"]);
    let login = PromptedLogin::default();
    let engine = SyncEngine::open(
        EngineConfig::new().with_retry(fast_retry(2)),
        Author::new("u1", "Alex"),
        remote.clone(),
        login.clone(),
    )
    .unwrap();
    let world = TempWorld::sample("Survival");
    let id = engine.register_world(&LocalWorld {
        name: world.name().to_string(),
        path: world.path().to_path_buf(),
    });
    assert!(matches!(
        engine.resume_after_login(&id),
        Err(SyncError::InvalidStateTransition { .. })
    ));

    engine.start_sync(&id, Direction::Push).unwrap();
    expect_failed(engine.wait(&id).await.unwrap(), FailureReason::AuthError);
    assert_eq!(engine.awaiting_login(), vec![id]);
    assert!(engine.world(&id).unwrap().last_failure().unwrap().needs_login());
    assert!(matches!(engine.retry(&id), Err(SyncError::AwaitingLogin(_))));

    login.signed_in.store(true, Ordering::SeqCst);
    engine.resume_after_login(&id).unwrap();
    expect_synced(engine.wait(&id).await.unwrap(), SyncAction::Pushed);
    assert!(engine.awaiting_login().is_empty());
    assert_eq!(remote.history(&id), engine.get_history(&id).unwrap());
}

#[tokio::test]
async fn only_auth_failures_can_resume_after_login() {
    let remote = MemoryRemote::new();
    remote.fail_next(RemoteOp::PutBlob, 2, RemoteError::transient("offline"));
    let engine = engine_with(
        &remote,
        EngineConfig::new()
            .with_retry(fast_retry(2))
            .with_max_concurrent_transfers(1),
    );
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);

    expect_failed(
        run(&engine, &id, Direction::Push).await,
        FailureReason::TransferFailed,
    );
    assert!(engine.awaiting_login().is_empty());
    assert!(matches!(
        engine.resume_after_login(&id),
        Err(SyncError::NotAwaitingLogin(_))
    ));
}

#[tokio::test]
async fn missing_directory_fails_push_scan() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let dir = tempfile::tempdir().unwrap();
    let id = engine.register_world(&LocalWorld {
        name: "Gone".into(),
        path: dir.path().join("Gone"),
    });

    expect_failed(run(&engine, &id, Direction::Push).await, FailureReason::ScanFailed);
}

#[tokio::test]
async fn unknown_worlds_and_idle_waits() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let stranger = WorldId::new();
    assert!(matches!(
        engine.start_sync(&stranger, Direction::Auto),
        Err(SyncError::UnknownWorld(_))
    ));

    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);
    assert!(matches!(engine.wait(&id).await, Err(SyncError::NoJob(_))));
    assert!(matches!(
        engine.retry(&id),
        Err(SyncError::InvalidStateTransition { .. })
    ));
}

#[test]
fn starting_outside_a_runtime_fails() {
    let remote = MemoryRemote::new();
    let engine = engine(&remote);
    let world = TempWorld::sample("Survival");
    let id = register(&engine, &world);
    assert!(matches!(
        engine.start_sync(&id, Direction::Push),
        Err(SyncError::NoRuntime)
    ));
    assert_eq!(engine.state(&id), Some(SyncState::Idle));
}
