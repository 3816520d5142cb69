//! Push, pull, sync and resolve command implementations.
//!
//! Each invocation opens the engine on the state directory, registers the
//! save, runs a single job against a [`DirectoryRemote`] and prints the
//! registry's progress while it runs.

use super::{author, load_profile, local_world};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tracing::info;
use worldsync_core::WorldId;
use worldsync_sync_engine::{
    ConflictSide, Direction, DirectoryRemote, EngineConfig, JobOutcome, JobRequest,
    RegistryEvent, StaticSession, SyncAction, SyncEngine,
};

const LOCAL_SESSION: &str = "local";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

type Engine = SyncEngine<DirectoryRemote, StaticSession>;

/// Runs a push, pull or auto sync.
pub fn run(
    state_dir: &Path,
    path: &Path,
    remote: &Path,
    direction: Direction,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = JobRequest::new(direction);
    if let Some(message) = message {
        request = request.with_message(message);
    }
    execute(state_dir, path, remote, request)
}

/// Runs a forced job keeping one side of a conflict.
pub fn resolve(
    state_dir: &Path,
    path: &Path,
    remote: &Path,
    side: ConflictSide,
) -> Result<(), Box<dyn std::error::Error>> {
    execute(state_dir, path, remote, JobRequest::resolve(side))
}

fn open_engine(state_dir: &Path, remote: &Path) -> Result<Engine, Box<dyn std::error::Error>> {
    let profile = load_profile(state_dir)?;
    // The client id names the app to the login service; it is never a
    // bearer token. A directory remote needs no login.
    let session = StaticSession::new(LOCAL_SESSION);
    let config = EngineConfig::new().with_state_dir(state_dir);
    let engine = SyncEngine::open(
        config,
        author(&profile),
        DirectoryRemote::open(remote)?,
        session,
    )?;
    Ok(engine)
}

fn execute(
    state_dir: &Path,
    path: &Path,
    remote: &Path,
    request: JobRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let world = local_world(path)?;
    info!(
        world = %world.name,
        remote = %remote.display(),
        direction = ?request.direction,
        force = request.force,
        "starting sync"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(async {
        let engine = open_engine(state_dir, remote)?;
        let events = engine.registry().subscribe();
        let id = engine.register_world(&world);
        engine.start_job(&id, request)?;
        let outcome = wait_with_progress(&engine, &id, &events).await?;
        Ok::<_, Box<dyn std::error::Error>>(outcome)
    })?;

    match outcome {
        JobOutcome::Synced(summary) => {
            let verb = match summary.action {
                SyncAction::UpToDate => "Already up to date",
                SyncAction::Pushed => "Pushed",
                SyncAction::Pulled => "Pulled",
            };
            println!(
                "{verb}: {} transferred, {} skipped, {} bytes",
                summary.stats.transferred, summary.stats.skipped, summary.stats.bytes
            );
            if let Some(head) = summary.head {
                println!("Head: {}", head.short());
            }
            Ok(())
        }
        JobOutcome::Cancelled => Err("sync was cancelled".into()),
        JobOutcome::Failed(failure) => {
            if failure.is_conflict() {
                eprintln!("Resolve with: worldsync resolve <PATH> --remote <DIR> --keep local|remote");
            }
            Err(failure.to_string().into())
        }
    }
}

async fn wait_with_progress(
    engine: &Engine,
    id: &WorldId,
    events: &Receiver<RegistryEvent>,
) -> Result<JobOutcome, Box<dyn std::error::Error>> {
    let wait = engine.wait(id);
    tokio::pin!(wait);
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    let mut last = None;
    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome?,
            _ = tick.tick() => print_progress(events, &mut last),
        }
    };
    print_progress(events, &mut last);
    Ok(outcome)
}

fn print_progress(events: &Receiver<RegistryEvent>, last: &mut Option<(String, Option<u8>)>) {
    for event in events.try_iter() {
        let RegistryEvent::Updated(record) = event else {
            continue;
        };
        let current = (record.status().to_string(), record.progress());
        if last.as_ref() == Some(&current) {
            continue;
        }
        match current.1 {
            Some(percent) => println!("{:<12} {:>3}%", current.0, percent),
            None => println!("{}", current.0),
        }
        *last = Some(current);
    }
}
