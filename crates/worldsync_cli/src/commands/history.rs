//! History command implementation.

use super::local_world;
use std::path::Path;
use tracing::info;
use worldsync_core::{Commit, CommitStore, WorldId};

/// Runs the history command.
pub fn run(
    state_dir: &Path,
    path: &Path,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let world = local_world(path)?;
    let id = WorldId::from_name(&world.name);
    info!(world = %world.name, %id, "reading history");

    let store = CommitStore::open(&state_dir.join("commits"))?;
    let history = store.history(&id);
    if history.is_empty() {
        println!("No commits for {}", world.name);
        return Ok(());
    }

    let shown = limit.unwrap_or(history.len()).min(history.len());
    for commit in &history[..shown] {
        println!("{}", format_commit(commit));
    }
    if shown < history.len() {
        println!("... {} older commits", history.len() - shown);
    }
    Ok(())
}

fn format_commit(commit: &Commit) -> String {
    format!(
        "{}  #{:<4} {}  {:<16} {}",
        commit.id().short(),
        commit.height(),
        commit.timestamp_ms(),
        commit.author().name,
        commit.message()
    )
}
