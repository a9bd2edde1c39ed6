//! Reloads the engine when a song lands in a watched directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::engine::EngineCommand;
use crate::import;

/// Writers usually produce a burst of events per file.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Stops watching when dropped.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
}

/// Song files an event says were created, written or moved in.
pub fn changed_songs(event: &Event) -> Vec<PathBuf> {
    let relevant = matches!(
        event.kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    );
    if !relevant {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| import::is_supported(p))
        .cloned()
        .collect()
}

pub fn watch_directory(
    dir: &Path,
    commands: Sender<EngineCommand>,
) -> Result<DirectoryWatcher, notify::Error> {
    let mut last_sent: HashMap<PathBuf, Instant> = HashMap::new();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in changed_songs(&event) {
                let now = Instant::now();
                if last_sent
                    .get(&path)
                    .is_some_and(|at| now.duration_since(*at) < DEBOUNCE)
                {
                    continue;
                }
                last_sent.insert(path.clone(), now);
                tracing::info!(path = %path.display(), "song changed, reloading");
                let _ = commands.send(EngineCommand::Load(path));
            }
        }
        Err(e) => tracing::warn!(error = %e, "watch error"),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    tracing::info!(dir = %dir.display(), "watching for songs");

    Ok(DirectoryWatcher { _watcher: watcher })
}
