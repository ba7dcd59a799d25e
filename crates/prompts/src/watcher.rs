//! Eager cache invalidation for hot reload.
//!
//! The mtime check in [`PromptManager::get`] is the authoritative reload
//! mechanism; this watcher merely evicts cache entries as soon as their
//! file changes so the re-read happens on the very next use even when the
//! filesystem's mtime resolution is coarse.

use std::path::Path;
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::PromptManager;

pub struct PromptWatcher {
    /// Dropping this stops the watch.
    _watcher: RecommendedWatcher,
}

impl PromptWatcher {
    /// Watch the manager's template directory (non-recursive).
    pub fn start(manager: Arc<PromptManager>) -> notify::Result<Self> {
        let directory = manager.directory().to_path_buf();
        let mut watcher = notify::recommended_watcher(move |outcome: notify::Result<Event>| {
            match outcome {
                Ok(event) => {
                    for path in &event.paths {
                        if let Some(name) = template_name(path) {
                            debug!(template = name, "template file changed — evicting from cache");
                            manager.invalidate(name);
                        }
                    }
                }
                Err(err) => warn!(%err, "prompt watcher error"),
            }
        })?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher })
    }
}

fn template_name(path: &Path) -> Option<&str> {
    if path.extension()? != "yaml" {
        return None;
    }
    path.file_stem()?.to_str()
}
