//! Shared service handles threaded through every tool.

use std::sync::Arc;

use tracing::{info, warn};

use engram_config::OnboardingConfig;
use engram_memory::{EvolutionEngine, MemoryService, WorkspaceService};

pub struct ServerState {
    pub memory: MemoryService,
    pub workspaces: WorkspaceService,
    pub evolution: EvolutionEngine,
    /// Strategy guide content, read once at startup.
    pub strategy_guide: Option<String>,
}

impl ServerState {
    pub fn new(
        memory: MemoryService,
        workspaces: WorkspaceService,
        evolution: EvolutionEngine,
        strategy_guide: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            memory,
            workspaces,
            evolution,
            strategy_guide,
        })
    }
}

/// Read and cache the onboarding strategy guide.
///
/// Degrades to `None` on any problem; a missing or oversized guide must
/// never keep the server from starting.
pub fn load_strategy_guide(config: &OnboardingConfig) -> Option<String> {
    let path = config.strategy_guide_path.trim();
    if path.is_empty() {
        return None;
    }
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => {
            warn!(path, %err, "strategy guide unreadable — onboarding will omit it");
            return None;
        }
    };
    if size > config.max_file_size {
        warn!(
            path,
            size,
            limit = config.max_file_size,
            "strategy guide exceeds the size limit — skipping"
        );
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(content) if content.contains('\0') => {
            warn!(path, "strategy guide contains null bytes — skipping");
            None
        }
        Ok(content) => {
            info!(path, bytes = content.len(), "strategy guide cached");
            Some(content)
        }
        Err(err) => {
            warn!(path, %err, "strategy guide unreadable — onboarding will omit it");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_for(path: &str, max: u64) -> OnboardingConfig {
        OnboardingConfig {
            strategy_guide_path: path.to_string(),
            max_file_size: max,
        }
    }

    #[test]
    fn empty_path_yields_none() {
        assert!(load_strategy_guide(&config_for("", 1024)).is_none());
    }

    #[test]
    fn missing_file_degrades_to_none() {
        assert!(load_strategy_guide(&config_for("/nonexistent/guide.md", 1024)).is_none());
    }

    #[test]
    fn oversized_file_is_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "0123456789").unwrap();
        let path = file.path().display().to_string();
        assert!(load_strategy_guide(&config_for(&path, 5)).is_none());
        assert!(load_strategy_guide(&config_for(&path, 100)).is_some());
    }

    #[test]
    fn null_bytes_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"guide\0body").unwrap();
        let path = file.path().display().to_string();
        assert!(load_strategy_guide(&config_for(&path, 1024)).is_none());
    }
}
