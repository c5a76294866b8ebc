//! Watch lifecycle RPC handlers: `watch_start`, `watch_stop`, `watch_status`.
//!
//! All three take the cache write lock while consulting watch state — here
//! that's implicit in `WatchCoordinator` itself owning the interior
//! mutability, since watch state is logically part of the cache-entry-aware
//! state (spec §4.9's `watch_lock = cache_lock` note).

use std::path::PathBuf;

use codeindex_core::types::CollectionKey;
use codeindex_core::watch::WatchStats;

use super::DaemonState;
use crate::error::DaemonError;

pub fn watch_start(state: &DaemonState, root: PathBuf, key: &CollectionKey) -> crate::Result<()> {
    let entry = state.ensure_cache_loaded(key);
    let deps = state
        .watch_deps
        .lock()
        .clone()
        .ok_or_else(|| DaemonError::Unavailable("watch collaborators not configured".into()))?;
    state
        .watch
        .start(root, entry, deps)
        .map_err(DaemonError::Index)
}

pub fn watch_stop(state: &DaemonState) -> WatchStats {
    state.watch.stop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    #[test]
    fn watch_start_without_configured_deps_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let state = DaemonState::new(DaemonConfig::default());
        let key = CollectionKey::new(dir.path(), "default");
        let result = watch_start(&state, dir.path().to_path_buf(), &key);
        assert!(matches!(result, Err(DaemonError::Unavailable(_))));
    }
}
