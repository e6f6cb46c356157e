//! Per-client record of which package revisions are already on disk.
//!
//! Stored as JSON next to the client's content. A file written for another
//! session is discarded wholesale.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use super::package_manager::PackageError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedClientState {
    pub session_identifier: Uuid,
    /// Package name → revision last written to disk
    pub persisted_files: BTreeMap<String, i64>,
}

impl PersistedClientState {
    pub fn new(session_identifier: Uuid) -> Self {
        Self {
            session_identifier,
            persisted_files: BTreeMap::new(),
        }
    }

    /// Load the state for `session_identifier`, or start fresh when the file
    /// is missing or belongs to another session.
    pub fn load(path: &Path, session_identifier: Uuid) -> Result<Self, PackageError> {
        if !path.exists() {
            return Ok(Self::new(session_identifier));
        }
        let text = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&text)?;
        if state.session_identifier != session_identifier {
            log::info!(
                "Discarding persisted state of session {} (current session {session_identifier})",
                state.session_identifier
            );
            return Ok(Self::new(session_identifier));
        }
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<(), PackageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn revision(&self, package_name: &str) -> Option<i64> {
        self.persisted_files.get(package_name).copied()
    }

    pub fn set_revision(&mut self, package_name: &str, revision: i64) {
        self.persisted_files.insert(package_name.to_string(), revision);
    }

    pub fn remove(&mut self, package_name: &str) -> Option<i64> {
        self.persisted_files.remove(package_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_same_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("client.json");
        let session = Uuid::new_v4();

        let mut state = PersistedClientState::new(session);
        state.set_revision("/Game/Map", 3);
        state.save(&path).unwrap();

        let loaded = PersistedClientState::load(&path, session).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.revision("/Game/Map"), Some(3));
    }

    #[test]
    fn test_other_session_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");

        let mut state = PersistedClientState::new(Uuid::new_v4());
        state.set_revision("/Game/Map", 3);
        state.save(&path).unwrap();

        let current = Uuid::new_v4();
        let loaded = PersistedClientState::load(&path, current).unwrap();
        assert_eq!(loaded.session_identifier, current);
        assert!(loaded.persisted_files.is_empty());
    }

    #[test]
    fn test_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let session = Uuid::new_v4();
        let loaded = PersistedClientState::load(&dir.path().join("none.json"), session).unwrap();
        assert_eq!(loaded, PersistedClientState::new(session));
    }
}
