//! Client package manager: package files on disk, in both directions.
//!
//! Outgoing, a locally saved package becomes a `PackageUpdateEvent`, with the
//! bytes embedded, published to the file-sharing side channel, or refused.
//!
//! Incoming, package activities are written to the content directory and
//! the affected packages are queued for hot-reload or purge. Those only run
//! when the suspend guard allows it; otherwise they are retried next tick.
//!
//! ```text
//! apply_package_update ─► write / delete files ─► pending_hot_reload / pending_purge
//!                                                         │ process_pending(guard)
//!                                                         ▼
//!                                                  PackageReloader
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use ensemble_core::{ActivityLedger, PackageData, PackageEvent, PackageInfo, PackageUpdateType, SuspendGuard};

use super::persisted::PersistedClientState;
use crate::config::PackageManagerConfig;
use crate::protocol::PackageUpdateEvent;
use crate::storage::{FileShareError, FileSharing};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Package {package_name} is {size} bytes, limit is {limit}")]
    PayloadTooLarge { package_name: String, size: u64, limit: u64 },
    #[error("Package {0} references a shared file but no file sharing is configured")]
    NoFileSharing(String),
    #[error("No head revision for package {0}")]
    NoHeadRevision(String),
    #[error("File sharing error: {0}")]
    FileShare(#[from] FileShareError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid persisted state: {0}")]
    State(#[from] serde_json::Error),
}

/// Engine-side package reload and purge.
pub trait PackageReloader: Send {
    fn hot_reload(&mut self, package_names: &[String]);

    fn purge(&mut self, package_names: &[String]);
}

/// Packages handed to the reloader by one `process_pending` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedPackages {
    pub hot_reloaded: Vec<String>,
    pub purged: Vec<String>,
}

impl ProcessedPackages {
    pub fn is_empty(&self) -> bool {
        self.hot_reloaded.is_empty() && self.purged.is_empty()
    }
}

pub struct PackageManager {
    config: PackageManagerConfig,
    file_sharing: Option<Box<dyn FileSharing>>,
    reloader: Option<Box<dyn PackageReloader>>,
    pending_hot_reload: BTreeSet<String>,
    pending_purge: BTreeSet<String>,
    persisted: PersistedClientState,
    persisted_path: Option<PathBuf>,
    persisted_dirty: bool,
}

impl PackageManager {
    pub fn new(config: PackageManagerConfig) -> Self {
        Self {
            config,
            file_sharing: None,
            reloader: None,
            pending_hot_reload: BTreeSet::new(),
            pending_purge: BTreeSet::new(),
            persisted: PersistedClientState::default(),
            persisted_path: None,
            persisted_dirty: false,
        }
    }

    pub fn set_file_sharing(&mut self, file_sharing: Box<dyn FileSharing>) {
        self.file_sharing = Some(file_sharing);
    }

    pub fn set_reloader(&mut self, reloader: Box<dyn PackageReloader>) {
        self.reloader = Some(reloader);
    }

    /// Track persisted revisions for `session_id` in the file at `path`.
    pub fn load_persisted_state(&mut self, path: Option<PathBuf>, session_id: Uuid) -> Result<(), PackageError> {
        self.persisted = match &path {
            Some(path) => PersistedClientState::load(path, session_id)?,
            None => PersistedClientState::new(session_id),
        };
        self.persisted_path = path;
        self.persisted_dirty = false;
        Ok(())
    }

    /// Write the persisted state if it changed.
    pub fn save_persisted_state(&mut self) -> Result<(), PackageError> {
        if !self.persisted_dirty {
            return Ok(());
        }
        if let Some(path) = &self.persisted_path {
            self.persisted.save(path)?;
        }
        self.persisted_dirty = false;
        Ok(())
    }

    // ─── Outgoing ─────────────────────────────────────────────────────

    /// Turn a local package event into an update for the server.
    ///
    /// `file` is the saved package on disk; renames and deletions may omit
    /// it. Without file sharing, packages over the absolute limit are
    /// refused before anything is sent.
    pub fn on_local_package_event(
        &mut self,
        info: PackageInfo,
        file: Option<&Path>,
    ) -> Result<PackageUpdateEvent, PackageError> {
        let data = match file {
            Some(path) if info.update_type != PackageUpdateType::Deleted => {
                let bytes = fs::read(path)?;
                self.package_data(&info.package_name, bytes)?
            }
            _ => PackageData::Empty,
        };
        log::debug!(
            "Local {:?} of {} ({} bytes)",
            info.update_type,
            info.package_name,
            data.size()
        );
        Ok(PackageUpdateEvent { info, data })
    }

    fn package_data(&mut self, package_name: &str, bytes: Vec<u8>) -> Result<PackageData, PackageError> {
        let size = bytes.len() as u64;
        if size <= self.config.max_inline_package_size {
            return Ok(PackageData::Inline(bytes));
        }
        if let Some(file_sharing) = self.file_sharing.as_mut() {
            let file_id = file_sharing.publish(&bytes)?;
            return Ok(PackageData::Shared { file_id, size });
        }
        // Without a side channel the bytes travel inline, up to the maximum
        if size > self.config.max_package_size {
            return Err(PackageError::PayloadTooLarge {
                package_name: package_name.to_string(),
                size,
                limit: self.config.max_package_size,
            });
        }
        Ok(PackageData::Inline(bytes))
    }

    // ─── Incoming ─────────────────────────────────────────────────────

    /// Apply a package activity to disk. Returns `false` when this revision
    /// is already on disk.
    pub fn apply_package_update(&mut self, event: &PackageEvent) -> Result<bool, PackageError> {
        let name = event.info.resulting_package_name();
        if event.info.update_type != PackageUpdateType::Deleted
            && self.persisted.revision(name).is_some_and(|r| r >= event.revision)
        {
            log::trace!("Package {name} revision {} already on disk", event.revision);
            return Ok(false);
        }
        self.write_package(event)?;
        Ok(true)
    }

    fn write_package(&mut self, event: &PackageEvent) -> Result<(), PackageError> {
        let info = &event.info;
        match info.update_type {
            PackageUpdateType::Added | PackageUpdateType::Saved | PackageUpdateType::Dummy => {
                if let Some(bytes) = self.resolve_data(&info.package_name, &event.data)? {
                    self.write_file(&info.package_name, &info.extension, &bytes)?;
                }
                self.schedule_hot_reload(&info.package_name);
                self.mark_persisted(&info.package_name, event.revision);
            }
            PackageUpdateType::Renamed => {
                let new_name = info.resulting_package_name().to_string();
                self.delete_files(&info.package_name)?;
                self.schedule_purge(&info.package_name);
                self.persisted.remove(&info.package_name);

                if let Some(bytes) = self.resolve_data(&new_name, &event.data)? {
                    self.write_file(&new_name, &info.extension, &bytes)?;
                }
                self.schedule_hot_reload(&new_name);
                self.mark_persisted(&new_name, event.revision);
            }
            PackageUpdateType::Deleted => {
                self.delete_files(&info.package_name)?;
                self.schedule_purge(&info.package_name);
                self.persisted.remove(&info.package_name);
                self.persisted_dirty = true;
            }
        }
        log::debug!(
            "Applied {:?} of {} (revision {})",
            info.update_type,
            info.package_name,
            event.revision
        );
        Ok(())
    }

    /// Rewrite a package from its head revision in `ledger`, discarding
    /// local changes.
    pub fn restore_head(&mut self, ledger: &ActivityLedger, package_name: &str) -> Result<(), PackageError> {
        let head = ledger
            .head_package(package_name)
            .ok_or_else(|| PackageError::NoHeadRevision(package_name.to_string()))?
            .clone();
        log::info!("Restoring {package_name} to revision {}", head.revision);
        self.write_package(&head)
    }

    /// Local changes to a package were thrown away by the user.
    pub fn on_local_package_discarded(
        &mut self,
        ledger: &ActivityLedger,
        package_name: &str,
    ) -> Result<(), PackageError> {
        self.restore_head(ledger, package_name)
    }

    fn resolve_data(&self, package_name: &str, data: &PackageData) -> Result<Option<Vec<u8>>, PackageError> {
        match data {
            PackageData::Empty => Ok(None),
            PackageData::Inline(bytes) => Ok(Some(bytes.clone())),
            PackageData::Shared { file_id, .. } => {
                let file_sharing = self
                    .file_sharing
                    .as_ref()
                    .ok_or_else(|| PackageError::NoFileSharing(package_name.to_string()))?;
                Ok(Some(file_sharing.fetch(file_id)?))
            }
        }
    }

    fn schedule_hot_reload(&mut self, package_name: &str) {
        self.pending_purge.remove(package_name);
        self.pending_hot_reload.insert(package_name.to_string());
    }

    fn schedule_purge(&mut self, package_name: &str) {
        self.pending_hot_reload.remove(package_name);
        self.pending_purge.insert(package_name.to_string());
    }

    fn mark_persisted(&mut self, package_name: &str, revision: i64) {
        self.persisted.set_revision(package_name, revision);
        self.persisted_dirty = true;
    }

    /// Hand queued reloads and purges to the reloader, if the guard allows.
    pub fn process_pending(&mut self, guard: &dyn SuspendGuard) -> ProcessedPackages {
        if self.pending_hot_reload.is_empty() && self.pending_purge.is_empty() {
            return ProcessedPackages::default();
        }
        if !guard.can_hot_reload_or_purge() {
            log::trace!(
                "Deferring {} reloads and {} purges",
                self.pending_hot_reload.len(),
                self.pending_purge.len()
            );
            return ProcessedPackages::default();
        }

        let processed = ProcessedPackages {
            hot_reloaded: std::mem::take(&mut self.pending_hot_reload).into_iter().collect(),
            purged: std::mem::take(&mut self.pending_purge).into_iter().collect(),
        };
        if let Some(reloader) = self.reloader.as_mut() {
            if !processed.purged.is_empty() {
                reloader.purge(&processed.purged);
            }
            if !processed.hot_reloaded.is_empty() {
                reloader.hot_reload(&processed.hot_reloaded);
            }
        }
        processed
    }

    // ─── Files ────────────────────────────────────────────────────────

    /// On-disk path of a package: `content_dir/<name>.<extension>`.
    pub fn package_path(&self, package_name: &str, extension: &str) -> PathBuf {
        self.config
            .content_dir
            .join(format!("{}.{extension}", package_name.trim_start_matches('/')))
    }

    /// Write through a staging file so readers never see a partial package.
    fn write_file(&self, package_name: &str, extension: &str, bytes: &[u8]) -> Result<(), PackageError> {
        let path = self.package_path(package_name, extension);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension(format!("{extension}.staging"));
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    /// Delete every file of the package, whatever its extension.
    fn delete_files(&self, package_name: &str) -> Result<usize, PackageError> {
        let base = self
            .config
            .content_dir
            .join(package_name.trim_start_matches('/'));
        let (Some(dir), Some(stem)) = (base.parent(), base.file_name()) else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut deleted = 0;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.file_stem() == Some(stem) {
                fs::remove_file(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn pending_hot_reload(&self) -> &BTreeSet<String> {
        &self.pending_hot_reload
    }

    pub fn pending_purge(&self) -> &BTreeSet<String> {
        &self.pending_purge
    }

    pub fn persisted_state(&self) -> &PersistedClientState {
        &self.persisted
    }

    pub fn config(&self) -> &PackageManagerConfig {
        &self.config
    }
}
