//! File-sharing side channel for packages too large to embed in a message.
//!
//! The sender publishes the bytes and embeds only the returned file id;
//! receivers fetch the bytes by id. The directory-backed implementation
//! expects every endpoint to see the same directory (a network share).

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FileShareError {
    #[error("Shared file not found: {0}")]
    NotFound(String),
    #[error("Invalid file id: {0}")]
    InvalidFileId(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait FileSharing: Send {
    /// Store `data` and return its file id.
    fn publish(&mut self, data: &[u8]) -> Result<String, FileShareError>;

    fn fetch(&self, file_id: &str) -> Result<Vec<u8>, FileShareError>;
}

/// LZ4-compressed blobs in a shared directory, named by a v4 UUID.
#[derive(Debug, Clone)]
pub struct DirectoryFileSharing {
    root: PathBuf,
}

impl DirectoryFileSharing {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, FileShareError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, file_id: &str) -> Result<PathBuf, FileShareError> {
        let id = Uuid::parse_str(file_id).map_err(|_| FileShareError::InvalidFileId(file_id.to_string()))?;
        Ok(self.root.join(format!("{id}.blob")))
    }
}

impl FileSharing for DirectoryFileSharing {
    fn publish(&mut self, data: &[u8]) -> Result<String, FileShareError> {
        let file_id = Uuid::new_v4().to_string();
        let path = self.blob_path(&file_id)?;
        fs::write(&path, lz4_flex::compress_prepend_size(data))?;
        log::debug!("Published {} bytes as shared file {file_id}", data.len());
        Ok(file_id)
    }

    fn fetch(&self, file_id: &str) -> Result<Vec<u8>, FileShareError> {
        let path = self.blob_path(file_id)?;
        if !path.exists() {
            return Err(FileShareError::NotFound(file_id.to_string()));
        }
        let compressed = fs::read(&path)?;
        lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| FileShareError::CompressionError(e.to_string()))
    }
}
