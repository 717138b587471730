//! On-disk credential directories.
//!
//! ```text
//! <sessions_root>/
//! ├── shop1/        # owned by the shop1 collaborator instance
//! └── shop2/
//! ```
//!
//! A directory present at boot means a session to recover.

use crate::session::SessionId;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Session ids with a credential directory, sorted.
    ///
    /// Plain files and names that are not valid session ids are skipped.
    pub async fn list(&self) -> io::Result<Vec<SessionId>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                log::warn!("Skipping non UTF-8 credential directory {:?}", entry.path());
                continue;
            };
            match SessionId::parse(name) {
                Ok(id) if id.as_str() == name => ids.push(id),
                _ => log::warn!("Skipping credential directory with invalid name: {name}"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a session's credentials. Returns false when there was nothing
    /// to delete.
    pub async fn erase(&self, session_id: &SessionId) -> io::Result<bool> {
        match fs::remove_dir_all(self.dir_for(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
