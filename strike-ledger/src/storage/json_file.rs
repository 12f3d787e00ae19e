use async_trait::async_trait;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use super::PenaltyStore;
use crate::models::{LedgerDocument, LedgerError, LedgerResult, LedgerSnapshot};

/// Ledger persisted as a single JSON document.
///
/// Writes go to a temporary file in the same directory which is fsynced and
/// then renamed over the document, so readers only ever see a complete
/// committed document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    write_timeout: Duration,
}

impl JsonFileStore {
    /// Open a store at `path`, creating missing parent directories. The
    /// document itself is created on the first persist.
    pub fn open(path: impl Into<PathBuf>, write_timeout: Duration) -> LedgerResult<Self> {
        let path = path.into();
        let dir = parent_dir(&path);
        fs::create_dir_all(dir).map_err(|e| {
            LedgerError::StorageWrite(format!("cannot create {}: {}", dir.display(), e))
        })?;

        info!(path = %path.display(), "Opened strike ledger document");
        Ok(Self {
            path,
            write_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PenaltyStore for JsonFileStore {
    async fn load(&self) -> LedgerResult<LedgerSnapshot> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_document(&path)).await?
    }

    async fn persist(&self, snapshot: &LedgerSnapshot) -> LedgerResult<()> {
        let bytes = serde_json::to_vec_pretty(&snapshot.to_document())
            .map_err(|e| LedgerError::StorageWrite(format!("cannot encode ledger: {}", e)))?;

        // An abandoned stage is dropped with its task, which removes the temp file.
        let path = self.path.clone();
        let staging = tokio::task::spawn_blocking(move || stage_document(&path, &bytes));
        let staged = match tokio::time::timeout(self.write_timeout, staging).await {
            Ok(joined) => joined?.map_err(|e| {
                error!(path = %self.path.display(), error = %e, "Failed to stage ledger document");
                LedgerError::StorageWrite(format!("cannot write {}: {}", self.path.display(), e))
            })?,
            Err(_) => {
                error!(
                    path = %self.path.display(),
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "Timed out staging ledger document"
                );
                return Err(LedgerError::StorageWrite(format!(
                    "timed out after {:?} writing {}",
                    self.write_timeout,
                    self.path.display()
                )));
            }
        };

        // The rename is the commit point and is always awaited, so a reported
        // failure never becomes visible afterwards.
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || staged.persist(&path).map(|_| ()).map_err(|e| e.error))
            .await?
            .map_err(|e| {
                error!(path = %self.path.display(), error = %e, "Failed to commit ledger document");
                LedgerError::StorageWrite(format!("cannot replace {}: {}", self.path.display(), e))
            })?;

        debug!(
            path = %self.path.display(),
            users = snapshot.user_count(),
            records = snapshot.record_count(),
            "Ledger document committed"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn read_document(path: &Path) -> LedgerResult<LedgerSnapshot> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No ledger document yet, starting empty");
            return Ok(LedgerSnapshot::new());
        }
        Err(e) => {
            return Err(LedgerError::StorageRead(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let corrupt = |reason: String| {
        error!(path = %path.display(), reason = %reason, "Ledger document is corrupt");
        LedgerError::StorageCorrupt {
            path: path.to_path_buf(),
            reason,
        }
    };

    let document: LedgerDocument =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    LedgerSnapshot::from_document(document).map_err(corrupt)
}

fn stage_document(path: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    let mut staged = NamedTempFile::new_in(parent_dir(path))?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    Ok(staged)
}
