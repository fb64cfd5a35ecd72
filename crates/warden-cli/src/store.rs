//! Record store over a plain directory: each regular file is a record and
//! its modification time is the record's last activity.

use async_trait::async_trait;
use std::fs::Metadata;
use std::io;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tracing::debug;
use warden_host::{EvictionCandidate, RecordStore, WardenError};

pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RecordStore for DirectoryStore {
    async fn list_all(&self) -> Result<Vec<EvictionCandidate>, WardenError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| WardenError::Store(format!("{}: {}", self.dir.display(), e)))?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            let metadata = entry.metadata().await;
            records.extend(candidate(id, metadata));
        }
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<(), WardenError> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(WardenError::Store(format!("invalid record id '{id}'")));
        }
        tokio::fs::remove_file(self.dir.join(id)).await?;
        Ok(())
    }
}

/// A record for a regular file. Entries that vanished or cannot be read
/// since the directory was listed are skipped.
fn candidate(id: String, metadata: io::Result<Metadata>) -> Option<EvictionCandidate> {
    let modified = metadata.and_then(|metadata| {
        if metadata.is_file() {
            metadata.modified().map(Some)
        } else {
            Ok(None)
        }
    });
    let modified = match modified {
        Ok(modified) => modified?,
        Err(e) => {
            debug!("Skipping record '{}': {}", id, e);
            return None;
        }
    };
    let last_activity_ms = modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    Some(EvictionCandidate {
        id,
        last_activity_ms,
    })
}
