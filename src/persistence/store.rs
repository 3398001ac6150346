use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::models::StateSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Named-blob file store. One snapshot per name, replaced atomically.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileStateStore { path: path.as_ref().to_path_buf() }
    }

    /// Load the last snapshot; `None` on first boot.
    pub async fn load(&self) -> Result<Option<StateSnapshot>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: StateSnapshot = serde_json::from_slice(&bytes)?;
        info!(
            path = %self.path.display(),
            positions = snapshot.positions.len(),
            trades = snapshot.history.len(),
            "state snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    /// Write-temp-then-rename so a crash mid-write cannot tear the blob.
    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "state snapshot saved");
        Ok(())
    }
}
