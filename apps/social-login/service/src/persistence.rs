use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Optional on-disk JSON snapshot backing an in-memory state value.
///
/// Without a path every operation is a no-op and state lives only in memory.
#[derive(Debug, Clone, Default)]
pub struct JsonSnapshotFile {
    path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to prepare store directory {path}: {source}")]
    PrepareDirectory {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to encode store payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write store payload {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

impl JsonSnapshotFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Loads the last snapshot, booting empty when the file is missing or unreadable.
    pub fn load<T: DeserializeOwned + Default>(&self, target: &'static str) -> T {
        let Some(path) = self.path.as_ref() else {
            return T::default();
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(value) => value,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return T::default();
            }
            Err(error) => {
                tracing::warn!(
                    target: "social_login.store",
                    store = target,
                    path = %path.display(),
                    error = %error,
                    "failed to read store snapshot; booting with empty state",
                );
                return T::default();
            }
        };

        match serde_json::from_str::<T>(&raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    target: "social_login.store",
                    store = target,
                    path = %path.display(),
                    error = %error,
                    "failed to parse store snapshot; booting with empty state",
                );
                T::default()
            }
        }
    }

    pub async fn persist<T: Serialize>(&self, state: &T) -> Result<(), SnapshotError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SnapshotError::PrepareDirectory {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let payload = serde_json::to_vec(state)?;
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(|source| SnapshotError::Write {
                path: temp_path.display().to_string(),
                source,
            })?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|source| SnapshotError::Write {
                path: path.display().to_string(),
                source,
            })?;

        Ok(())
    }
}
