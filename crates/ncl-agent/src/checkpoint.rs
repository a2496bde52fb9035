//! JSON file checkpoint store.

use async_trait::async_trait;
use nclprotocol::{Checkpointer, Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Stores checkpoints as a JSON object of `name → sequence number`.
///
/// The file is rewritten through a temporary sibling and a rename, so a crash
/// leaves either the old or the new contents.
pub struct FileCheckpointer {
    path: PathBuf,
    values: tokio::sync::Mutex<BTreeMap<String, u64>>,
}

impl FileCheckpointer {
    /// Load checkpoints from `path`. A missing file starts empty and is
    /// created on the first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Checkpoint(format!("invalid checkpoint file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::Checkpoint(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            values: tokio::sync::Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn checkpoint(&self, name: &str, seq_num: u64) -> Result<()> {
        let mut values = self.values.lock().await;
        if values.get(name) == Some(&seq_num) {
            return Ok(());
        }
        let mut updated = values.clone();
        updated.insert(name.to_string(), seq_num);

        let bytes = serde_json::to_vec_pretty(&updated)?;
        let tmp = self.path.with_extension("tmp");
        let written = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;
        if let Err(e) = written {
            return Err(Error::Checkpoint(format!(
                "failed to write {}: {e}",
                self.path.display()
            )));
        }

        *values = updated;
        tracing::trace!(name, seq_num, "checkpoint stored");
        Ok(())
    }

    async fn get_checkpoint(&self, name: &str) -> Result<u64> {
        Ok(self.values.lock().await.get(name).copied().unwrap_or(0))
    }
}
