use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk shape of the work queue.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueDocument {
    links: Vec<String>,
}

/// Durable ordered queue of pending page URLs.
///
/// The file is the source of truth across process restarts: an item leaves
/// the queue only after its output has been durably written, so queue
/// membership is the resumability checkpoint. Rewrites go through a
/// temporary file and rename so a torn write can never destroy the queue.
#[derive(Debug)]
pub struct WorkQueue {
    path: PathBuf,
    links: Vec<String>,
}

impl WorkQueue {
    /// Loads the queue document. A missing file is an error: an empty run
    /// should be an explicit empty list, not an absent one.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read queue file {}", path.display()))?;
        let document: QueueDocument = serde_json::from_str(&raw)
            .with_context(|| format!("queue file {} is not valid JSON", path.display()))?;

        Ok(Self {
            path,
            links: document.links,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.links.iter().any(|link| link == url)
    }

    /// Copy of the pending items, taken once per run so the live queue can
    /// shrink safely while the snapshot is iterated.
    pub fn snapshot(&self) -> Vec<String> {
        self.links.clone()
    }

    /// Removes one item and persists the shrunk queue.
    ///
    /// Returns whether the item was present. Persistence happens before the
    /// call returns; callers rely on the file reflecting the removal.
    pub async fn remove(&mut self, url: &str) -> Result<bool> {
        let before = self.links.len();
        self.links.retain(|link| link != url);
        if self.links.len() == before {
            return Ok(false);
        }

        self.persist().await?;
        Ok(true)
    }

    async fn persist(&self) -> Result<()> {
        let document = QueueDocument {
            links: self.links.clone(),
        };
        let rendered =
            serde_json::to_string_pretty(&document).context("failed to serialize the queue")?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, rendered.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
