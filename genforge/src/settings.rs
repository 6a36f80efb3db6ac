//! Per-tab form values saved with "Save state" and used as defaults later.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

pub struct TabStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TabStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Map<String, Value> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(err) => {
                tracing::warn!("cannot read {}: {err}", self.path.display());
                return Map::new();
            }
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                tracing::warn!("ignoring malformed {}", self.path.display());
                Map::new()
            }
        }
    }

    pub async fn get(&self, tab: &str) -> Option<Value> {
        let _lock = self.lock.lock().await;
        self.read_all().await.remove(tab)
    }

    pub async fn save(&self, tab: &str, value: Value) -> anyhow::Result<()> {
        let _lock = self.lock.lock().await;
        let mut all = self.read_all().await;
        all.insert(tab.to_string(), value);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&all)?)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::info!(tab, "saved tab state");
        Ok(())
    }
}
