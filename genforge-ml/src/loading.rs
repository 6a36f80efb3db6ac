use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::hf_hub::hf_download;

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed)
}

pub fn mmaped_var_builder<'a>(
    weights: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'a>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
    Ok(vb)
}

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Shard filenames referenced by a `*.safetensors.index.json`, in a stable order.
pub fn shard_names(index: &Path) -> Result<Vec<String>> {
    let index: ShardIndex = read_json(index)?;
    let names: BTreeSet<String> = index.weight_map.into_values().collect();
    anyhow::ensure!(!names.is_empty(), "shard index lists no weight files");
    Ok(names.into_iter().collect())
}

/// Resolve every shard of a sharded safetensors checkpoint stored under `subfolder`.
pub async fn sharded_safetensors(repo: &str, subfolder: &str) -> Result<Vec<PathBuf>> {
    let index = hf_download(repo, &format!("{subfolder}/model.safetensors.index.json")).await?;

    let mut paths = Vec::new();
    for name in shard_names(&index)? {
        paths.push(hf_download(repo, &format!("{subfolder}/{name}")).await?);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::shard_names;

    #[test]
    fn shard_names_are_deduplicated_and_sorted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let index = dir.path().join("model.safetensors.index.json");
        std::fs::write(
            &index,
            r#"{
                "metadata": {"total_size": 1},
                "weight_map": {
                    "encoder.block.1.layer.0.SelfAttention.q.weight": "model-00002-of-00002.safetensors",
                    "shared.weight": "model-00001-of-00002.safetensors",
                    "encoder.block.0.layer.0.SelfAttention.q.weight": "model-00001-of-00002.safetensors"
                }
            }"#,
        )?;

        assert_eq!(
            shard_names(&index)?,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn empty_shard_index_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let index = dir.path().join("model.safetensors.index.json");
        std::fs::write(&index, r#"{"weight_map": {}}"#)?;

        assert!(shard_names(&index).is_err());
        Ok(())
    }
}
