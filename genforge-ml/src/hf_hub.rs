//! Weight downloads from the Hugging Face Hub, cached under the model dir.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use hf_hub::{
    Cache, Repo,
    api::tokio::{Api, ApiBuilder},
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use once_cell::sync::{Lazy, OnceCell};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::Instrument;

const OFFICIAL_ENDPOINT: &str = "https://huggingface.co";
const HF_MIRRORS: [&str; 2] = [OFFICIAL_ENDPOINT, "https://hf-mirror.com"];
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static CACHE_DIR: OnceCell<PathBuf> = OnceCell::new();
static HF_ENDPOINT: Lazy<String> = Lazy::new(resolve_endpoint);
static HF_CACHE: Lazy<Cache> = Lazy::new(|| Cache::new(cache_dir().clone()));
static HF_API: OnceCell<Api> = OnceCell::new();
static DOWNLOADS: Lazy<MultiProgress> = Lazy::new(MultiProgress::new);

/// One file of a Hub model repo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubFile {
    pub repo: &'static str,
    pub filename: &'static str,
}

impl HubFile {
    pub const fn new(repo: &'static str, filename: &'static str) -> Self {
        Self { repo, filename }
    }

    pub async fn fetch(&self) -> anyhow::Result<PathBuf> {
        hf_download(self.repo, self.filename).await
    }
}

fn cache_dir() -> &'static PathBuf {
    CACHE_DIR.get_or_init(|| {
        dirs::cache_dir()
            .unwrap_or_default()
            .join("genforge")
            .join("models")
    })
}

pub fn set_cache_dir(path: PathBuf) -> anyhow::Result<()> {
    CACHE_DIR
        .set(path)
        .map_err(|_| anyhow::anyhow!("cache dir has already been set"))
}

/// `HF_ENDPOINT` when set, otherwise the official hub if it answers, then any mirror that does.
fn resolve_endpoint() -> String {
    if let Some(endpoint) = std::env::var("HF_ENDPOINT").ok().filter(|e| !e.is_empty()) {
        return endpoint;
    }
    let reachable: Vec<&'static str> = HF_MIRRORS
        .par_iter()
        .copied()
        .filter(|endpoint| is_reachable(endpoint))
        .collect();
    let endpoint = choose_endpoint(&reachable);
    tracing::info!("using Hugging Face endpoint {endpoint}");
    endpoint.to_string()
}

fn is_reachable(endpoint: &str) -> bool {
    reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .and_then(|client| client.head(endpoint).send())
        .is_ok_and(|resp| resp.status().is_success())
}

fn choose_endpoint(reachable: &[&'static str]) -> &'static str {
    if reachable.contains(&OFFICIAL_ENDPOINT) {
        return OFFICIAL_ENDPOINT;
    }
    reachable.first().copied().unwrap_or(OFFICIAL_ENDPOINT)
}

fn api() -> anyhow::Result<&'static Api> {
    HF_API.get_or_try_init(|| {
        ApiBuilder::new()
            .with_endpoint(HF_ENDPOINT.clone())
            .with_cache_dir(cache_dir().clone())
            .high()
            .build()
            .context("failed to build the Hugging Face client")
    })
}

fn progress_bar(filename: &str) -> anyhow::Result<ProgressBar> {
    let style = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
    )?;
    let pb = DOWNLOADS.add(ProgressBar::new_spinner());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(style);
    pb.set_message(filename.to_string());
    Ok(pb)
}

/// Path of `filename` in `repo`, downloading it only when the cache misses.
pub async fn hf_download(repo: &str, filename: &str) -> anyhow::Result<PathBuf> {
    let hf_repo = Repo::model(repo.to_string());
    if let Some(path) = HF_CACHE.repo(hf_repo.clone()).get(filename) {
        return Ok(path);
    }

    // the endpoint probe blocks, keep it off the runtime threads
    let api = tokio::task::spawn_blocking(api)
        .await
        .context("endpoint probe panicked")??;
    let path = api
        .repo(hf_repo)
        .download_with_progress(filename, progress_bar(filename)?)
        .instrument(tracing::info_span!("hf_download", repo, filename))
        .await
        .with_context(|| format!("failed to download {repo}/{filename}"))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn official_endpoint_wins_when_reachable() {
        assert_eq!(choose_endpoint(&HF_MIRRORS), OFFICIAL_ENDPOINT);
        assert_eq!(
            choose_endpoint(&["https://hf-mirror.com", OFFICIAL_ENDPOINT]),
            OFFICIAL_ENDPOINT
        );
    }

    #[test]
    fn falls_back_to_a_mirror_then_to_the_official_endpoint() {
        assert_eq!(
            choose_endpoint(&["https://hf-mirror.com"]),
            "https://hf-mirror.com"
        );
        assert_eq!(choose_endpoint(&[]), OFFICIAL_ENDPOINT);
    }

    #[test]
    fn hub_files_keep_repo_and_name() {
        const FILE: HubFile = HubFile::new("ostris/Flex.1-alpha", "text_encoder/model.safetensors");
        assert_eq!(FILE.repo, "ostris/Flex.1-alpha");
        assert_eq!(FILE.filename, "text_encoder/model.safetensors");
    }
}
