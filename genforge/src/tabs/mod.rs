pub mod cogvideox;
pub mod flex1_alpha;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use genforge_ml::MemoryMode;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::Instrument;

use crate::progress::{self, GenerationProgress};
use crate::service::{InferenceGuard, InferenceService, PipelineKind, PipelineLoader};

/// A generation form and its driver.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum Tab {
    #[strum(serialize = "flex1_alpha_gguf")]
    #[serde(rename = "flex1_alpha_gguf")]
    Flex1AlphaGguf,
    #[strum(serialize = "cogvideox155b_f2v")]
    #[serde(rename = "cogvideox155b_f2v")]
    CogVideoX155bF2v,
}

impl Tab {
    pub fn kind(self) -> PipelineKind {
        match self {
            Tab::Flex1AlphaGguf => PipelineKind::Flex1AlphaGguf,
            Tab::CogVideoX155bF2v => PipelineKind::CogVideoXFunControl,
        }
    }

    /// Output directory relative to the output root.
    pub fn output_subdir(self) -> &'static str {
        match self {
            Tab::Flex1AlphaGguf => "t2i/Flex.1_alpha",
            Tab::CogVideoX155bF2v => "v2v/cogvideox155b",
        }
    }

    pub fn file_suffix(self) -> &'static str {
        match self {
            Tab::Flex1AlphaGguf => "flex1_alpha.png",
            Tab::CogVideoX155bF2v => "cogvideox155bf2v.mp4",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Tab::Flex1AlphaGguf => "Flex.1-alpha",
            Tab::CogVideoX155bF2v => "CogVideoX-Fun",
        }
    }

    pub fn media_noun(self) -> &'static str {
        match self {
            Tab::Flex1AlphaGguf => "image",
            Tab::CogVideoX155bF2v => "video",
        }
    }
}

/// A saved generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutput {
    pub path: PathBuf,
    pub label: String,
}

/// What a driver call ended with. Only `Completed` carries media.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Outcome {
    Completed(GenerationOutput),
    Busy,
    Failed { error: String },
}

impl Outcome {
    pub fn output(&self) -> Option<&GenerationOutput> {
        match self {
            Outcome::Completed(output) => Some(output),
            _ => None,
        }
    }
}

/// Shared by every tab driver.
#[derive(Clone)]
pub struct Generator {
    pub service: Arc<InferenceService>,
    pub loader: Arc<dyn PipelineLoader>,
    pub output_root: PathBuf,
}

impl Generator {
    pub fn new(
        service: Arc<InferenceService>,
        loader: Arc<dyn PipelineLoader>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            loader,
            output_root: output_root.into(),
        }
    }

    pub fn output_dir(&self, tab: Tab) -> PathBuf {
        self.output_root.join(tab.output_subdir())
    }

    /// Claim the service and run `job`, turning every error into `Failed`.
    ///
    /// The job runs on its own task and owns the guard, so dropping the
    /// returned future (a disconnected client) never frees the slot while a
    /// load or generation is still in flight.
    pub(crate) async fn drive<F, Fut>(&self, tab: Tab, job: F) -> Outcome
    where
        F: FnOnce(InferenceGuard) -> Fut,
        Fut: Future<Output = anyhow::Result<GenerationOutput>> + Send + 'static,
    {
        let Some(guard) = self.service.try_begin() else {
            tracing::warn!(%tab, "inference already in progress, rejecting request");
            return Outcome::Busy;
        };

        let task = tokio::spawn(job(guard).in_current_span());
        match task.await.context("generation task panicked").and_then(|result| result) {
            Ok(output) => {
                tracing::info!(%tab, path = %output.path.display(), "generation finished");
                Outcome::Completed(output)
            }
            Err(err) => {
                tracing::error!(%tab, "generation failed: {err:#}");
                Outcome::Failed {
                    error: format!("{err:#}"),
                }
            }
        }
    }
}

/// Run blocking pipeline work with the guard, emitting progress for `tab`.
pub(crate) async fn run_blocking<T, F>(
    tab: Tab,
    guard: InferenceGuard,
    work: F,
) -> anyhow::Result<(InferenceGuard, T)>
where
    T: Send + 'static,
    F: FnOnce(&mut InferenceGuard, &mut dyn FnMut(usize, usize)) -> anyhow::Result<T>
        + Send
        + 'static,
{
    let (guard, result) = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        let mut report = |step: usize, total: usize| {
            progress::emit(GenerationProgress::new(tab, step, total));
        };
        let result = work(&mut guard, &mut report);
        (guard, result)
    })
    .await
    .context("generation task panicked")?;
    Ok((guard, result?))
}

/// Form metadata the UI renders from.
#[derive(Debug, Serialize)]
pub struct TabDescriptor {
    pub id: Tab,
    pub label: &'static str,
    pub media: &'static str,
    pub memory_modes: Vec<MemoryMode>,
    pub variants: Vec<&'static str>,
    pub defaults: serde_json::Value,
}

pub fn describe() -> anyhow::Result<Vec<TabDescriptor>> {
    Tab::iter()
        .map(|tab| {
            let (variants, defaults) = match tab {
                Tab::Flex1AlphaGguf => (
                    flex1_alpha::GGUF_CHOICES.to_vec(),
                    serde_json::to_value(flex1_alpha::Flex1AlphaRequest::default())?,
                ),
                Tab::CogVideoX155bF2v => (
                    Vec::new(),
                    serde_json::to_value(cogvideox::CogVideoXFunRequest::default())?,
                ),
            };
            Ok(TabDescriptor {
                id: tab,
                label: tab.label(),
                media: tab.media_noun(),
                memory_modes: MemoryMode::iter().collect(),
                variants,
                defaults,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn tabs_parse_from_their_ids() {
        assert_eq!(Tab::from_str("flex1_alpha_gguf").ok(), Some(Tab::Flex1AlphaGguf));
        assert_eq!(
            Tab::from_str("cogvideox155b_f2v").ok(),
            Some(Tab::CogVideoX155bF2v)
        );
        assert!(Tab::from_str("sdxl").is_err());
    }

    #[test]
    fn descriptors_carry_choices_and_defaults() -> anyhow::Result<()> {
        let tabs = describe()?;
        assert_eq!(tabs.len(), 2);

        let flex = &tabs[0];
        assert_eq!(flex.variants.len(), 8);
        assert_eq!(flex.defaults["gguf"], "Flex.1-alpha-Q6_K.gguf - 6.91 GB");
        assert_eq!(flex.defaults["memory_optimization"], "Low VRAM");

        let video = &tabs[1];
        assert!(video.variants.is_empty());
        assert_eq!(video.defaults["memory_optimization"], "Extremely Low VRAM");
        assert_eq!(video.defaults["fps"], 15);
        Ok(())
    }

    #[test]
    fn outcomes_serialize_with_a_status_tag() -> anyhow::Result<()> {
        let busy = serde_json::to_value(Outcome::Busy)?;
        assert_eq!(busy["status"], "busy");

        let done = serde_json::to_value(Outcome::Completed(GenerationOutput {
            path: PathBuf::from("output/x.png"),
            label: "Flex.1-alpha".to_string(),
        }))?;
        assert_eq!(done["status"], "completed");
        assert_eq!(done["label"], "Flex.1-alpha");
        Ok(())
    }
}
