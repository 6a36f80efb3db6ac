//! Text-to-image with Flex.1-alpha and a GGUF-quantized transformer.

use anyhow::Context;
use genforge_ml::{GenerateInput, MemoryMode, SamplingParams};
use serde::{Deserialize, Serialize};

use super::{GenerationOutput, Generator, Outcome, Tab, run_blocking};
use crate::output::save_media;
use crate::service::{PipelineKey, VaeOptions};

const TAB: Tab = Tab::Flex1AlphaGguf;

pub const GGUF_CHOICES: [&str; 8] = [
    "Flex.1-alpha-Q3_K_M.gguf - 3.8 GB",
    "Flex.1-alpha-Q3_K_S.gguf - 3.74 GB",
    "Flex.1-alpha-Q4_0.gguf - 4.82 GB",
    "Flex.1-alpha-Q4_K_M.gguf - 4.88 GB",
    "Flex.1-alpha-Q5_0.gguf - 5.83 GB",
    "Flex.1-alpha-Q5_K_M.gguf - 5.89 GB",
    "Flex.1-alpha-Q6_K.gguf - 6.91 GB",
    "Flex.1-alpha-Q8_0.gguf - 8.87 GB",
];

pub const DEFAULT_GGUF: &str = "Flex.1-alpha-Q6_K.gguf - 6.91 GB";

/// Split a `"<file> - <size> GB"` choice into the file name and its size.
pub fn parse_gguf(selection: &str) -> anyhow::Result<(String, f32)> {
    let (file, size) = selection
        .split_once(" - ")
        .with_context(|| format!("malformed GGUF selection {selection:?}"))?;
    let size = size.trim().trim_end_matches("GB").trim();
    let size: f32 = size
        .parse()
        .with_context(|| format!("malformed GGUF size in {selection:?}"))?;
    anyhow::ensure!(
        file.ends_with(".gguf"),
        "{file:?} is not a GGUF file"
    );
    Ok((file.to_string(), size))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flex1AlphaRequest {
    pub seed: u64,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub guidance_scale: f64,
    pub inference_steps: usize,
    pub memory_optimization: MemoryMode,
    pub vaeslicing: bool,
    pub vaetiling: bool,
    pub gguf: String,
}

impl Default for Flex1AlphaRequest {
    fn default() -> Self {
        Self {
            seed: 0,
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 1024,
            height: 1024,
            guidance_scale: 1.0,
            inference_steps: 20,
            memory_optimization: MemoryMode::LowVram,
            vaeslicing: true,
            vaetiling: true,
            gguf: DEFAULT_GGUF.to_string(),
        }
    }
}

impl Flex1AlphaRequest {
    fn sampling(&self) -> anyhow::Result<SamplingParams> {
        anyhow::ensure!(
            self.width > 0 && self.height > 0,
            "width and height must be positive"
        );
        anyhow::ensure!(self.inference_steps > 0, "at least one inference step is required");
        Ok(SamplingParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            width: self.width as usize,
            height: self.height as usize,
            guidance_scale: self.guidance_scale,
            steps: self.inference_steps,
            seed: self.seed,
        })
    }
}

#[tracing::instrument(level = "info", skip_all, fields(gguf = %request.gguf, seed = request.seed))]
pub async fn generate(generator: &Generator, request: Flex1AlphaRequest) -> Outcome {
    let loader = generator.loader.clone();
    let dir = generator.output_dir(TAB);
    generator
        .drive(TAB, |mut guard| async move {
            let (gguf_file, size_gb) = parse_gguf(&request.gguf)?;
            tracing::info!("using {gguf_file} ({size_gb} GB)");
            let input = GenerateInput::text(request.sampling()?);

            let key = PipelineKey {
                kind: TAB.kind(),
                memory_mode: request.memory_optimization,
                variant: Some(gguf_file),
            };
            let vae = VaeOptions {
                slicing: request.vaeslicing,
                tiling: request.vaetiling,
            };
            guard
                .acquire_with(loader.as_ref(), key, vae)
                .await?;

            let (guard, path) = run_blocking(TAB, guard, move |guard, progress| {
                let media = guard.generate(&input, progress)?;
                save_media(&media, &dir, TAB.file_suffix(), 0)
            })
            .await?;
            guard.end();

            Ok(GenerationOutput {
                path,
                label: TAB.label().to_string(),
            })
        })
        .await
}
