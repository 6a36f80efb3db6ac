//! Control-video-to-video with CogVideoX-Fun.

use std::path::PathBuf;

use genforge_ml::{ControlVideo, GenerateInput, MemoryMode, SamplingParams, video::load_frames};
use serde::{Deserialize, Serialize};

use super::{GenerationOutput, Generator, Outcome, Tab, run_blocking};
use crate::output::save_media;
use crate::service::{PipelineKey, VaeOptions};

const TAB: Tab = Tab::CogVideoX155bF2v;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CogVideoXFunRequest {
    pub input_video: Option<PathBuf>,
    pub seed: u64,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub guidance_scale: f64,
    pub inference_steps: usize,
    pub use_dynamic_cfg: bool,
    pub memory_optimization: MemoryMode,
    pub vaeslicing: bool,
    pub vaetiling: bool,
}

impl Default for CogVideoXFunRequest {
    fn default() -> Self {
        Self {
            input_video: None,
            seed: 0,
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 512,
            height: 320,
            fps: 15,
            guidance_scale: 6.0,
            inference_steps: 50,
            use_dynamic_cfg: true,
            memory_optimization: MemoryMode::ExtremelyLowVram,
            vaeslicing: true,
            vaetiling: true,
        }
    }
}

impl CogVideoXFunRequest {
    fn sampling(&self) -> anyhow::Result<SamplingParams> {
        anyhow::ensure!(
            self.width > 0 && self.height > 0,
            "width and height must be positive"
        );
        anyhow::ensure!(self.fps > 0, "fps must be positive");
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

#[tracing::instrument(level = "info", skip_all, fields(seed = request.seed))]
pub async fn generate(generator: &Generator, request: CogVideoXFunRequest) -> Outcome {
    let loader = generator.loader.clone();
    let dir = generator.output_dir(TAB);
    generator
        .drive(TAB, |mut guard| async move {
            let params = request.sampling()?;
            let key = PipelineKey {
                kind: TAB.kind(),
                memory_mode: request.memory_optimization,
                variant: None,
            };
            let vae = VaeOptions {
                slicing: request.vaeslicing,
                tiling: request.vaetiling,
            };
            guard
                .acquire_with(loader.as_ref(), key, vae)
                .await?;

            let Some(input_video) = request.input_video else {
                anyhow::bail!("no input video was provided");
            };
            let (width, height, fps) = (request.width, request.height, request.fps);
            let use_dynamic_cfg = request.use_dynamic_cfg;

            let (guard, path) = run_blocking(TAB, guard, move |guard, progress| {
                let frames = load_frames(&input_video, width, height)?;
                tracing::info!("decoded {} control frames", frames.len());
                let input = GenerateInput {
                    params,
                    control: Some(ControlVideo {
                        frames,
                        use_dynamic_cfg,
                    }),
                };
                let media = guard.generate(&input, progress)?;
                save_media(&media, &dir, TAB.file_suffix(), fps)
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
