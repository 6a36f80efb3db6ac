use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How aggressively a pipeline trades latency for peak device memory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum MemoryMode {
    /// Everything stays resident on the accelerator.
    #[strum(serialize = "No optimization")]
    #[serde(rename = "No optimization")]
    NoOptimization,
    /// Idle submodules live in host memory.
    #[strum(serialize = "Low VRAM")]
    #[serde(rename = "Low VRAM")]
    LowVram,
    /// Submodules are built for each use and dropped right after.
    #[strum(serialize = "Extremely Low VRAM")]
    #[serde(rename = "Extremely Low VRAM")]
    ExtremelyLowVram,
}

/// Sampling parameters shared by every pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub guidance_scale: f64,
    pub steps: usize,
    pub seed: u64,
}

/// A control video already decoded to frames at the requested geometry.
#[derive(Debug, Clone)]
pub struct ControlVideo {
    pub frames: Vec<RgbImage>,
    pub use_dynamic_cfg: bool,
}

#[derive(Debug, Clone)]
pub struct GenerateInput {
    pub params: SamplingParams,
    pub control: Option<ControlVideo>,
}

impl GenerateInput {
    pub fn text(params: SamplingParams) -> Self {
        Self {
            params,
            control: None,
        }
    }
}

/// What a pipeline produced.
#[derive(Debug, Clone)]
pub enum Media {
    Images(Vec<RgbImage>),
    Video(Vec<RgbImage>),
}

/// A constructed, ready-to-run generation pipeline.
///
/// `progress` is invoked as `(step, total)` after each denoising step.
pub trait Pipeline: Send {
    fn set_vae_slicing(&mut self, enabled: bool);

    fn set_vae_tiling(&mut self, enabled: bool);

    fn generate(
        &mut self,
        input: &GenerateInput,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Media>;
}
