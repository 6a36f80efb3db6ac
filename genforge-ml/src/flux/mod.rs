//! Flex.1-alpha: a Flux-architecture text-to-image model with an 8-block
//! double-stream trunk, run here from a GGUF-quantized transformer.

mod text;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::flux::{self, WithForward};
use candle_transformers::quantized_var_builder;
use image::RgbImage;

use crate::hf_hub::{HubFile, hf_download};
use crate::loading::{mmaped_var_builder, sharded_safetensors};
use crate::pipeline::{GenerateInput, Media, MemoryMode, Pipeline, SamplingParams};
use crate::rng::seeded_randn;
use crate::vae::{VaeTiling, decode_latents};

use text::TextEncoders;

pub const BASE_REPO: &str = "ostris/Flex.1-alpha";
pub const GGUF_REPO: &str = "hum-ma/Flex.1-alpha-GGUF";

const MAX_SEQUENCE_LENGTH: usize = 512;

const CLIP_WEIGHTS: HubFile = HubFile::new(BASE_REPO, "text_encoder/model.safetensors");
const T5_CONFIG: HubFile = HubFile::new(BASE_REPO, "text_encoder_2/config.json");
const CLIP_TOKENIZER: HubFile = HubFile::new("openai/clip-vit-large-patch14", "tokenizer.json");
const T5_TOKENIZER: HubFile = HubFile::new("lmz/mt5-tokenizers", "t5-v1_1-xxl.tokenizer.json");
const AUTOENCODER: HubFile = HubFile::new("black-forest-labs/FLUX.1-schnell", "ae.safetensors");

fn transformer_config() -> flux::model::Config {
    flux::model::Config {
        depth: 8,
        depth_single_blocks: 38,
        guidance_embed: true,
        ..flux::model::Config::dev()
    }
}

/// On-disk locations of everything the pipeline needs.
#[derive(Debug, Clone)]
pub struct Flex1AlphaAssets {
    pub transformer: PathBuf,
    pub t5_weights: Vec<PathBuf>,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
    pub clip_weights: PathBuf,
    pub clip_tokenizer: PathBuf,
    pub autoencoder: PathBuf,
}

impl Flex1AlphaAssets {
    /// Resolve (downloading when missing) the base model plus the `gguf_file` transformer.
    pub async fn resolve(gguf_file: &str) -> Result<Self> {
        Ok(Self {
            transformer: hf_download(GGUF_REPO, gguf_file)
                .await
                .with_context(|| format!("failed to fetch transformer {gguf_file}"))?,
            t5_weights: sharded_safetensors(BASE_REPO, "text_encoder_2").await?,
            t5_config: T5_CONFIG.fetch().await?,
            t5_tokenizer: T5_TOKENIZER.fetch().await?,
            clip_weights: CLIP_WEIGHTS.fetch().await?,
            clip_tokenizer: CLIP_TOKENIZER.fetch().await?,
            autoencoder: AUTOENCODER.fetch().await?,
        })
    }
}

pub async fn prefetch(gguf_file: &str) -> Result<()> {
    Flex1AlphaAssets::resolve(gguf_file).await?;
    Ok(())
}

fn load_autoencoder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<flux::autoencoder::AutoEncoder> {
    let vb = mmaped_var_builder(&[path.to_path_buf()], dtype, device)?;
    let vae = flux::autoencoder::AutoEncoder::new(&flux::autoencoder::Config::schnell(), vb)?;
    Ok(vae)
}

/// Flux needs both sides to be a multiple of 16; round down like diffusers does.
fn snap_to_16(value: usize) -> usize {
    (value / 16).max(1) * 16
}

pub struct Flex1Alpha {
    device: Device,
    dtype: DType,
    memory_mode: MemoryMode,
    assets: Flex1AlphaAssets,
    text: Option<TextEncoders>,
    transformer: flux::quantized_model::Flux,
    vae: Option<flux::autoencoder::AutoEncoder>,
    vae_slicing: bool,
    vae_tiling: bool,
}

impl Flex1Alpha {
    pub async fn load(gguf_file: &str, memory_mode: MemoryMode, device: Device) -> Result<Self> {
        let assets = Flex1AlphaAssets::resolve(gguf_file).await?;
        Self::from_assets(assets, memory_mode, device)
    }

    #[tracing::instrument(level = "info", skip(assets))]
    pub fn from_assets(assets: Flex1AlphaAssets, memory_mode: MemoryMode, device: Device) -> Result<Self> {
        let dtype = device.bf16_default_to_f32();

        let text = match memory_mode {
            MemoryMode::NoOptimization => Some(TextEncoders::load(&assets, &device)?),
            MemoryMode::LowVram => Some(TextEncoders::load(&assets, &Device::Cpu)?),
            MemoryMode::ExtremelyLowVram => None,
        };

        let vb = quantized_var_builder::VarBuilder::from_gguf(&assets.transformer, &device)
            .with_context(|| format!("failed to read {}", assets.transformer.display()))?;
        let transformer = flux::quantized_model::Flux::new(&transformer_config(), vb)?;

        let vae = match memory_mode {
            MemoryMode::ExtremelyLowVram => None,
            _ => Some(load_autoencoder(&assets.autoencoder, dtype, &device)?),
        };

        Ok(Self {
            device,
            dtype,
            memory_mode,
            assets,
            text,
            transformer,
            vae,
            vae_slicing: false,
            vae_tiling: false,
        })
    }

    fn encode_prompt(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let (t5_emb, clip_emb) = match self.text.as_mut() {
            Some(text) => text.encode(prompt, MAX_SEQUENCE_LENGTH)?,
            None => TextEncoders::load(&self.assets, &Device::Cpu)?.encode(prompt, MAX_SEQUENCE_LENGTH)?,
        };
        Ok((t5_emb.to_device(&self.device)?, clip_emb.to_device(&self.device)?))
    }

    fn denoise(
        &self,
        state: &flux::sampling::State,
        timesteps: &[f64],
        guidance: f64,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Tensor> {
        let b_sz = state.img.dim(0)?;
        let dev = state.img.device();
        let guidance = Tensor::full(guidance as f32, b_sz, dev)?;
        let total = timesteps.len().saturating_sub(1);

        let mut img = state.img.clone();
        for (step, window) in timesteps.windows(2).enumerate() {
            let (t_curr, t_prev) = (window[0], window[1]);
            let t_vec = Tensor::full(t_curr as f32, b_sz, dev)?;
            let pred = self.transformer.forward(
                &img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                Some(&guidance),
            )?;
            img = (img + pred * (t_prev - t_curr))?;
            progress(step + 1, total);
        }
        Ok(img)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let tiling = self.vae_tiling.then(VaeTiling::default);
        let decoded = match &self.vae {
            Some(vae) => decode_latents(latents, self.vae_slicing, tiling.as_ref(), |z| vae.decode(z))?,
            None => {
                let vae = load_autoencoder(&self.assets.autoencoder, self.dtype, &self.device)?;
                decode_latents(latents, self.vae_slicing, tiling.as_ref(), |z| vae.decode(z))?
            }
        };
        Ok(decoded)
    }

    fn sample(&mut self, params: &SamplingParams, progress: &mut dyn FnMut(usize, usize)) -> Result<RgbImage> {
        let width = snap_to_16(params.width);
        let height = snap_to_16(params.height);
        if (width, height) != (params.width, params.height) {
            tracing::warn!(
                "{}x{} is not a multiple of 16, generating {width}x{height} instead",
                params.width,
                params.height
            );
        }
        if !params.negative_prompt.is_empty() {
            tracing::debug!("negative prompt is ignored by guidance-distilled Flux models");
        }

        let (t5_emb, clip_emb) = self.encode_prompt(&params.prompt)?;
        let noise = seeded_randn(
            params.seed,
            (1, 16, height.div_ceil(16) * 2, width.div_ceil(16) * 2),
            &self.device,
        )?;
        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = flux::sampling::get_schedule(params.steps, Some((state.img.dim(1)?, 0.5, 1.15)));

        let latents = self.denoise(&state, &timesteps, params.guidance_scale, progress)?;
        let latents = flux::sampling::unpack(&latents, height, width)?.to_dtype(self.dtype)?;
        let decoded = self.decode(&latents)?;

        to_rgb_image(&decoded.i(0)?)
    }
}

impl Pipeline for Flex1Alpha {
    fn set_vae_slicing(&mut self, enabled: bool) {
        self.vae_slicing = enabled;
    }

    fn set_vae_tiling(&mut self, enabled: bool) {
        self.vae_tiling = enabled;
    }

    fn generate(&mut self, input: &GenerateInput, progress: &mut dyn FnMut(usize, usize)) -> Result<Media> {
        anyhow::ensure!(input.control.is_none(), "Flex.1-alpha does not take a control video");
        tracing::info!(memory_mode = %self.memory_mode, "sampling Flex.1-alpha");

        let image = self.sample(&input.params, progress)?;
        Ok(Media::Images(vec![image]))
    }
}

/// Convert a decoded (3, h, w) sample in `[-1, 1]` into an RGB image.
pub(crate) fn to_rgb_image(sample: &Tensor) -> Result<RgbImage> {
    let sample = ((sample.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .to_dtype(DType::U8)?;
    let (channels, height, width) = sample.dims3()?;
    anyhow::ensure!(channels == 3, "expected 3 channels in output, got {channels}");

    let raw: Vec<u8> = sample.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;
    RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| anyhow::anyhow!("failed to create image buffer from model output"))
}
