use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::{clip, t5};
use tokenizers::Tokenizer;

use super::Flex1AlphaAssets;
use crate::loading::{mmaped_var_builder, read_json};

const CLIP_MAX_TOKENS: usize = 77;

/// The T5 and CLIP text encoders that condition the Flux transformer.
pub(crate) struct TextEncoders {
    device: Device,
    t5: t5::T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip: clip::text_model::ClipTextTransformer,
    clip_tokenizer: Tokenizer,
}

fn clip_config() -> clip::text_model::ClipTextConfig {
    clip::text_model::ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: clip::text_model::Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

impl TextEncoders {
    #[tracing::instrument(level = "info", skip(assets))]
    pub fn load(assets: &Flex1AlphaAssets, device: &Device) -> Result<Self> {
        let dtype = device.bf16_default_to_f32();

        let t5_config: t5::Config = read_json(&assets.t5_config)?;
        let vb = mmaped_var_builder(&assets.t5_weights, dtype, device)?;
        let t5 = t5::T5EncoderModel::load(vb, &t5_config)?;
        let t5_tokenizer = Tokenizer::from_file(&assets.t5_tokenizer).map_err(anyhow::Error::msg)?;

        let vb = mmaped_var_builder(std::slice::from_ref(&assets.clip_weights), dtype, device)?;
        let clip = clip::text_model::ClipTextTransformer::new(vb.pp("text_model"), &clip_config())?;
        let clip_tokenizer =
            Tokenizer::from_file(&assets.clip_tokenizer).map_err(anyhow::Error::msg)?;

        Ok(Self {
            device: device.clone(),
            t5,
            t5_tokenizer,
            clip,
            clip_tokenizer,
        })
    }

    /// Returns `(t5_embeddings, clip_pooled)` for `prompt`.
    pub fn encode(&mut self, prompt: &str, max_sequence_length: usize) -> Result<(Tensor, Tensor)> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(max_sequence_length, 0);
        let input_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5.forward(&input_ids)?;

        let tokens = clip_tokens(
            self.clip_tokenizer
                .encode(prompt, true)
                .map_err(anyhow::Error::msg)?
                .get_ids(),
        );
        let input_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip.forward(&input_ids)?;

        Ok((t5_emb.to_dtype(DType::F32)?, clip_emb.to_dtype(DType::F32)?))
    }
}

/// CLIP pools at the end-of-text token, so truncation must keep it last.
fn clip_tokens(ids: &[u32]) -> Vec<u32> {
    if ids.len() <= CLIP_MAX_TOKENS {
        return ids.to_vec();
    }
    let mut tokens = ids[..CLIP_MAX_TOKENS - 1].to_vec();
    tokens.extend(ids.last().copied());
    tokens
}
