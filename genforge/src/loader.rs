use anyhow::Context;
use async_trait::async_trait;
use genforge_ml::{
    Pipeline, cogvideox, device,
    flux::{Flex1Alpha, Flex1AlphaAssets},
};

use crate::service::{PipelineKey, PipelineKind, PipelineLoader};

/// Loads pipelines with candle on the selected device.
pub struct CandleLoader {
    cpu: bool,
}

impl CandleLoader {
    pub fn new(cpu: bool) -> Self {
        Self { cpu }
    }
}

#[async_trait]
impl PipelineLoader for CandleLoader {
    #[tracing::instrument(level = "info", skip(self), fields(key = %key))]
    async fn load(&self, key: &PipelineKey) -> anyhow::Result<Box<dyn Pipeline>> {
        let device = device(self.cpu)?;
        match key.kind {
            PipelineKind::Flex1AlphaGguf => {
                let gguf_file = key
                    .variant
                    .as_deref()
                    .context("Flex.1-alpha needs a GGUF file")?;
                let assets = Flex1AlphaAssets::resolve(gguf_file).await?;
                let memory_mode = key.memory_mode;
                // Reading and uploading weights blocks for a while.
                let pipeline = tokio::task::spawn_blocking(move || {
                    Flex1Alpha::from_assets(assets, memory_mode, device)
                })
                .await??;
                Ok(Box::new(pipeline))
            }
            PipelineKind::CogVideoXFunControl => cogvideox::load(key.memory_mode, &device).await,
        }
    }
}
