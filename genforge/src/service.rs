use std::fmt;
use std::future::Future;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use async_trait::async_trait;
use genforge_ml::{GenerateInput, Media, MemoryMode, Pipeline};
use serde::Serialize;
use strum::Display;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Which pipeline family occupies the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum PipelineKind {
    #[strum(serialize = "Flex.1-alpha (GGUF)")]
    Flex1AlphaGguf,
    #[strum(serialize = "CogVideoX-Fun (control)")]
    CogVideoXFunControl,
}

/// Everything that decides whether a loaded pipeline can be reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PipelineKey {
    pub kind: PipelineKind,
    pub memory_mode: MemoryMode,
    /// Model variant, e.g. the GGUF file of a quantized transformer.
    pub variant: Option<String>,
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}", self.kind, self.memory_mode)?;
        if let Some(variant) = &self.variant {
            write!(f, ", {variant}")?;
        }
        write!(f, "]")
    }
}

/// Decode-stage toggles, reapplied on every acquire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaeOptions {
    pub slicing: bool,
    pub tiling: bool,
}

/// Builds pipelines for a key. The server uses candle; tests plug in fakes.
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(&self, key: &PipelineKey) -> anyhow::Result<Box<dyn Pipeline>>;
}

struct Slot {
    key: PipelineKey,
    pipeline: Box<dyn Pipeline>,
}

/// Owner of the single loaded pipeline and the process-wide busy flag.
#[derive(Default)]
pub struct InferenceService {
    busy: AtomicBool,
    slot: Arc<Mutex<Option<Slot>>>,
}

impl InferenceService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Claim the service for one generation, or `None` if another is in flight.
    pub fn try_begin(self: &Arc<Self>) -> Option<InferenceGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        match self.slot.clone().try_lock_owned() {
            Ok(slot) => Some(InferenceGuard {
                service: self.clone(),
                slot: Some(slot),
            }),
            Err(_) => {
                self.busy.store(false, Ordering::Release);
                None
            }
        }
    }
}

/// Exclusive access to the pipeline slot. Dropping it ends the generation.
pub struct InferenceGuard {
    service: Arc<InferenceService>,
    slot: Option<OwnedMutexGuard<Option<Slot>>>,
}

impl InferenceGuard {
    fn slot(&mut self) -> anyhow::Result<&mut Option<Slot>> {
        self.slot
            .as_deref_mut()
            .context("inference guard has already been released")
    }

    /// Key of the currently loaded pipeline, if any.
    pub fn loaded(&self) -> Option<&PipelineKey> {
        self.slot
            .as_deref()
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.key)
    }

    /// Return the pipeline for `key`, reusing the loaded one when the keys
    /// match. Otherwise the loaded pipeline is dropped before `build` runs,
    /// and the slot stays empty if `build` fails.
    pub async fn acquire<F, Fut>(
        &mut self,
        key: PipelineKey,
        vae: VaeOptions,
        build: F,
    ) -> anyhow::Result<&mut dyn Pipeline>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Box<dyn Pipeline>>>,
    {
        let slot = self.slot()?;

        if slot.as_ref().is_some_and(|loaded| loaded.key == key) {
            tracing::info!(%key, "reusing loaded pipeline");
        } else {
            if let Some(previous) = slot.take() {
                tracing::info!(key = %previous.key, "releasing pipeline");
                drop(previous);
            }
            tracing::info!(%key, "constructing pipeline");
            let pipeline = build().await?;
            *slot = Some(Slot { key, pipeline });
        }

        let loaded = slot.as_mut().context("pipeline slot is empty")?;
        loaded.pipeline.set_vae_slicing(vae.slicing);
        loaded.pipeline.set_vae_tiling(vae.tiling);
        Ok(loaded.pipeline.as_mut())
    }

    /// [`acquire`](Self::acquire) through a [`PipelineLoader`].
    pub async fn acquire_with(
        &mut self,
        loader: &dyn PipelineLoader,
        key: PipelineKey,
        vae: VaeOptions,
    ) -> anyhow::Result<&mut dyn Pipeline> {
        let build_key = key.clone();
        self.acquire(key, vae, || async move { loader.load(&build_key).await })
            .await
    }

    /// Run the loaded pipeline. Blocking; call from `spawn_blocking`.
    pub fn generate(
        &mut self,
        input: &GenerateInput,
        progress: &mut dyn FnMut(usize, usize),
    ) -> anyhow::Result<Media> {
        let loaded = self
            .slot()?
            .as_mut()
            .context("no pipeline has been acquired")?;
        loaded.pipeline.generate(input, progress)
    }

    /// Release now instead of at the end of scope.
    pub fn end(self) {}
}

impl Drop for InferenceGuard {
    fn drop(&mut self) {
        // Unlock the slot first so the next `try_begin` never sees it held.
        self.slot.take();
        self.service.busy.store(false, Ordering::Release);
    }
}
