#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
    mpsc,
};
use std::time::Duration;

use async_trait::async_trait;
use genforge::service::{InferenceService, PipelineKey, PipelineLoader};
use genforge::tabs::Generator;
use genforge_ml::{GenerateInput, Media, Pipeline};
use image::RgbImage;

/// Counts constructions and drops, and records VAE toggles and control inputs.
#[derive(Default)]
pub struct Counters {
    pub constructed: AtomicUsize,
    pub dropped: AtomicUsize,
    pub alive: AtomicUsize,
    pub max_alive: AtomicUsize,
    pub controls: Mutex<Vec<ControlRecord>>,
    pub vae: Mutex<Vec<(usize, bool, bool)>>,
    pub keys: Mutex<Vec<PipelineKey>>,
}

impl Counters {
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Most pipelines that ever existed at the same time.
    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }

    pub fn last_vae(&self) -> Option<(usize, bool, bool)> {
        self.vae.lock().ok().and_then(|vae| vae.last().copied())
    }
}

/// What a pipeline saw of its control video.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRecord {
    pub frames: usize,
    pub frame_size: (u32, u32),
    pub use_dynamic_cfg: bool,
}

pub struct FakePipeline {
    pub id: usize,
    counters: Arc<Counters>,
    gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
    slicing: bool,
    tiling: bool,
}

impl FakePipeline {
    fn record_vae(&self) {
        if let Ok(mut vae) = self.counters.vae.lock() {
            vae.push((self.id, self.slicing, self.tiling));
        }
    }
}

impl Pipeline for FakePipeline {
    fn set_vae_slicing(&mut self, enabled: bool) {
        self.slicing = enabled;
        self.record_vae();
    }

    fn set_vae_tiling(&mut self, enabled: bool) {
        self.tiling = enabled;
        self.record_vae();
    }

    fn generate(
        &mut self,
        input: &GenerateInput,
        progress: &mut dyn FnMut(usize, usize),
    ) -> anyhow::Result<Media> {
        if let Some(gate) = &self.gate {
            let gate = gate.lock().map_err(|_| anyhow::anyhow!("gate poisoned"))?;
            gate.recv_timeout(Duration::from_secs(30))?;
        }
        let params = &input.params;
        for step in 1..=params.steps {
            progress(step, params.steps);
        }
        let frame = RgbImage::new(params.width as u32, params.height as u32);
        let Some(control) = &input.control else {
            return Ok(Media::Images(vec![frame]));
        };
        if let Ok(mut controls) = self.counters.controls.lock() {
            controls.push(ControlRecord {
                frames: control.frames.len(),
                frame_size: control
                    .frames
                    .first()
                    .map(|f| f.dimensions())
                    .unwrap_or_default(),
                use_dynamic_cfg: control.use_dynamic_cfg,
            });
        }
        Ok(Media::Video(vec![frame; control.frames.len()]))
    }
}

impl Drop for FakePipeline {
    fn drop(&mut self) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
        self.counters.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builds [`FakePipeline`]s; variants containing "broken" fail to construct.
#[derive(Default, Clone)]
pub struct FakeLoader {
    pub counters: Arc<Counters>,
    gate: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
    load_time: Option<Duration>,
}

impl FakeLoader {
    /// Pipelines block in `generate` until the returned sender fires.
    pub fn gated() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let loader = Self {
            counters: Arc::default(),
            gate: Some(Arc::new(Mutex::new(rx))),
            load_time: None,
        };
        (loader, tx)
    }

    /// Construction sleeps on the blocking pool, like reading real weights.
    pub fn slow(load_time: Duration) -> Self {
        Self {
            load_time: Some(load_time),
            ..Self::default()
        }
    }

    pub fn build(&self, key: &PipelineKey) -> anyhow::Result<Box<dyn Pipeline>> {
        if key
            .variant
            .as_deref()
            .is_some_and(|variant| variant.contains("broken"))
        {
            anyhow::bail!("cannot construct {key}");
        }
        let id = self.counters.constructed.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = self.counters.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_alive.fetch_max(alive, Ordering::SeqCst);
        if let Ok(mut keys) = self.counters.keys.lock() {
            keys.push(key.clone());
        }
        Ok(Box::new(FakePipeline {
            id,
            counters: self.counters.clone(),
            gate: self.gate.clone(),
            slicing: false,
            tiling: false,
        }))
    }
}

#[async_trait]
impl PipelineLoader for FakeLoader {
    async fn load(&self, key: &PipelineKey) -> anyhow::Result<Box<dyn Pipeline>> {
        let Some(load_time) = self.load_time else {
            return self.build(key);
        };
        let (loader, key) = (self.clone(), key.clone());
        tokio::task::spawn_blocking(move || {
            std::thread::sleep(load_time);
            loader.build(&key)
        })
        .await?
    }
}

pub fn generator(loader: FakeLoader, output_root: &std::path::Path) -> (Generator, Arc<Counters>) {
    let counters = loader.counters.clone();
    let generator = Generator::new(InferenceService::new(), Arc::new(loader), output_root);
    (generator, counters)
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
