use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::tabs::Tab;

/// One denoising step finished. Streamed to the UI as an SSE event.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationProgress {
    pub tab: Tab,
    pub step: usize,
    pub total: usize,
    pub fraction: f32,
    pub description: String,
}

impl GenerationProgress {
    pub fn new(tab: Tab, step: usize, total: usize) -> Self {
        Self {
            tab,
            step,
            total,
            fraction: fraction(step, total),
            description: format!("Generating {} (Step {step}/{total})", tab.media_noun()),
        }
    }
}

static PROGRESS_TX: Lazy<broadcast::Sender<GenerationProgress>> =
    Lazy::new(|| broadcast::channel(256).0);

pub fn subscribe() -> broadcast::Receiver<GenerationProgress> {
    PROGRESS_TX.subscribe()
}

pub(crate) fn emit(progress: GenerationProgress) {
    tracing::debug!("{}", progress.description);
    let _ = PROGRESS_TX.send(progress);
}

fn fraction(step: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (step as f32 / total as f32).clamp(0.0, 1.0)
}
