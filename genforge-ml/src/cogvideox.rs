//! CogVideoX-Fun V1.1 5B with pose control.
//!
//! Offload granularity for this kind: `LowVram` keeps idle components on the
//! host between stages, `ExtremelyLowVram` moves them one submodule at a time.

use anyhow::Result;
use candle_core::Device;

use crate::pipeline::{MemoryMode, Pipeline};

pub const REPO: &str = "alibaba-pai/CogVideoX-Fun-V1.1-5b-Pose";

/// Construct the control-video pipeline.
///
/// candle ships no CogVideoX 3D transformer or causal video VAE, so this
/// always fails with a construction error and the caller's slot stays empty.
#[tracing::instrument(level = "info")]
pub async fn load(memory_mode: MemoryMode, device: &Device) -> Result<Box<dyn Pipeline>> {
    anyhow::bail!(
        "{REPO} cannot be constructed: no CogVideoX transformer backend is available for {memory_mode} on {device:?}"
    )
}
