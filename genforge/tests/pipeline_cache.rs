mod common;

use common::FakeLoader;
use genforge::service::{InferenceService, PipelineKey, PipelineKind, VaeOptions};
use genforge_ml::MemoryMode;

fn flex_key(memory_mode: MemoryMode, gguf: &str) -> PipelineKey {
    PipelineKey {
        kind: PipelineKind::Flex1AlphaGguf,
        memory_mode,
        variant: Some(gguf.to_string()),
    }
}

const VAE: VaeOptions = VaeOptions {
    slicing: true,
    tiling: true,
};

#[tokio::test]
async fn matching_keys_reuse_the_loaded_pipeline() -> anyhow::Result<()> {
    let loader = FakeLoader::default();
    let service = InferenceService::new();
    let key = flex_key(MemoryMode::LowVram, "Flex.1-alpha-Q6_K.gguf");

    for _ in 0..3 {
        let mut guard = service.try_begin().ok_or_else(|| anyhow::anyhow!("busy"))?;
        guard.acquire_with(&loader, key.clone(), VAE).await?;
        assert_eq!(guard.loaded(), Some(&key));
    }

    assert_eq!(loader.counters.constructed(), 1);
    assert_eq!(loader.counters.dropped(), 0);
    Ok(())
}

#[tokio::test]
async fn changed_memory_mode_or_variant_rebuilds_and_releases() -> anyhow::Result<()> {
    let loader = FakeLoader::default();
    let service = InferenceService::new();

    let keys = [
        flex_key(MemoryMode::LowVram, "Flex.1-alpha-Q6_K.gguf"),
        flex_key(MemoryMode::NoOptimization, "Flex.1-alpha-Q6_K.gguf"),
        flex_key(MemoryMode::NoOptimization, "Flex.1-alpha-Q4_0.gguf"),
        PipelineKey {
            kind: PipelineKind::CogVideoXFunControl,
            memory_mode: MemoryMode::NoOptimization,
            variant: None,
        },
    ];

    for (i, key) in keys.iter().enumerate() {
        let mut guard = service.try_begin().ok_or_else(|| anyhow::anyhow!("busy"))?;
        guard.acquire_with(&loader, key.clone(), VAE).await?;
        assert_eq!(loader.counters.constructed(), i + 1);
        // The previous instance is gone before the next one exists.
        assert_eq!(loader.counters.dropped(), i);
    }
    Ok(())
}

#[tokio::test]
async fn old_instance_is_released_before_construction() -> anyhow::Result<()> {
    let loader = FakeLoader::default();
    let service = InferenceService::new();

    let mut guard = service.try_begin().ok_or_else(|| anyhow::anyhow!("busy"))?;
    guard
        .acquire_with(&loader, flex_key(MemoryMode::LowVram, "a.gguf"), VAE)
        .await?;

    let counters = loader.counters.clone();
    guard
        .acquire(flex_key(MemoryMode::LowVram, "b.gguf"), VAE, || async {
            assert_eq!(counters.dropped(), 1, "old pipeline still alive during build");
            loader.build(&flex_key(MemoryMode::LowVram, "b.gguf"))
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn vae_toggles_are_reapplied_on_hits() -> anyhow::Result<()> {
    let loader = FakeLoader::default();
    let service = InferenceService::new();
    let key = flex_key(MemoryMode::LowVram, "Flex.1-alpha-Q6_K.gguf");

    let mut guard = service.try_begin().ok_or_else(|| anyhow::anyhow!("busy"))?;
    guard.acquire_with(&loader, key.clone(), VAE).await?;
    assert_eq!(loader.counters.last_vae(), Some((1, true, true)));

    let off = VaeOptions {
        slicing: false,
        tiling: false,
    };
    guard.acquire_with(&loader, key, off).await?;
    assert_eq!(loader.counters.last_vae(), Some((1, false, false)));
    assert_eq!(loader.counters.constructed(), 1);
    Ok(())
}

#[tokio::test]
async fn failed_construction_leaves_the_slot_empty() -> anyhow::Result<()> {
    let loader = FakeLoader::default();
    let service = InferenceService::new();
    let good = flex_key(MemoryMode::LowVram, "Flex.1-alpha-Q6_K.gguf");

    {
        let mut guard = service.try_begin().ok_or_else(|| anyhow::anyhow!("busy"))?;
        guard.acquire_with(&loader, good.clone(), VAE).await?;

        let result = guard
            .acquire_with(&loader, flex_key(MemoryMode::LowVram, "broken.gguf"), VAE)
            .await;
        assert!(result.is_err());
        assert_eq!(guard.loaded(), None);
        assert_eq!(loader.counters.dropped(), 1);
    }
    assert!(!service.is_busy());

    let mut guard = service.try_begin().ok_or_else(|| anyhow::anyhow!("busy"))?;
    guard.acquire_with(&loader, good, VAE).await?;
    assert_eq!(loader.counters.constructed(), 2);
    Ok(())
}

#[tokio::test]
async fn rejected_begin_cannot_reach_the_slot() -> anyhow::Result<()> {
    let service = InferenceService::new();
    let guard = service.try_begin();
    assert!(guard.is_some());
    assert!(service.try_begin().is_none());
    drop(guard);
    assert!(service.try_begin().is_some());
    Ok(())
}
