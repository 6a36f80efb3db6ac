use std::sync::Arc;

use genforge::loader::CandleLoader;
use genforge::output::is_output_name;
use genforge::service::InferenceService;
use genforge::tabs::{
    Generator, Outcome,
    cogvideox::{self, CogVideoXFunRequest},
    flex1_alpha::{self, Flex1AlphaRequest},
};

fn cpu_generator(root: &std::path::Path) -> Generator {
    Generator::new(InferenceService::new(), Arc::new(CandleLoader::new(true)), root)
}

#[tokio::test]
async fn cogvideox_construction_failure_is_a_failed_outcome() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let generator = cpu_generator(dir.path());

    let outcome = cogvideox::generate(
        &generator,
        CogVideoXFunRequest {
            input_video: Some(dir.path().join("pose.mp4")),
            ..Default::default()
        },
    )
    .await;

    let Outcome::Failed { error } = outcome else {
        anyhow::bail!("expected a failure, got {outcome:?}");
    };
    assert!(error.contains("CogVideoX-Fun"), "{error}");
    assert!(!generator.service.is_busy());
    assert!(!dir.path().join("v2v").exists());
    Ok(())
}

#[tokio::test]
#[ignore = "downloads the Flex.1-alpha weights"]
async fn flex1_alpha_end_to_end_on_cpu() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let generator = cpu_generator(dir.path());

    let outcome = flex1_alpha::generate(
        &generator,
        Flex1AlphaRequest {
            seed: 0,
            prompt: "a lighthouse at dusk".to_string(),
            width: 64,
            height: 64,
            inference_steps: 1,
            gguf: "Flex.1-alpha-Q3_K_S.gguf - 3.74 GB".to_string(),
            ..Default::default()
        },
    )
    .await;
    assert!(outcome.output().is_some(), "{outcome:?}");

    let files: Vec<_> = std::fs::read_dir(dir.path().join("t2i/Flex.1_alpha"))?
        .collect::<Result<_, _>>()?;
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().to_string_lossy().into_owned();
    assert!(is_output_name(&name, "flex1_alpha.png"), "{name}");
    Ok(())
}
