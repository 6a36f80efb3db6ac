use clap::Parser;
use genforge_ml::{
    GenerateInput, Media, MemoryMode, Pipeline, SamplingParams, device, flux::Flex1Alpha,
};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    prompt: String,

    #[arg(long, default_value = "")]
    negative_prompt: String,

    #[arg(short, long, value_name = "FILE")]
    output: String,

    #[arg(long, default_value = "Flex.1-alpha-Q6_K.gguf")]
    gguf: String,

    #[arg(long, default_value_t = MemoryMode::LowVram)]
    memory_mode: MemoryMode,

    #[arg(long, default_value_t = 1024)]
    width: usize,

    #[arg(long, default_value_t = 1024)]
    height: usize,

    #[arg(long, default_value_t = 1.0)]
    guidance: f64,

    #[arg(long, default_value_t = 20)]
    steps: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = false)]
    no_vae_tiling: bool,

    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let device = device(cli.cpu)?;
    let mut model = Flex1Alpha::load(&cli.gguf, cli.memory_mode, device).await?;
    model.set_vae_slicing(true);
    model.set_vae_tiling(!cli.no_vae_tiling);

    let input = GenerateInput::text(SamplingParams {
        prompt: cli.prompt,
        negative_prompt: cli.negative_prompt,
        width: cli.width,
        height: cli.height,
        guidance_scale: cli.guidance,
        steps: cli.steps,
        seed: cli.seed,
    });
    let media = model.generate(&input, &mut |step, total| {
        tracing::info!("step {step}/{total}");
    })?;

    match media {
        Media::Images(images) => {
            if let Some(image) = images.first() {
                image.save(&cli.output)?;
            }
        }
        Media::Video(_) => anyhow::bail!("unexpected video output"),
    }

    Ok(())
}
