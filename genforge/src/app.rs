use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use genforge_ml::{DeviceName, device_name};
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tracing_subscriber::fmt::format::FmtSpan;

use crate::{
    loader::CandleLoader,
    server,
    service::InferenceService,
    settings::TabStateStore,
    tabs::{Generator, flex1_alpha},
};

fn resolve_app_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|path| path.join("genforge"))
        .unwrap_or(PathBuf::from("."))
}

static APP_ROOT: Lazy<PathBuf> = Lazy::new(resolve_app_root);
static MODEL_ROOT: Lazy<PathBuf> = Lazy::new(|| APP_ROOT.join("models"));

#[derive(Clone)]
pub struct AppResources {
    pub generator: Generator,
    pub tab_states: Arc<TabStateStore>,
    pub device: DeviceName,
    pub uploads: PathBuf,
}

#[derive(Parser)]
#[command(version = crate::version::APP_VERSION, about)]
struct Cli {
    #[arg(
        short,
        long,
        help = "Download the default Flex.1-alpha weights and exit",
        default_value_t = false
    )]
    download: bool,
    #[arg(
        long,
        help = "Force using CPU even if GPU is available",
        default_value_t = false
    )]
    cpu: bool,
    #[arg(
        short,
        long,
        value_name = "PORT",
        help = "Bind the HTTP server to a specific port",
        default_value_t = 7860
    )]
    port: u16,
    #[arg(long, value_name = "HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(
        long,
        value_name = "DIR",
        help = "Where generated media is written",
        default_value = "output"
    )]
    output_dir: PathBuf,
    #[arg(long, value_name = "DIR", help = "Model cache directory")]
    models_dir: Option<PathBuf>,
    #[arg(long, help = "Log at debug level", default_value_t = false)]
    debug: bool,
}

fn initialize(debug: bool, models_dir: Option<PathBuf>) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    // hook model cache dir
    genforge_ml::set_cache_dir(models_dir.unwrap_or_else(|| MODEL_ROOT.to_path_buf()))?;

    std::panic::set_hook(Box::new(|info| {
        tracing::error!("panic: {info}");
    }));

    Ok(())
}

async fn prefetch() -> Result<()> {
    let (gguf_file, _) = flex1_alpha::parse_gguf(flex1_alpha::DEFAULT_GGUF)?;
    genforge_ml::flux::prefetch(&gguf_file).await
}

fn build_resources(cpu: bool, output_dir: PathBuf) -> Result<AppResources> {
    let device = device_name(cpu);
    tracing::info!("inference device: {device}");

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let generator = Generator::new(
        InferenceService::new(),
        Arc::new(CandleLoader::new(cpu)),
        output_dir,
    );

    Ok(AppResources {
        generator,
        tab_states: Arc::new(TabStateStore::new(APP_ROOT.join("state.json"))),
        device,
        uploads: APP_ROOT.join("uploads"),
    })
}

pub async fn run() -> Result<()> {
    let Cli {
        download,
        cpu,
        port,
        host,
        output_dir,
        models_dir,
        debug,
    } = Cli::parse();

    initialize(debug, models_dir)?;

    if download {
        prefetch().await?;
        return Ok(());
    }

    let resources = build_resources(cpu, output_dir)?;
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    server::serve_with_listener(listener, resources).await
}
