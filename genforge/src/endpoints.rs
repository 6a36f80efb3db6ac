use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use axum::{
    Json,
    extract::{self, Multipart, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::{
    app::AppResources,
    output::timestamped_path,
    progress,
    result::{ApiError, Result},
    seed,
    tabs::{
        self, Outcome, Tab, TabDescriptor,
        cogvideox::{self, CogVideoXFunRequest},
        flex1_alpha::{self, Flex1AlphaRequest},
    },
    version,
};

pub async fn app_version() -> Json<&'static str> {
    Json(version::current())
}

pub async fn device(State(state): State<AppResources>) -> Json<String> {
    Json(state.device.to_string())
}

pub async fn busy(State(state): State<AppResources>) -> Json<bool> {
    Json(state.generator.service.is_busy())
}

pub async fn random_seed() -> Json<u32> {
    Json(seed::random_seed())
}

pub async fn list_tabs() -> Result<Json<Vec<TabDescriptor>>> {
    Ok(Json(tabs::describe()?))
}

pub async fn get_state(
    State(state): State<AppResources>,
    extract::Path(tab): extract::Path<String>,
) -> Result<Json<Option<serde_json::Value>>> {
    let tab = Tab::from_str(&tab)?;
    Ok(Json(state.tab_states.get(&tab.to_string()).await))
}

pub async fn save_state(
    State(state): State<AppResources>,
    extract::Path(tab): extract::Path<String>,
    Json(value): Json<serde_json::Value>,
) -> Result<Json<()>> {
    let tab = Tab::from_str(&tab)?;
    state.tab_states.save(&tab.to_string(), value).await?;
    Ok(Json(()))
}

/// A driver outcome plus the URL the output is served under.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub outcome: Outcome,
    pub url: Option<String>,
}

fn output_url(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(format!("/output/{}", parts.join("/")))
}

fn respond(state: &AppResources, outcome: Outcome) -> Json<GenerateResponse> {
    let url = outcome
        .output()
        .and_then(|output| output_url(&state.generator.output_root, &output.path));
    Json(GenerateResponse { outcome, url })
}

pub async fn generate_flex1_alpha(
    State(state): State<AppResources>,
    Json(request): Json<Flex1AlphaRequest>,
) -> Json<GenerateResponse> {
    let outcome = flex1_alpha::generate(&state.generator, request).await;
    respond(&state, outcome)
}

pub async fn generate_cogvideox(
    State(state): State<AppResources>,
    Json(request): Json<CogVideoXFunRequest>,
) -> Json<GenerateResponse> {
    let outcome = cogvideox::generate(&state.generator, request).await;
    respond(&state, outcome)
}

/// Store an uploaded control video and return its server-side path.
pub async fn upload(
    State(state): State<AppResources>,
    mut multipart: Multipart,
) -> Result<Json<PathBuf>> {
    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field
            .file_name()
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_string_lossy().into_owned())
        else {
            continue;
        };
        let bytes = field.bytes().await?;
        let path = timestamped_path(&state.uploads, &name)?;
        tokio::fs::write(&path, &bytes).await?;
        tracing::info!("received upload {} ({} bytes)", path.display(), bytes.len());
        return Ok(Json(path));
    }
    Err(ApiError::NotFound("file field".to_string()))
}

pub async fn progress_events() -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let mut rx = progress::subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(progress) => match Event::default().event("progress").json_data(&progress) {
                    Ok(event) => yield Ok(event),
                    Err(err) => tracing::warn!("cannot encode progress event: {err}"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("progress stream skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
