use anyhow::Result;
use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use rust_embed::Embed;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::{app::AppResources, endpoints::*};

#[derive(Embed)]
#[folder = "ui"]
struct EmbeddedUi;

async fn serve_embedded(uri: Uri) -> impl IntoResponse {
    let path = uri.path();
    let target = if path == "/" {
        "index.html"
    } else {
        path.trim_start_matches('/')
    };

    embedded_response(target)
        .or_else(|| embedded_response("index.html"))
        .unwrap_or_else(|| (StatusCode::NOT_FOUND, "Not Found").into_response())
}

fn embedded_response(path: &str) -> Option<Response> {
    let asset = EmbeddedUi::get(path)?;
    let mime = asset.metadata.mimetype();
    let mut response = Response::new(Body::from(asset.data.into_owned()));
    if let Ok(ct) = HeaderValue::from_str(mime) {
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    Some(response)
}

pub fn build_router(state: AppResources) -> Router {
    let outputs = ServeDir::new(&state.generator.output_root);

    Router::new()
        .route("/api/app_version", get(app_version).post(app_version))
        .route("/api/device", get(device).post(device))
        .route("/api/busy", get(busy))
        .route("/api/random_seed", get(random_seed).post(random_seed))
        .route("/api/tabs", get(list_tabs))
        .route("/api/state/{tab}", get(get_state).post(save_state))
        .route("/api/upload", post(upload))
        .route("/api/t2i/flex1_alpha_gguf", post(generate_flex1_alpha))
        .route("/api/v2v/cogvideox155b_f2v", post(generate_cogvideox))
        .route("/api/progress", get(progress_events))
        .nest_service("/output", outputs)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024 * 1024))
        .layer(CorsLayer::very_permissive())
        .fallback(serve_embedded)
}

pub async fn serve_with_listener(listener: TcpListener, resources: AppResources) -> Result<()> {
    let router = build_router(resources);
    tracing::info!("HTTP server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
