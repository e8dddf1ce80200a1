//! HLS file server
//!
//! Serves the segment directory over HTTP with playlist/segment content
//! types, permissive CORS for browser and receiver players, and no caching
//! since the live playlist is rewritten every segment.

use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::Response,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Content type for the HLS file types, by extension
pub fn hls_content_type(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
    match ext.as_str() {
        "m3u8" => Some("application/vnd.apple.mpegurl"),
        "ts" => Some("video/mp2t"),
        "vtt" => Some("text/vtt"),
        _ => None,
    }
}

async fn force_content_type(req: Request, next: Next) -> Response {
    let content_type = hls_content_type(req.uri().path());
    let mut res = next.run(req).await;
    if let Some(ct) = content_type {
        if res.status().is_success() {
            res.headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(ct));
        }
    }
    res
}

/// Router serving `dir`
pub fn router(dir: impl Into<PathBuf>) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(dir.into()))
        .layer(middleware::from_fn(force_content_type))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static(NO_CACHE),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until SIGTERM or Ctrl-C
pub async fn serve(dir: PathBuf, host: &str, port: u16) -> Result<()> {
    let host = if host.trim().is_empty() { "0.0.0.0" } else { host.trim() };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    let addr = listener.local_addr()?;

    info!(dir = %dir.display(), %addr, "HLS server listening");

    axum::serve(listener, router(dir))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HLS server error")?;

    info!("HLS server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
