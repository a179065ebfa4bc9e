use crate::cli::ServeArgs;
use crate::engine::Engine;
use crate::web::api::{download_handler, process_video_handler};
use crate::web::AppState;
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let origin: HeaderValue = origin
        .parse()
        .with_context(|| format!("invalid CORS origin {:?}", origin))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN])
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_DISPOSITION])
        .allow_credentials(true))
}

pub fn router(state: Arc<AppState>, cors: CorsLayer, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/process_video/", post(process_video_handler))
        .route("/download/:filename", get(download_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(args: ServeArgs) -> Result<()> {
    std::fs::create_dir_all(&args.upload_root)
        .with_context(|| format!("cannot create {}", args.upload_root.display()))?;
    std::fs::create_dir_all(&args.engine.results_root)
        .with_context(|| format!("cannot create {}", args.engine.results_root.display()))?;

    let engine = Engine::new(args.engine.clone())?;
    let state = Arc::new(AppState {
        engine,
        upload_root: args.upload_root.clone(),
    });

    let mut current_port = args.port;
    let listener = loop {
        let addr = SocketAddr::new(args.host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let app = router(
        state,
        cors_layer(&args.cors_origin)?,
        args.max_upload_mb * 1024 * 1024,
    );

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "presence-cut server started on http://{:?} (results in {})",
        tokio_listener.local_addr()?,
        args.engine.results_root.display()
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_rejects_malformed_origin() {
        assert!(cors_layer("http://localhost:3000").is_ok());
        assert!(cors_layer("bad\norigin").is_err());
    }
}
