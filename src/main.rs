mod config;
mod error;
mod fanout;
mod history;
mod protocol;
mod routes;
mod session;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    http::{header, HeaderValue, Method},
    Extension, Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::{LiveSessions, Rooms};

const BODY_LIMIT: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg   = Arc::new(Config::from_env().context("loading configuration")?);
    let rooms = Rooms::new(cfg.history_limit, cfg.send_timeout);
    let live  = LiveSessions::default();

    let app = app(cfg.clone(), rooms, live);

    let listener = tokio::net::TcpListener::bind(cfg.addr())
        .await
        .with_context(|| format!("binding {}", cfg.addr()))?;
    info!("listening on {}", cfg.addr());
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    info!("server stopped");
    Ok(())
}

fn app(cfg: Arc<Config>, rooms: Rooms, live: LiveSessions) -> Router {
    routes::router()
        .layer(Extension(rooms))
        .layer(Extension(live))
        .layer(cors(&cfg))
        .layer(Extension(cfg))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
}

fn cors(cfg: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE]);
    if cfg.allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = cfg
        .allowed_origins
        .iter()
        .filter(|o| o.contains("://"))
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unusable CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
