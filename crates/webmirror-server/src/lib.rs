//! HTTP surface for the webmirror service: public launcher/resolve/mirror
//! routes plus the token-gated internal admin API.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Instant;
use webmirror_core::Error;
use webmirror_proxy::{
    AllowlistStore, FileCache, MirrorService, PipelineConfig, Registry, ReqwestFetcher,
};

pub mod admin;
pub mod config;
pub mod launcher;
pub mod routes;

pub use config::Config;

pub struct AppState {
    pub config: Config,
    pub service: Arc<MirrorService>,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire up registry, allowlist, cache and fetcher from configuration.
    pub fn build(config: Config) -> anyhow::Result<Self> {
        let registry = Registry::open(&config.db_path, config.log_file.clone())?;
        let allowlist = AllowlistStore::load(&config.allowlist_path)?;
        let cache = FileCache::new(
            &config.cache_dir,
            config.cache_ttl_seconds,
            config.cache_max_bytes,
        );
        let fetcher = ReqwestFetcher::new()?;
        let service = MirrorService::new(
            PipelineConfig {
                allow_http: config.enable_http,
                allow_private: config.unsafe_allow_private,
                upstream_timeout_ms: config.upstream_timeout_ms,
                max_html_bytes: config.max_html_bytes,
                max_binary_bytes: config.max_binary_bytes,
            },
            Arc::new(registry),
            Arc::new(allowlist),
            Arc::new(cache),
            Arc::new(fetcher),
            config.disable_service,
        );
        Ok(Self {
            config,
            service: Arc::new(service),
            started_at: Instant::now(),
        })
    }
}

/// Wire error: maps the core taxonomy to `{ok:false, error:<code>}` with the
/// matching status. Internal details go to the log, never to the client.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.0.status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }
        (
            status,
            Json(serde_json::json!({ "ok": false, "error": self.0.code() })),
        )
            .into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    let internal = admin::router().layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        admin::require_token,
    ));

    Router::new()
        .route("/", get(routes::launcher_page))
        .route("/health", get(routes::health))
        .route("/api/resolve", post(routes::resolve))
        .nest("/m", Router::new().fallback(routes::mirror_any))
        .nest("/internal", internal)
        .layer(middleware::from_fn(stamp_robots_tag))
        .with_state(state)
}

/// Every response — success, error, public or internal — is tagged
/// non-indexable.
async fn stamp_robots_tag(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        "x-robots-tag",
        HeaderValue::from_static("noindex, nofollow"),
    );
    resp
}
