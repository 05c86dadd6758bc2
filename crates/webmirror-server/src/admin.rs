//! Token-gated internal admin surface, nested under `/internal`.
//!
//! Authorization accepts either `x-internal-token: <TOKEN>` or
//! `Authorization: Bearer <TOKEN>`. Every mutation is recorded as an
//! `admin-action` event.

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use webmirror_core::{Error, EventKind, EventLevel};
use webmirror_proxy::allowlist::{AllowlistPatch, AllowlistUpsert};

use crate::{ApiError, SharedState};

const DEFAULT_LOG_LIMIT: u32 = 100;
const MAX_LOG_LIMIT: u32 = 1_000;

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/summary", get(summary))
        .route("/allowlist", get(allowlist_list).post(allowlist_upsert))
        .route("/allowlist/reload", post(allowlist_reload))
        .route(
            "/allowlist/:id",
            delete(allowlist_remove).patch(allowlist_patch),
        )
        .route("/cache/purge", post(cache_purge))
        .route("/service/disable", post(service_disable))
        .route("/service/enable", post(service_enable))
        .route("/mirrors", get(mirrors))
        .route("/mirrors/:slug/disable", post(mirror_disable))
        .route("/mirrors/:slug/enable", post(mirror_enable))
        .route("/logs", get(logs))
        .route("/test-resolve", post(test_resolve))
}

pub async fn require_token(
    State(state): State<SharedState>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    if token_matches(&headers, &state.config.internal_token) {
        next.run(req).await
    } else {
        ApiError(Error::Unauthorized).into_response()
    }
}

fn token_matches(headers: &HeaderMap, token: &str) -> bool {
    if let Some(v) = headers.get("x-internal-token").and_then(|v| v.to_str().ok()) {
        if v == token {
            return true;
        }
    }
    if let Some(v) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(bearer) = v.strip_prefix("Bearer ") {
            return bearer == token;
        }
    }
    false
}

async fn admin_event(state: &SharedState, message: String, meta: Option<serde_json::Value>) {
    state
        .service
        .log_event(EventLevel::Info, EventKind::AdminAction, None, message, meta)
        .await;
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError(Error::InvalidBody))
}

async fn summary(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let cache = state.service.cache_stats().await?;
    let mirrors = state.service.mirror_count().await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "serviceDisabled": state.service.is_disabled(),
        "mirrors": mirrors,
        "cache": cache,
        "allowlistEntries": state.service.allowlist().list().len(),
    })))
}

async fn allowlist_list(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "entries": state.service.allowlist().list(),
    }))
}

async fn allowlist_upsert(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let input: AllowlistUpsert = parse_body(&body)?;
    let entry = state.service.allowlist().upsert(input)?;
    admin_event(
        &state,
        format!("allowlist upsert {}", entry.id),
        Some(serde_json::json!({ "host": entry.host })),
    )
    .await;
    Ok(Json(serde_json::json!({ "ok": true, "entry": entry })))
}

async fn allowlist_patch(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let patch: AllowlistPatch = parse_body(&body)?;
    let entry = state.service.allowlist().patch(&id, patch)?;
    admin_event(&state, format!("allowlist patch {id}"), None).await;
    Ok(Json(serde_json::json!({ "ok": true, "entry": entry })))
}

async fn allowlist_remove(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.service.allowlist().remove(&id)?;
    admin_event(&state, format!("allowlist remove {id}"), None).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn allowlist_reload(
    State(state): State<SharedState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state.service.allowlist().reload()?;
    admin_event(&state, format!("allowlist reload ({entries} entries)"), None).await;
    Ok(Json(serde_json::json!({ "ok": true, "entries": entries })))
}

#[derive(Debug, Default, Deserialize)]
struct PurgeBody {
    #[serde(default)]
    slug: Option<String>,
}

async fn cache_purge(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: PurgeBody = if body.is_empty() {
        PurgeBody::default()
    } else {
        parse_body(&body)?
    };
    let removed = state.service.purge_cache(req.slug.clone()).await?;
    admin_event(
        &state,
        format!("cache purge ({removed} files)"),
        req.slug.map(|s| serde_json::json!({ "slug": s })),
    )
    .await;
    Ok(Json(serde_json::json!({ "ok": true, "removed": removed })))
}

async fn service_disable(State(state): State<SharedState>) -> Json<serde_json::Value> {
    state.service.set_disabled(true);
    admin_event(&state, "service disabled".to_string(), None).await;
    Json(serde_json::json!({ "ok": true, "serviceDisabled": true }))
}

async fn service_enable(State(state): State<SharedState>) -> Json<serde_json::Value> {
    state.service.set_disabled(false);
    admin_event(&state, "service enabled".to_string(), None).await;
    Json(serde_json::json!({ "ok": true, "serviceDisabled": false }))
}

async fn mirrors(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mirrors = state.service.list_mirrors().await?;
    Ok(Json(serde_json::json!({ "ok": true, "mirrors": mirrors })))
}

async fn mirror_disable(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_mirror_disabled(&state, &slug, true).await
}

async fn mirror_enable(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_mirror_disabled(&state, &slug, false).await
}

async fn set_mirror_disabled(
    state: &SharedState,
    slug: &str,
    disabled: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.service.set_mirror_disabled(slug, disabled).await? {
        return Err(ApiError(Error::MirrorNotFound));
    }
    admin_event(
        state,
        format!(
            "mirror {slug} {}",
            if disabled { "disabled" } else { "enabled" }
        ),
        None,
    )
    .await;
    Ok(Json(serde_json::json!({ "ok": true, "slug": slug, "disabled": disabled })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    limit: Option<u32>,
}

async fn logs(
    State(state): State<SharedState>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let events = state.service.recent_events(limit).await?;
    Ok(Json(serde_json::json!({ "ok": true, "events": events })))
}

#[derive(Debug, Deserialize)]
struct TestResolveBody {
    url: String,
}

async fn test_resolve(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: TestResolveBody = parse_body(&body)?;
    let probe = state.service.probe_target_url(&req.url).await?;
    let mut out = serde_json::to_value(&probe).map_err(|e| Error::Upstream(e.to_string()))?;
    out["ok"] = serde_json::Value::Bool(true);
    Ok(Json(out))
}
