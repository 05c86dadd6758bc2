//! Public route handlers.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use std::collections::BTreeMap;
use webmirror_core::{Error, MirrorMethod, MirrorResponse};

use crate::{launcher, ApiError, SharedState};

pub async fn launcher_page() -> Html<&'static str> {
    Html(launcher::LAUNCHER_HTML)
}

pub async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "serviceDisabled": state.service.is_disabled(),
        "uptimeSec": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn resolve(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| Error::InvalidBody)?;
    let url = parsed
        .get("url")
        .and_then(|u| u.as_str())
        .ok_or(Error::MissingUrl)?;

    let outcome = state.service.resolve_target_url(url).await?;
    let mut out = serde_json::to_value(&outcome).map_err(|e| Error::Upstream(e.to_string()))?;
    out["ok"] = serde_json::Value::Bool(true);
    Ok(Json(out))
}

/// All of `/m/...`. Mounted as a nested fallback rather than path-parameter
/// routes so that `/m/<slug>`, `/m/<slug>/` and `/m/<slug>/a/b` all land
/// here, the empty tail included.
pub async fn mirror_any(
    State(state): State<SharedState>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let Some(mirror_method) = MirrorMethod::parse(method.as_str()) else {
        return ApiError(Error::MethodNotAllowed).into_response();
    };
    // The nest stripped the `/m` prefix; what remains is `/<slug>[/<tail>]`.
    let trimmed = uri.path().trim_start_matches('/');
    let (raw_slug, tail) = match trimmed.split_once('/') {
        Some((slug, tail)) => (slug, tail),
        None => (trimmed, ""),
    };
    if raw_slug.is_empty() {
        return ApiError(Error::MirrorNotFound).into_response();
    }
    let slug = urlencoding::decode(raw_slug)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw_slug.to_string());

    let inbound = headermap_to_btree(&headers);
    match state
        .service
        .handle_mirror_request(&slug, tail, uri.query(), mirror_method, &inbound)
        .await
    {
        Ok(resp) => mirror_to_response(resp),
        Err(e) => ApiError(e).into_response(),
    }
}

fn headermap_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (k, v) in headers {
        if let Ok(v) = v.to_str() {
            out.insert(k.as_str().to_string(), v.to_string());
        }
    }
    out
}

fn mirror_to_response(m: MirrorResponse) -> Response {
    let mut resp = Response::new(match m.body {
        Some(bytes) => Body::from(bytes),
        None => Body::empty(),
    });
    *resp.status_mut() = StatusCode::from_u16(m.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (k, v) in &m.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(k.as_str()),
            HeaderValue::from_str(v),
        ) {
            resp.headers_mut().insert(name, value);
        }
    }
    resp
}
