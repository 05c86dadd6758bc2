//! End-to-end request servicing: resolve, cache, guarded fetch, rewrite,
//! respond.
//!
//! The service owns no per-request state. Registry and cache IO are blocking
//! filesystem/SQLite work and run under `spawn_blocking`; no lock is held
//! across an await. Concurrent cold fetches of the same URL are allowed to
//! race (last cache write wins) rather than coalesced behind a lock.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;
use webmirror_core::{
    is_css_content_type, is_html_content_type, origin_of, Error, EventKind, EventLevel,
    MirrorMethod, MirrorRecord, MirrorResponse, ResolveOutcome, Result, UpstreamFetcher,
    UpstreamRequest, UpstreamResponse,
};

use crate::allowlist::AllowlistStore;
use crate::cache::{cache_key, CacheStats, FileCache};
use crate::guard::{assert_safe_url, assert_safe_url_syntactic, GuardPolicy};
use crate::registry::Registry;
use crate::rewrite::mirror_path;
use crate::rewrite_css::rewrite_css;
use crate::rewrite_html::rewrite_html;

/// Redirect follows permitted after the initial fetch.
pub const MAX_REDIRECTS: usize = 5;
/// Resolve inputs longer than this are rejected before parsing.
pub const MAX_RESOLVE_URL_CHARS: usize = 2000;

pub const ROBOTS_TAG: &str = "noindex, nofollow";

/// Connection-scoped headers an intermediary must not forward.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "transfer-encoding",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Upstream CSP would break rewritten in-origin links; no sessions in this
/// phase, so cookies never pass through either.
const ALWAYS_DROP_HEADERS: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "set-cookie",
];

/// Stale after rewriting changes the byte stream.
const REWRITTEN_DROP_HEADERS: &[&str] = &["content-length", "content-encoding", "etag"];

/// Stamped fresh on every send; never part of the cached snapshot.
const SYNTHETIC_HEADERS: &[&str] = &["x-cache", "x-robots-tag"];

/// Inbound headers forwarded to the upstream.
const FORWARDED_REQUEST_HEADERS: &[&str] = &["user-agent", "accept", "accept-language"];

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub allow_http: bool,
    pub allow_private: bool,
    pub upstream_timeout_ms: u64,
    pub max_html_bytes: u64,
    pub max_binary_bytes: u64,
}

/// Dry-run resolve outcome for the admin surface: what would happen, with
/// nothing created and nothing logged.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProbe {
    pub target_origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowlist_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_slug: Option<String>,
}

pub struct MirrorService {
    config: PipelineConfig,
    registry: Arc<Registry>,
    allowlist: Arc<AllowlistStore>,
    cache: Arc<FileCache>,
    fetcher: Arc<dyn UpstreamFetcher>,
    disabled: AtomicBool,
}

impl MirrorService {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<Registry>,
        allowlist: Arc<AllowlistStore>,
        cache: Arc<FileCache>,
        fetcher: Arc<dyn UpstreamFetcher>,
        initially_disabled: bool,
    ) -> Self {
        Self {
            config,
            registry,
            allowlist,
            cache,
            fetcher,
            disabled: AtomicBool::new(initially_disabled),
        }
    }

    pub fn allowlist(&self) -> &AllowlistStore {
        &self.allowlist
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    fn guard_policy(&self) -> GuardPolicy {
        GuardPolicy {
            allow_http: self.config.allow_http,
            allow_private: self.config.allow_private,
        }
    }

    async fn with_registry<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Registry) -> Result<T> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| Error::Registry(format!("registry join failed: {e}")))?
    }

    async fn with_cache<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileCache) -> Result<T> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        tokio::task::spawn_blocking(move || f(&cache))
            .await
            .map_err(|e| Error::Cache(format!("cache join failed: {e}")))?
    }

    /// Record one audit event; failures are logged, never propagated.
    pub async fn log_event(
        &self,
        level: EventLevel,
        kind: EventKind,
        slug: Option<String>,
        message: String,
        meta: Option<serde_json::Value>,
    ) {
        let registry = Arc::clone(&self.registry);
        let result = tokio::task::spawn_blocking(move || {
            registry.record_event(level, kind, slug.as_deref(), &message, meta)
        })
        .await;
        match result {
            Ok(Err(e)) => tracing::warn!(error = %e, "event record failed"),
            Err(e) => tracing::warn!(error = %e, "event record join failed"),
            Ok(Ok(_)) => {}
        }
    }

    // ------------------------------------------------------------------
    // Resolve
    // ------------------------------------------------------------------

    /// `POST /api/resolve`: validate the URL, then return the existing mirror
    /// for its origin or register a new one.
    pub async fn resolve_target_url(&self, raw_url: &str) -> Result<ResolveOutcome> {
        match self.do_resolve(raw_url).await {
            Ok(outcome) => {
                self.log_event(
                    EventLevel::Info,
                    EventKind::Resolve,
                    Some(outcome.slug.clone()),
                    format!("resolved {}", outcome.target_origin),
                    Some(serde_json::json!({ "url": raw_url, "created": outcome.created })),
                )
                .await;
                Ok(outcome)
            }
            Err(err) => {
                self.log_event(
                    EventLevel::Warn,
                    EventKind::ResolveFail,
                    None,
                    format!("resolve failed: {err}"),
                    Some(serde_json::json!({ "url": raw_url, "error": err.code() })),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn do_resolve(&self, raw_url: &str) -> Result<ResolveOutcome> {
        let url = self.validate_target_url(raw_url).await?;
        let target_origin = origin_of(&url);
        let host = url.host_str().unwrap_or_default().to_string();
        let last_path = non_root_path_and_query(&url);

        let (record, created) = {
            let origin = target_origin.clone();
            self.with_registry(move |reg| {
                reg.upsert_by_origin(&origin, &host, last_path.as_deref())
            })
            .await?
        };

        let launch_url = mirror_path(&record.slug, &url);
        Ok(ResolveOutcome {
            slug: record.slug,
            target_origin: record.target_origin,
            launch_url,
            created,
        })
    }

    /// Shared validation for resolve and test-resolve: parse, cheap guard
    /// checks, allowlist, then DNS-backed guard.
    async fn validate_target_url(&self, raw_url: &str) -> Result<Url> {
        let trimmed = raw_url.trim();
        if trimmed.is_empty() {
            return Err(Error::MissingUrl);
        }
        if trimmed.len() > MAX_RESOLVE_URL_CHARS {
            return Err(Error::InvalidUrl("url too long".to_string()));
        }
        let url = Url::parse(trimmed).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let policy = self.guard_policy();
        assert_safe_url_syntactic(&url, &policy)?;
        if self.allowlist.match_url(&url).is_none() {
            return Err(Error::DomainNotAllowed(
                url.host_str().unwrap_or_default().to_string(),
            ));
        }
        assert_safe_url(&url, &policy).await?;
        Ok(url)
    }

    /// Admin dry-run: report the outcome without creating records or events.
    pub async fn probe_target_url(&self, raw_url: &str) -> Result<TargetProbe> {
        let url = self.validate_target_url(raw_url).await?;
        let target_origin = origin_of(&url);
        let allowlist_id = self.allowlist.match_url(&url).map(|e| e.id);
        let existing = {
            let origin = target_origin.clone();
            self.with_registry(move |reg| reg.find_enabled_by_origin(&origin))
                .await?
        };
        Ok(TargetProbe {
            target_origin,
            allowlist_id,
            existing_slug: existing.map(|r| r.slug),
        })
    }

    // ------------------------------------------------------------------
    // Mirrored requests
    // ------------------------------------------------------------------

    pub async fn handle_mirror_request(
        &self,
        slug: &str,
        tail_path: &str,
        raw_query: Option<&str>,
        method: MirrorMethod,
        inbound_headers: &BTreeMap<String, String>,
    ) -> Result<MirrorResponse> {
        if self.is_disabled() {
            return Err(Error::ServiceDisabled);
        }
        let record = {
            let slug = slug.to_string();
            self.with_registry(move |reg| reg.find_by_slug(&slug)).await?
        };
        let record = match record {
            Some(r) if !r.disabled => r,
            _ => return Err(Error::MirrorNotFound),
        };

        match self
            .service_mirror(&record, tail_path, raw_query, method, inbound_headers)
            .await
        {
            Ok(resp) => Ok(resp),
            Err(err) => {
                let (level, kind) = classify_failure(&err);
                if let Some(kind) = kind {
                    self.log_event(
                        level,
                        kind,
                        Some(record.slug.clone()),
                        format!("proxy failed: {err}"),
                        Some(serde_json::json!({ "error": err.code() })),
                    )
                    .await;
                }
                Err(err)
            }
        }
    }

    async fn service_mirror(
        &self,
        record: &MirrorRecord,
        tail_path: &str,
        raw_query: Option<&str>,
        method: MirrorMethod,
        inbound_headers: &BTreeMap<String, String>,
    ) -> Result<MirrorResponse> {
        let upstream_url = build_upstream_url(&record.target_origin, tail_path, raw_query)?;
        let key = cache_key(method.as_str(), upstream_url.as_str());

        if method == MirrorMethod::Get {
            let cached = {
                let (slug, key) = (record.slug.clone(), key.clone());
                self.with_cache(move |c| c.get(&slug, &key)).await?
            };
            if let Some(entry) = cached {
                self.log_event(
                    EventLevel::Info,
                    EventKind::CacheHit,
                    Some(record.slug.clone()),
                    format!("cache hit for {upstream_url}"),
                    None,
                )
                .await;
                let mut headers = entry.meta.headers;
                headers.insert("x-cache".to_string(), "HIT".to_string());
                headers.insert("x-robots-tag".to_string(), ROBOTS_TAG.to_string());
                return Ok(MirrorResponse {
                    status: entry.meta.status,
                    headers,
                    body: Some(entry.body),
                });
            }
            self.log_event(
                EventLevel::Info,
                EventKind::CacheMiss,
                Some(record.slug.clone()),
                format!("cache miss for {upstream_url}"),
                None,
            )
            .await;
        }

        let forwarded = forward_request_headers(inbound_headers);
        let (upstream, final_url) = self
            .fetch_with_redirects(upstream_url, method, forwarded)
            .await?;

        if method == MirrorMethod::Head {
            let mut headers = filter_response_headers(&upstream.headers, false);
            headers.insert("x-cache".to_string(), "MISS".to_string());
            headers.insert("x-robots-tag".to_string(), ROBOTS_TAG.to_string());
            self.touch_record(&record.slug, &final_url).await;
            return Ok(MirrorResponse {
                status: upstream.status,
                headers,
                body: None,
            });
        }

        let content_type = upstream.content_type.clone().unwrap_or_default();
        let (body, rewritten) = if is_html_content_type(&content_type) {
            let text = String::from_utf8_lossy(&upstream.body);
            let html = rewrite_html(&text, &final_url, &record.target_origin, &record.slug)?;
            (html.into_bytes(), true)
        } else if is_css_content_type(&content_type) {
            let text = String::from_utf8_lossy(&upstream.body);
            let css = rewrite_css(&text, &final_url, &record.target_origin, &record.slug);
            (css.into_bytes(), true)
        } else {
            (upstream.body, false)
        };

        let mut headers = filter_response_headers(&upstream.headers, rewritten);
        if rewritten {
            headers.insert("content-length".to_string(), body.len().to_string());
        }
        headers.insert("x-robots-tag".to_string(), ROBOTS_TAG.to_string());
        headers.insert("x-cache".to_string(), "MISS".to_string());

        if (200..300).contains(&upstream.status) {
            // Synthetic headers are stamped per send, never persisted.
            let snapshot: BTreeMap<String, String> = headers
                .iter()
                .filter(|(k, _)| !SYNTHETIC_HEADERS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let write = {
                let (slug, key) = (record.slug.clone(), key.clone());
                let status = upstream.status;
                let content_type = upstream.content_type.clone();
                let body = body.clone();
                self.with_cache(move |c| {
                    c.set(&slug, &key, status, &snapshot, content_type.as_deref(), &body)
                })
                .await
            };
            if let Err(e) = write {
                tracing::warn!(slug = %record.slug, error = %e, "cache write failed");
            }
        }

        self.touch_record(&record.slug, &final_url).await;

        Ok(MirrorResponse {
            status: upstream.status,
            headers,
            body: Some(body),
        })
    }

    /// Bounded redirect loop. Every hop — the initial URL included — passes
    /// the guard and the allowlist before a socket is opened, and each hop
    /// gets a fresh upstream deadline.
    async fn fetch_with_redirects(
        &self,
        start: Url,
        method: MirrorMethod,
        headers: BTreeMap<String, String>,
    ) -> Result<(UpstreamResponse, Url)> {
        let policy = self.guard_policy();
        let mut current = start;
        let mut hops = 0usize;
        loop {
            assert_safe_url_syntactic(&current, &policy)?;
            if self.allowlist.match_url(&current).is_none() {
                return Err(Error::DomainNotAllowed(
                    current.host_str().unwrap_or_default().to_string(),
                ));
            }
            assert_safe_url(&current, &policy).await?;

            let req = UpstreamRequest {
                url: current.clone(),
                method,
                headers: headers.clone(),
                timeout_ms: self.config.upstream_timeout_ms,
                max_html_bytes: self.config.max_html_bytes,
                max_binary_bytes: self.config.max_binary_bytes,
            };
            let resp = self.fetcher.fetch_once(&req).await?;

            if (300..400).contains(&resp.status) {
                if let Some(location) = resp.headers.get("location") {
                    hops += 1;
                    if hops > MAX_REDIRECTS {
                        return Err(Error::TooManyRedirects(MAX_REDIRECTS));
                    }
                    current = current.join(location).map_err(|e| {
                        Error::Upstream(format!("invalid redirect location: {e}"))
                    })?;
                    continue;
                }
            }
            return Ok((resp, current));
        }
    }

    async fn touch_record(&self, slug: &str, final_url: &Url) {
        let last_path = non_root_path_and_query(final_url);
        let slug = slug.to_string();
        let result = self
            .with_registry(move |reg| reg.touch(&slug, last_path.as_deref()))
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "touch failed");
        }
    }

    // ------------------------------------------------------------------
    // Admin support
    // ------------------------------------------------------------------

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.with_cache(|c| c.stats()).await
    }

    /// Purge everything or one slug; records a `cache-purge` event.
    pub async fn purge_cache(&self, slug: Option<String>) -> Result<u64> {
        let removed = match slug.clone() {
            Some(s) => self.with_cache(move |c| c.purge_by_slug(&s)).await?,
            None => self.with_cache(|c| c.purge_all()).await?,
        };
        self.log_event(
            EventLevel::Info,
            EventKind::CachePurge,
            slug,
            format!("purged {removed} cache files"),
            None,
        )
        .await;
        Ok(removed)
    }

    pub async fn list_mirrors(&self) -> Result<Vec<MirrorRecord>> {
        self.with_registry(|reg| reg.list()).await
    }

    pub async fn mirror_count(&self) -> Result<u64> {
        self.with_registry(|reg| reg.mirror_count()).await
    }

    pub async fn set_mirror_disabled(&self, slug: &str, disabled: bool) -> Result<bool> {
        let slug = slug.to_string();
        self.with_registry(move |reg| reg.set_disabled(&slug, disabled))
            .await
    }

    pub async fn recent_events(&self, limit: u32) -> Result<Vec<webmirror_core::Event>> {
        self.with_registry(move |reg| reg.recent_events(limit)).await
    }
}

fn classify_failure(err: &Error) -> (EventLevel, Option<EventKind>) {
    match err {
        Error::UpstreamTimeout(_) => (EventLevel::Error, Some(EventKind::UpstreamTimeout)),
        Error::SsrfBlocked(_) => (EventLevel::Warn, Some(EventKind::SsrfBlocked)),
        Error::ServiceDisabled | Error::MirrorNotFound | Error::MethodNotAllowed => {
            (EventLevel::Warn, None)
        }
        _ => (EventLevel::Error, Some(EventKind::ProxyError)),
    }
}

/// `targetOrigin` + tail + verbatim query.
fn build_upstream_url(target_origin: &str, tail_path: &str, raw_query: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(target_origin)
        .map_err(|e| Error::Registry(format!("bad target origin {target_origin}: {e}")))?;
    let tail = tail_path.trim_start_matches('/');
    url.set_path(&format!("/{tail}"));
    url.set_query(raw_query.filter(|q| !q.is_empty()));
    Ok(url)
}

fn forward_request_headers(inbound: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (k, v) in inbound {
        let k = k.to_ascii_lowercase();
        if FORWARDED_REQUEST_HEADERS.contains(&k.as_str()) {
            out.insert(k, v.clone());
        }
    }
    out.insert("cache-control".to_string(), "no-cache".to_string());
    out.insert("pragma".to_string(), "no-cache".to_string());
    out
}

fn filter_response_headers(
    headers: &BTreeMap<String, String>,
    body_rewritten: bool,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&key.as_str())
            || ALWAYS_DROP_HEADERS.contains(&key.as_str())
            || (body_rewritten && REWRITTEN_DROP_HEADERS.contains(&key.as_str()))
        {
            continue;
        }
        out.insert(key, v.clone());
    }
    out
}

/// Path + query of a URL, `None` when it is just the bare root.
fn non_root_path_and_query(url: &Url) -> Option<String> {
    if url.path() == "/" && url.query().is_none() {
        return None;
    }
    let mut out = url.path().to_string();
    if let Some(q) = url.query() {
        out.push('?');
        out.push_str(q);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::{AllowlistStore, AllowlistUpsert};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Programmable fetcher: URL string → canned response, with a log of
    /// every URL dialed.
    struct StubFetcher {
        responses: HashMap<String, UpstreamResponse>,
        dialed: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
                dialed: Mutex::new(Vec::new()),
            }
        }

        fn respond(mut self, url: &str, resp: UpstreamResponse) -> Self {
            self.responses.insert(url.to_string(), resp);
            self
        }

        fn dialed_urls(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl UpstreamFetcher for StubFetcher {
        async fn fetch_once(&self, req: &UpstreamRequest) -> Result<UpstreamResponse> {
            self.dialed.lock().unwrap().push(req.url.to_string());
            self.responses
                .get(req.url.as_str())
                .cloned()
                .ok_or_else(|| Error::Upstream(format!("no stub for {}", req.url)))
        }
    }

    fn ok_html(body: &str) -> UpstreamResponse {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        UpstreamResponse {
            status: 200,
            headers,
            content_type: Some("text/html".to_string()),
            body: body.as_bytes().to_vec(),
        }
    }

    fn redirect_to(location: &str) -> UpstreamResponse {
        let mut headers = BTreeMap::new();
        headers.insert("location".to_string(), location.to_string());
        UpstreamResponse {
            status: 301,
            headers,
            content_type: None,
            body: Vec::new(),
        }
    }

    struct Fixture {
        service: MirrorService,
        fetcher: Arc<StubFetcher>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn fixture(fetcher: StubFetcher, allowed_hosts: &[&str]) -> Fixture {
        let fetcher = Arc::new(fetcher);
        let cache_dir = tempfile::tempdir().unwrap();
        let list_dir = tempfile::tempdir().unwrap();
        let allowlist =
            AllowlistStore::load(list_dir.path().join("allowlist.json")).unwrap();
        for host in allowed_hosts {
            allowlist
                .upsert(AllowlistUpsert {
                    id: None,
                    host: host.to_string(),
                    allow_subdomains: None,
                    schemes: Some(vec!["https".to_string(), "http".to_string()]),
                    enabled: None,
                    label: None,
                })
                .unwrap();
        }
        let service = MirrorService::new(
            PipelineConfig {
                allow_http: true,
                allow_private: false,
                upstream_timeout_ms: 2_000,
                max_html_bytes: 1_000_000,
                max_binary_bytes: 1_000_000,
            },
            Arc::new(Registry::open_in_memory().unwrap()),
            Arc::new(allowlist),
            Arc::new(FileCache::new(cache_dir.path(), 3600, 1_000_000)),
            Arc::clone(&fetcher) as Arc<dyn UpstreamFetcher>,
            false,
        );
        Fixture {
            service,
            fetcher,
            _dirs: (cache_dir, list_dir),
        }
    }

    async fn resolve(service: &MirrorService, url: &str) -> ResolveOutcome {
        service.resolve_target_url(url).await.unwrap()
    }

    #[tokio::test]
    async fn resolve_is_idempotent_per_origin() {
        let fx = fixture(StubFetcher::new(), &["198.20.0.1"]);
        let first = resolve(&fx.service, "https://198.20.0.1/foo").await;
        assert!(first.created);
        assert_eq!(first.slug, "198-20-0-1");
        assert_eq!(first.target_origin, "https://198.20.0.1");
        assert_eq!(first.launch_url, "/m/198-20-0-1/foo");

        let second = resolve(&fx.service, "https://198.20.0.1/bar?x=1").await;
        assert!(!second.created);
        assert_eq!(second.slug, first.slug);
        assert_eq!(second.launch_url, "/m/198-20-0-1/bar?x=1");
    }

    #[tokio::test]
    async fn resolve_of_private_address_is_blocked_and_creates_nothing() {
        let fx = fixture(StubFetcher::new(), &["127.0.0.1"]);
        let err = fx
            .service
            .resolve_target_url("http://127.0.0.1/")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ssrf_blocked");
        assert_eq!(fx.service.mirror_count().await.unwrap(), 0);

        let events = fx.service.recent_events(10).await.unwrap();
        assert_eq!(events[0].kind, EventKind::ResolveFail);
    }

    #[tokio::test]
    async fn resolve_off_allowlist_is_domain_not_allowed() {
        let fx = fixture(StubFetcher::new(), &["198.20.0.1"]);
        let err = fx
            .service
            .resolve_target_url("https://198.20.0.2/")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "domain_not_allowed");
        assert_eq!(fx.service.mirror_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resolve_rejects_oversized_and_malformed_urls() {
        let fx = fixture(StubFetcher::new(), &["198.20.0.1"]);
        let long = format!("https://198.20.0.1/{}", "a".repeat(MAX_RESOLVE_URL_CHARS));
        assert_eq!(
            fx.service.resolve_target_url(&long).await.unwrap_err().code(),
            "invalid_url"
        );
        assert_eq!(
            fx.service.resolve_target_url("not a url").await.unwrap_err().code(),
            "invalid_url"
        );
        assert_eq!(
            fx.service.resolve_target_url("  ").await.unwrap_err().code(),
            "missing_url"
        );
    }

    #[tokio::test]
    async fn mirror_request_rewrites_and_caches() {
        let fetcher = StubFetcher::new().respond(
            "https://198.20.0.1/",
            ok_html(r#"<html><head></head><body><a href="/x">x</a></body></html>"#),
        );
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let resp = fx
            .service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("x-cache").unwrap(), "MISS");
        assert_eq!(resp.headers.get("x-robots-tag").unwrap(), ROBOTS_TAG);
        let body = String::from_utf8(resp.body.unwrap()).unwrap();
        assert!(body.contains(r#"href="/m/198-20-0-1/x""#), "body={body}");

        let again = fx
            .service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(again.headers.get("x-cache").unwrap(), "HIT");
        let body2 = String::from_utf8(again.body.unwrap()).unwrap();
        assert_eq!(body, body2);

        let kinds: Vec<EventKind> = fx
            .service
            .recent_events(10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&EventKind::CacheHit));
        assert!(kinds.contains(&EventKind::CacheMiss));
    }

    #[tokio::test]
    async fn response_headers_are_scrubbed() {
        let mut resp = ok_html("<html></html>");
        resp.headers
            .insert("connection".to_string(), "keep-alive".to_string());
        resp.headers
            .insert("transfer-encoding".to_string(), "chunked".to_string());
        resp.headers
            .insert("set-cookie".to_string(), "sid=secret".to_string());
        resp.headers.insert(
            "content-security-policy".to_string(),
            "default-src 'self'".to_string(),
        );
        resp.headers
            .insert("etag".to_string(), "\"abc\"".to_string());
        resp.headers
            .insert("x-custom".to_string(), "keep-me".to_string());
        let fetcher = StubFetcher::new().respond("https://198.20.0.1/", resp);
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let resp = fx
            .service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap();
        for dropped in [
            "connection",
            "transfer-encoding",
            "set-cookie",
            "content-security-policy",
            "etag",
        ] {
            assert!(!resp.headers.contains_key(dropped), "{dropped} leaked");
        }
        assert_eq!(resp.headers.get("x-custom").unwrap(), "keep-me");
        assert_eq!(
            resp.headers.get("content-length").unwrap(),
            &resp.body.as_ref().unwrap().len().to_string()
        );
    }

    #[tokio::test]
    async fn redirects_are_validated_and_bounded() {
        let mut fetcher = StubFetcher::new();
        for n in 0..=6 {
            fetcher = fetcher.respond(
                &format!("https://198.20.0.1/hop{n}"),
                redirect_to(&format!("/hop{}", n + 1)),
            );
        }
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let err = fx
            .service
            .handle_mirror_request(&out.slug, "hop0", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "too_many_redirects");

        let kinds: Vec<EventKind> = fx
            .service
            .recent_events(10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&EventKind::ProxyError));
    }

    #[tokio::test]
    async fn short_redirect_chains_succeed_and_rewrite_against_the_final_url() {
        let fetcher = StubFetcher::new()
            .respond("https://198.20.0.1/start", redirect_to("/end"))
            .respond(
                "https://198.20.0.1/end",
                ok_html(r#"<a href="next">n</a>"#),
            );
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let resp = fx
            .service
            .handle_mirror_request(&out.slug, "start", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap();
        let body = String::from_utf8(resp.body.unwrap()).unwrap();
        // `next` resolves against /end (the final URL), not /start.
        assert!(body.contains(r#"href="/m/198-20-0-1/next""#), "body={body}");

        // lastPath tracks the final URL.
        let rec = fx.service.list_mirrors().await.unwrap().remove(0);
        assert_eq!(rec.last_path.as_deref(), Some("/end"));
    }

    #[tokio::test]
    async fn redirect_to_private_address_is_blocked_before_dialing() {
        let fetcher = StubFetcher::new()
            .respond("https://198.20.0.1/", redirect_to("http://169.254.169.254/"));
        let fx = fixture(fetcher, &["198.20.0.1", "169.254.169.254"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let err = fx
            .service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ssrf_blocked");

        // The metadata endpoint itself was never dialed.
        assert_eq!(fx.fetcher.dialed_urls(), vec!["https://198.20.0.1/"]);

        let events: Vec<EventKind> = fx
            .service
            .recent_events(10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert!(events.contains(&EventKind::SsrfBlocked));
    }

    #[tokio::test]
    async fn redirect_off_allowlist_is_blocked_before_dialing() {
        let fetcher = StubFetcher::new()
            .respond("https://198.20.0.1/", redirect_to("https://198.20.0.2/"));
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let err = fx
            .service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "domain_not_allowed");

        // The off-allowlist hop never reached the fetcher.
        assert_eq!(fx.fetcher.dialed_urls(), vec!["https://198.20.0.1/"]);
    }

    #[tokio::test]
    async fn unknown_or_disabled_slugs_are_not_found() {
        let fx = fixture(StubFetcher::new(), &["198.20.0.1"]);
        let err = fx
            .service
            .handle_mirror_request("nope", "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "mirror_not_found");

        let out = resolve(&fx.service, "https://198.20.0.1/").await;
        fx.service.set_mirror_disabled(&out.slug, true).await.unwrap();
        let err = fx
            .service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "mirror_not_found");
    }

    #[tokio::test]
    async fn disabled_service_replies_503() {
        let fx = fixture(StubFetcher::new(), &["198.20.0.1"]);
        fx.service.set_disabled(true);
        let err = fx
            .service
            .handle_mirror_request("any", "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "service_disabled");
    }

    #[tokio::test]
    async fn head_requests_skip_body_and_cache() {
        let fetcher =
            StubFetcher::new().respond("https://198.20.0.1/", ok_html("<html></html>"));
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let resp = fx
            .service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Head, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.body.is_none());
        assert_eq!(resp.headers.get("x-cache").unwrap(), "MISS");
        assert_eq!(fx.service.cache_stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn query_strings_pass_through_to_upstream() {
        let fetcher = StubFetcher::new()
            .respond("https://198.20.0.1/search?q=a&p=2", ok_html("<html>r</html>"));
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;

        let resp = fx
            .service
            .handle_mirror_request(
                &out.slug,
                "search",
                Some("q=a&p=2"),
                MirrorMethod::Get,
                &BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn purge_then_stats_is_empty() {
        let fetcher =
            StubFetcher::new().respond("https://198.20.0.1/", ok_html("<html></html>"));
        let fx = fixture(fetcher, &["198.20.0.1"]);
        let out = resolve(&fx.service, "https://198.20.0.1/").await;
        fx.service
            .handle_mirror_request(&out.slug, "", None, MirrorMethod::Get, &BTreeMap::new())
            .await
            .unwrap();
        assert!(fx.service.cache_stats().await.unwrap().entries > 0);

        fx.service.purge_cache(None).await.unwrap();
        let stats = fx.service.cache_stats().await.unwrap();
        assert_eq!((stats.entries, stats.used_bytes), (0, 0));
    }
}
