use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("scheme not allowed: {0}")]
    InvalidScheme(String),
    #[error("request body is not valid")]
    InvalidBody,
    #[error("missing url")]
    MissingUrl,
    #[error("urls carrying credentials are not allowed")]
    CredentialsNotAllowed,
    #[error("url has an empty hostname")]
    EmptyHostname,
    #[error("invalid ip literal: {0}")]
    InvalidIp(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("host is not on the allowlist: {0}")]
    DomainNotAllowed(String),
    #[error("blocked address: {0}")]
    SsrfBlocked(String),
    #[error("mirror not found")]
    MirrorNotFound,
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("html body exceeds the configured limit")]
    HtmlTooLarge,
    #[error("body exceeds the configured limit")]
    BinaryTooLarge,
    #[error("rate limited")]
    RateLimited,
    #[error("service is disabled")]
    ServiceDisabled,
    #[error("redirect chain exceeded {0} hops")]
    TooManyRedirects(usize),
    #[error("dns resolution failed: {0}")]
    DnsResolutionFailed(String),
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("upstream fetch failed: {0}")]
    Upstream(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("allowlist error: {0}")]
    Allowlist(String),
}

impl Error {
    /// Stable wire identifier, returned to clients as `{ok:false, error:<code>}`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidUrl(_) => "invalid_url",
            Error::InvalidScheme(_) => "invalid_scheme",
            Error::InvalidBody => "invalid_body",
            Error::MissingUrl => "missing_url",
            Error::CredentialsNotAllowed => "credentials_not_allowed",
            Error::EmptyHostname => "empty_hostname",
            Error::InvalidIp(_) => "invalid_ip",
            Error::Unauthorized => "unauthorized",
            Error::DomainNotAllowed(_) => "domain_not_allowed",
            Error::SsrfBlocked(_) => "ssrf_blocked",
            Error::MirrorNotFound => "mirror_not_found",
            Error::NotFound => "not_found",
            Error::MethodNotAllowed => "method_not_allowed",
            Error::HtmlTooLarge => "html_too_large",
            Error::BinaryTooLarge => "binary_too_large",
            Error::RateLimited => "rate_limited",
            Error::ServiceDisabled => "service_disabled",
            Error::TooManyRedirects(_) => "too_many_redirects",
            Error::DnsResolutionFailed(_) => "dns_resolution_failed",
            Error::UpstreamTimeout(_) => "upstream_timeout",
            Error::Upstream(_) => "upstream_error",
            Error::Cache(_) | Error::Registry(_) | Error::Allowlist(_) => "internal_error",
        }
    }

    /// HTTP status this error maps to at the edge.
    pub fn status(&self) -> u16 {
        match self {
            Error::InvalidUrl(_)
            | Error::InvalidScheme(_)
            | Error::InvalidBody
            | Error::MissingUrl
            | Error::CredentialsNotAllowed
            | Error::EmptyHostname
            | Error::InvalidIp(_) => 400,
            Error::Unauthorized => 401,
            Error::DomainNotAllowed(_) | Error::SsrfBlocked(_) => 403,
            Error::MirrorNotFound | Error::NotFound => 404,
            Error::MethodNotAllowed => 405,
            Error::HtmlTooLarge | Error::BinaryTooLarge => 413,
            Error::RateLimited => 429,
            Error::ServiceDisabled => 503,
            Error::TooManyRedirects(_)
            | Error::DnsResolutionFailed(_)
            | Error::UpstreamTimeout(_)
            | Error::Upstream(_) => 502,
            Error::Cache(_) | Error::Registry(_) | Error::Allowlist(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The only verbs the mirror services. Everything else is rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorMethod {
    Get,
    Head,
}

impl MirrorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorMethod::Get => "GET",
            MirrorMethod::Head => "HEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(MirrorMethod::Get),
            "HEAD" => Some(MirrorMethod::Head),
            _ => None,
        }
    }
}

/// One registered mirror: a slug bound to an upstream origin.
///
/// `target_origin` never changes after creation; re-resolving the same origin
/// touches `last_path`/`updated_at` instead of creating a second record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRecord {
    pub id: String,
    pub slug: String,
    pub target_origin: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_path: Option<String>,
    pub disabled: bool,
}

fn default_schemes() -> Vec<String> {
    vec!["https".to_string()]
}

fn default_true() -> bool {
    true
}

/// One allowlist rule, as persisted in the allowlist JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistEntry {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub allow_subdomains: bool,
    #[serde(default = "default_schemes")]
    pub schemes: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(EventLevel::Info),
            "warn" => Some(EventLevel::Warn),
            "error" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Resolve,
    ResolveFail,
    ProxyError,
    SsrfBlocked,
    CacheHit,
    CacheMiss,
    CachePurge,
    AdminAction,
    UpstreamTimeout,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Resolve => "resolve",
            EventKind::ResolveFail => "resolve-fail",
            EventKind::ProxyError => "proxy-error",
            EventKind::SsrfBlocked => "ssrf-blocked",
            EventKind::CacheHit => "cache-hit",
            EventKind::CacheMiss => "cache-miss",
            EventKind::CachePurge => "cache-purge",
            EventKind::AdminAction => "admin-action",
            EventKind::UpstreamTimeout => "upstream-timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resolve" => Some(EventKind::Resolve),
            "resolve-fail" => Some(EventKind::ResolveFail),
            "proxy-error" => Some(EventKind::ProxyError),
            "ssrf-blocked" => Some(EventKind::SsrfBlocked),
            "cache-hit" => Some(EventKind::CacheHit),
            "cache-miss" => Some(EventKind::CacheMiss),
            "cache-purge" => Some(EventKind::CachePurge),
            "admin-action" => Some(EventKind::AdminAction),
            "upstream-timeout" => Some(EventKind::UpstreamTimeout),
            _ => None,
        }
    }
}

/// Append-only audit record kept by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub at: String,
    pub level: EventLevel,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Successful `resolve` outcome, serialized as the public API response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutcome {
    pub slug: String,
    pub target_origin: String,
    pub launch_url: String,
    pub created: bool,
}

/// One upstream hop. The pipeline drives the redirect loop itself, so a
/// fetcher never follows redirects on its own.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: Url,
    pub method: MirrorMethod,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    /// Byte cap applied while streaming an HTML body.
    pub max_html_bytes: u64,
    /// Byte cap applied while streaming any non-HTML body.
    pub max_binary_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    /// Empty for HEAD requests and redirect hops.
    pub body: Vec<u8>,
}

/// Single-hop fetch seam. Implementations enforce the byte caps mid-stream
/// (erroring with `HtmlTooLarge`/`BinaryTooLarge`) rather than buffering an
/// oversized body first.
#[async_trait::async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch_once(&self, req: &UpstreamRequest) -> Result<UpstreamResponse>;
}

/// Fully assembled reply for one mirrored request.
#[derive(Debug, Clone)]
pub struct MirrorResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// `None` for HEAD.
    pub body: Option<Vec<u8>>,
}

pub fn is_html_content_type(ct: &str) -> bool {
    ct.to_ascii_lowercase().contains("text/html")
}

pub fn is_css_content_type(ct: &str) -> bool {
    ct.to_ascii_lowercase().contains("text/css")
}

/// Text-like per the size-guard policy: HTML, CSS, any `text/*`, and the
/// javascript/json families (which ship under several mime prefixes).
pub fn is_text_like_content_type(ct: &str) -> bool {
    let ct = ct.to_ascii_lowercase();
    ct.contains("text/") || ct.contains("javascript") || ct.contains("json")
}

/// `<scheme>://<host>[:<port>]` with default ports omitted. This string is the
/// mirror's authority boundary: only references resolving to it are rewritten.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_and_statuses_are_stable() {
        let cases: Vec<(Error, &str, u16)> = vec![
            (Error::InvalidUrl("x".into()), "invalid_url", 400),
            (Error::InvalidScheme("ftp".into()), "invalid_scheme", 400),
            (Error::MissingUrl, "missing_url", 400),
            (Error::CredentialsNotAllowed, "credentials_not_allowed", 400),
            (Error::Unauthorized, "unauthorized", 401),
            (Error::DomainNotAllowed("a.test".into()), "domain_not_allowed", 403),
            (Error::SsrfBlocked("127.0.0.1".into()), "ssrf_blocked", 403),
            (Error::MirrorNotFound, "mirror_not_found", 404),
            (Error::MethodNotAllowed, "method_not_allowed", 405),
            (Error::HtmlTooLarge, "html_too_large", 413),
            (Error::BinaryTooLarge, "binary_too_large", 413),
            (Error::ServiceDisabled, "service_disabled", 503),
            (Error::TooManyRedirects(5), "too_many_redirects", 502),
            (Error::DnsResolutionFailed("x".into()), "dns_resolution_failed", 502),
            (Error::UpstreamTimeout("x".into()), "upstream_timeout", 502),
            (Error::Upstream("x".into()), "upstream_error", 502),
            (Error::Cache("x".into()), "internal_error", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status, "status for {code}");
        }
    }

    #[test]
    fn event_kind_round_trips_through_identifier() {
        let kinds = [
            EventKind::Resolve,
            EventKind::ResolveFail,
            EventKind::ProxyError,
            EventKind::SsrfBlocked,
            EventKind::CacheHit,
            EventKind::CacheMiss,
            EventKind::CachePurge,
            EventKind::AdminAction,
            EventKind::UpstreamTimeout,
        ];
        for k in kinds {
            assert_eq!(EventKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(EventKind::parse("nope"), None);
    }

    #[test]
    fn allowlist_entry_defaults_apply_on_deserialize() {
        let e: AllowlistEntry =
            serde_json::from_str(r#"{"id":"example-com","host":"example.com"}"#).unwrap();
        assert!(!e.allow_subdomains);
        assert_eq!(e.schemes, vec!["https"]);
        assert!(e.enabled);
        assert!(e.label.is_none());
    }

    #[test]
    fn origin_of_omits_default_ports() {
        let u = Url::parse("https://example.com:443/a/b?q=1").unwrap();
        assert_eq!(origin_of(&u), "https://example.com");
        let u = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(origin_of(&u), "http://example.com:8080");
    }

    #[test]
    fn content_type_classification() {
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(!is_html_content_type("application/xhtml+xml"));
        assert!(is_css_content_type("text/css"));
        assert!(is_text_like_content_type("text/plain"));
        assert!(is_text_like_content_type("application/json; charset=utf-8"));
        assert!(is_text_like_content_type("application/x-javascript"));
        assert!(!is_text_like_content_type("image/png"));
        assert!(!is_text_like_content_type("application/octet-stream"));
    }
}
