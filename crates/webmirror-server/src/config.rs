//! Environment configuration. Loaded once at startup; any invalid value is a
//! startup failure (non-zero exit), never a silently-applied default.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8085;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_CACHE_TTL_SECONDS: u64 = 7_200;
const DEFAULT_CACHE_MAX_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 12_000;
const DEFAULT_MAX_HTML_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_MAX_BINARY_BYTES: u64 = 25 * 1024 * 1024;
const MIN_TOKEN_CHARS: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub public_base_url: Option<String>,
    pub internal_token: String,
    pub allowlist_path: PathBuf,
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_ttl_seconds: u64,
    pub cache_max_bytes: u64,
    pub upstream_timeout_ms: u64,
    pub max_html_bytes: u64,
    pub max_binary_bytes: u64,
    pub enable_http: bool,
    pub disable_service: bool,
    pub log_file: Option<PathBuf>,
    pub unsafe_allow_private: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let internal_token = env_opt("MIRROR_INTERNAL_TOKEN")
            .context("MIRROR_INTERNAL_TOKEN is required")?;
        if internal_token.chars().count() < MIN_TOKEN_CHARS {
            bail!("MIRROR_INTERNAL_TOKEN must be at least {MIN_TOKEN_CHARS} characters");
        }

        Ok(Self {
            host: env_opt("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: env_parse("PORT", DEFAULT_PORT)?,
            public_base_url: env_opt("MIRROR_PUBLIC_BASE_URL"),
            internal_token,
            allowlist_path: env_path("MIRROR_ALLOWLIST_PATH", "data/allowlist.json"),
            db_path: env_path("MIRROR_DB_PATH", "data/mirror.db"),
            cache_dir: env_path("MIRROR_CACHE_DIR", "data/cache"),
            cache_ttl_seconds: env_parse("MIRROR_CACHE_TTL_SECONDS", DEFAULT_CACHE_TTL_SECONDS)?,
            cache_max_bytes: env_parse("MIRROR_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES)?,
            upstream_timeout_ms: env_parse(
                "MIRROR_UPSTREAM_TIMEOUT_MS",
                DEFAULT_UPSTREAM_TIMEOUT_MS,
            )?,
            max_html_bytes: env_parse("MIRROR_MAX_HTML_BYTES", DEFAULT_MAX_HTML_BYTES)?,
            max_binary_bytes: env_parse("MIRROR_MAX_BINARY_BYTES", DEFAULT_MAX_BINARY_BYTES)?,
            enable_http: env_bool("MIRROR_ENABLE_HTTP"),
            disable_service: env_bool("MIRROR_DISABLE_SERVICE"),
            log_file: env_opt("MIRROR_LOG_FILE").map(PathBuf::from),
            unsafe_allow_private: env_bool("MIRROR_UNSAFE_ALLOW_PRIVATE"),
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env_opt(key).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(key) {
        Some(v) => v.parse::<T>().with_context(|| format!("{key}={v} is not valid")),
        None => Ok(default),
    }
}

fn env_bool(key: &str) -> bool {
    matches!(
        env_opt(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
