//! Single-hop upstream fetcher on reqwest.
//!
//! Redirects are never followed here: the pipeline re-validates every hop
//! against the guard and the allowlist, so the client runs with
//! `Policy::none()`. Body reads are streamed and refused mid-stream once they
//! cross the applicable size cap, so an oversized upstream never gets fully
//! buffered.

use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;
use webmirror_core::{
    is_html_content_type, Error, MirrorMethod, Result, UpstreamFetcher, UpstreamRequest,
    UpstreamResponse,
};

const USER_AGENT: &str = concat!("webmirror/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Upstream(e.to_string()))?;
        Ok(Self { client })
    }
}

fn classify(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout(e.to_string())
    } else {
        Error::Upstream(e.to_string())
    }
}

#[async_trait::async_trait]
impl UpstreamFetcher for ReqwestFetcher {
    async fn fetch_once(&self, req: &UpstreamRequest) -> Result<UpstreamResponse> {
        let mut rb = match req.method {
            MirrorMethod::Get => self.client.get(req.url.clone()),
            MirrorMethod::Head => self.client.head(req.url.clone()),
        };
        rb = rb.timeout(Duration::from_millis(req.timeout_ms));
        for (k, v) in &req.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                rb = rb.header(name, value);
            }
        }

        let resp = rb.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut headers = BTreeMap::new();
        for (k, v) in resp.headers().iter() {
            if let Ok(s) = v.to_str() {
                headers.insert(k.as_str().to_string(), s.to_string());
            }
        }

        // HEAD has no body; redirect bodies are interstitial noise the
        // pipeline never serves.
        if req.method == MirrorMethod::Head || (300..400).contains(&status) {
            return Ok(UpstreamResponse {
                status,
                headers,
                content_type,
                body: Vec::new(),
            });
        }

        let is_html = content_type.as_deref().is_some_and(is_html_content_type);
        let cap = if is_html {
            req.max_html_bytes
        } else {
            req.max_binary_bytes
        } as usize;

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            if body.len().saturating_add(chunk.len()) > cap {
                return Err(if is_html {
                    Error::HtmlTooLarge
                } else {
                    Error::BinaryTooLarge
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(UpstreamResponse {
            status,
            headers,
            content_type,
            body,
        })
    }
}
