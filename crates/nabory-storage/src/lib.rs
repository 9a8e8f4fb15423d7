//! Page fetching and catalog persistence for the funding-call pipeline.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod catalog;
mod postgres;

pub use catalog::{
    CatalogStore, MemoryCatalogStore, OpportunityListing, OpportunityPage, OpportunityQuery,
    SeedOutcome, SourceSummary, StoreError,
};
pub use postgres::PgCatalogStore;

pub const CRATE_NAME: &str = "nabory-storage";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; nabory-bot/0.1; funding call aggregator)";

/// Hosts whose certificate chains are known to be broken; verification is relaxed for them only.
pub const RELAXED_TLS_DOMAINS: &[&str] = &["funduszeue.wzp.pl", "funduszeueswietokrzyskie.pl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureKind {
    Network,
    Timeout,
    Tls,
    HttpStatus,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("tls failure for {url}: {message}")]
    Tls { url: String, message: String },
    #[error("network failure for {url}: {message}")]
    Network { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchFailureKind {
        match self {
            FetchError::Timeout { .. } => FetchFailureKind::Timeout,
            FetchError::Tls { .. } => FetchFailureKind::Tls,
            FetchError::Network { .. } => FetchFailureKind::Network,
            FetchError::HttpStatus { .. } => FetchFailureKind::HttpStatus,
        }
    }
}

/// Retrieves the raw content of a single page. Implementations never retry.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub relaxed_tls_domains: Vec<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            relaxed_tls_domains: RELAXED_TLS_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// reqwest-backed fetcher holding a strict client and a relaxed one for allow-listed hosts.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    strict: reqwest::Client,
    relaxed: reqwest::Client,
    relaxed_tls_domains: Vec<String>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let builder = || {
            reqwest::Client::builder()
                .gzip(true)
                .brotli(true)
                .timeout(config.timeout)
                .user_agent(config.user_agent.clone())
        };

        let strict = builder().build().context("building reqwest client")?;
        let relaxed = builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("building relaxed-tls reqwest client")?;

        Ok(Self {
            strict,
            relaxed,
            relaxed_tls_domains: config
                .relaxed_tls_domains
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        })
    }

    /// True when the URL host is an allow-listed domain or one of its subdomains.
    pub fn requires_relaxed_tls(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.relaxed_tls_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
    }

    fn client_for(&self, url: &str) -> &reqwest::Client {
        if self.requires_relaxed_tls(url) {
            &self.relaxed
        } else {
            &self.strict
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let relaxed = self.requires_relaxed_tls(url);
        let span = info_span!("http_fetch", url, relaxed_tls = relaxed);

        async move {
            let resp = self
                .client_for(url)
                .get(url)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(url, err))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp
                .text()
                .await
                .map_err(|err| classify_reqwest_error(url, err))?;
            debug!(bytes = body.len(), "fetched page");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

/// Classifies on the error chain alone; the request url never takes part.
pub fn classify_reqwest_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout {
            url: url.to_string(),
        };
    }
    let err = err.without_url();
    let message = error_chain_message(&err);
    if is_tls_failure(&message) {
        FetchError::Tls {
            url: url.to_string(),
            message,
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            message,
        }
    }
}

fn is_tls_failure(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn error_chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}
