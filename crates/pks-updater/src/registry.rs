//! Remote release registry client.
//!
//! Talks to a GitHub-compatible releases API:
//!
//! - `GET {api}/repos/{owner}/{repo}/releases/latest`
//! - `GET {api}/repos/{owner}/{repo}/releases/tags/{tag}`
//! - `GET {api}/repos/{owner}/{repo}/releases?per_page=N`
//! - `GET {api}/repos/{owner}/{repo}/releases/assets/{id}` with `Accept: application/octet-stream`
//! - `GET {api}/user` and `GET {api}/rate_limit`
//!
//! Every response refreshes the rate-limit budget from the `x-ratelimit-*`
//! headers. When the budget is spent the client sleeps until the reset time
//! before sending the next request.

use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION};
use reqwest::{Response, StatusCode};
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::UpdateError;

/// Fixed client identifier sent with every request.
pub const USER_AGENT: &str = concat!("puenkaset-updater/", env!("CARGO_PKG_VERSION"));

/// Media type for JSON API responses.
const API_MEDIA_TYPE: &str = "application/vnd.github+json";

/// Media type that makes the asset endpoint return raw bytes.
const BINARY_MEDIA_TYPE: &str = "application/octet-stream";

/// Added to reset waits; the reset header only has whole-second precision.
const RESET_SLACK: Duration = Duration::from_secs(1);

/// Pause between retried registry queries.
const QUERY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Strip a leading `v`/`V` from a release tag and parse it as a semantic version.
pub fn parse_release_version(tag: &str) -> Result<Version, UpdateError> {
    let trimmed = tag.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Version::parse(bare).map_err(|e| UpdateError::VersionParseError(format!("{}: {}", tag, e)))
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: u64,
    pub name: String,
    /// Public download URL
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    pub size: u64,
    #[serde(default)]
    pub content_type: String,
}

/// Release metadata as published on the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub id: u64,
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Release notes (markdown)
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl ReleaseInfo {
    /// Semantic version of the tag.
    pub fn version(&self) -> Result<Version, UpdateError> {
        parse_release_version(&self.tag_name)
    }

    /// Release notes, empty when the release has none.
    pub fn release_notes(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }

    /// Pick the installable asset: the first installer or archive, else the first asset.
    pub fn installable_asset(&self) -> Option<&Asset> {
        self.assets
            .iter()
            .find(|a| {
                let name = a.name.to_ascii_lowercase();
                name.ends_with(".exe") || name.ends_with(".zip")
            })
            .or_else(|| self.assets.first())
    }
}

/// Where and how to fetch an asset's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLocator {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Incremental asset download progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssetProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub progress: f64,
}

/// Rate-limit budget as last reported by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Tracks the rate-limit budget across requests.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    state: Mutex<RateLimitStatus>,
}

impl RateLimitTracker {
    /// Current view of the budget.
    pub fn snapshot(&self) -> RateLimitStatus {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    /// Replace the tracked budget.
    pub fn update(&self, status: RateLimitStatus) {
        if let Ok(mut state) = self.state.lock() {
            *state = status;
        }
    }

    /// Refresh from `x-ratelimit-*` response headers; absent headers keep old values.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let read = |name: &str| -> Option<i64> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        };

        if let Ok(mut state) = self.state.lock() {
            if let Some(remaining) = read("x-ratelimit-remaining") {
                state.remaining = u32::try_from(remaining).ok();
            }
            if let Some(limit) = read("x-ratelimit-limit") {
                state.limit = u32::try_from(limit).ok();
            }
            if let Some(reset) = read("x-ratelimit-reset") {
                state.reset_at = Utc.timestamp_opt(reset, 0).single();
            }
        }
    }

    /// How long to wait before the next request, if the budget is spent.
    pub fn wait_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = self.snapshot();
        match (state.remaining, state.reset_at) {
            (Some(0), Some(reset)) if reset > now => {
                (reset - now).to_std().ok().map(|d| d + RESET_SLACK)
            }
            _ => None,
        }
    }
}

/// Source of release metadata consumed by the update manager.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Latest release, optionally considering pre-releases.
    async fn fetch_latest(&self, include_prerelease: bool) -> Result<ReleaseInfo, UpdateError>;

    /// Release for a specific tag.
    async fn fetch_by_tag(&self, tag: &str) -> Result<ReleaseInfo, UpdateError>;

    /// Request target for an asset's bytes.
    fn locate_asset(&self, asset: &Asset) -> AssetLocator;

    /// Replace the token attached to requests.
    fn install_token(&self, token: Option<String>);

    /// Whether a token is attached to requests.
    fn has_token(&self) -> bool;

    /// Check a candidate token against the live service without installing it.
    async fn verify_token(&self, token: &str) -> bool;

    /// Query the current rate-limit budget.
    async fn query_rate_limit(&self) -> Result<RateLimitStatus, UpdateError>;
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    rate: RateLimitRate,
}

#[derive(Debug, Deserialize)]
struct RateLimitRate {
    limit: u32,
    remaining: u32,
    reset: i64,
}

/// HTTP client for the release registry.
pub struct RemoteReleaseClient {
    client: reqwest::Client,
    config: RegistryConfig,
    token: RwLock<Option<String>>,
    rate_limit: RateLimitTracker,
}

impl RemoteReleaseClient {
    /// Create a client for the configured repository.
    pub fn new(config: RegistryConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| UpdateError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        let token = config.token.clone().filter(|t| !t.trim().is_empty());
        Ok(Self {
            client,
            config,
            token: RwLock::new(token),
            rate_limit: RateLimitTracker::default(),
        })
    }

    /// Tracked rate-limit state.
    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }

    /// Tracked rate-limit state without a request.
    pub fn rate_limit_snapshot(&self) -> RateLimitStatus {
        self.rate_limit.snapshot()
    }

    /// Replace the token attached to requests.
    pub fn set_auth_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token.filter(|t| !t.trim().is_empty());
        }
    }

    /// Currently attached token.
    pub fn auth_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn repo_url(&self, suffix: &str) -> String {
        self.api_url(&format!(
            "/repos/{}/{}{}",
            self.config.owner, self.config.repo, suffix
        ))
    }

    /// Sleep until the rate-limit reset when the budget is spent.
    pub async fn wait_for_rate_limit(&self) {
        if let Some(wait) = self.rate_limit.wait_duration(Utc::now()) {
            warn!("Rate limit exhausted, waiting {:?} for reset", wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn send(
        &self,
        url: &str,
        accept: &str,
        token: Option<&str>,
    ) -> Result<Response, UpdateError> {
        self.wait_for_rate_limit().await;

        debug!("GET {}", url);
        let mut request = self.client.get(url).header(ACCEPT, accept);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("token {}", token));
        }

        let response = request.send().await?;
        self.rate_limit.update_from_headers(response.headers());
        check_status(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, UpdateError> {
        let attempts = self.config.retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let token = self.auth_token();
            let result = match self.send(url, API_MEDIA_TYPE, token.as_deref()).await {
                Ok(response) => response.json::<T>().await.map_err(UpdateError::from),
                Err(e) => Err(e),
            };

            match result {
                Err(UpdateError::Network(reason)) if attempt < attempts => {
                    warn!(
                        "Registry request failed (attempt {}/{}): {}",
                        attempt, attempts, reason
                    );
                    tokio::time::sleep(QUERY_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    /// Latest published, non-prerelease release.
    pub async fn get_latest_release(&self) -> Result<ReleaseInfo, UpdateError> {
        self.get_json(&self.repo_url("/releases/latest")).await
    }

    /// Release for `tag`.
    pub async fn get_release_by_tag(&self, tag: &str) -> Result<ReleaseInfo, UpdateError> {
        self.get_json(&self.repo_url(&format!("/releases/tags/{}", tag)))
            .await
    }

    /// Most recent releases, newest first as the registry orders them.
    pub async fn list_releases(&self, per_page: u32) -> Result<Vec<ReleaseInfo>, UpdateError> {
        self.get_json(&self.repo_url(&format!("/releases?per_page={}", per_page)))
            .await
    }

    /// Greatest non-draft release by semantic version, pre-releases included.
    pub async fn latest_release_including_prereleases(&self) -> Result<ReleaseInfo, UpdateError> {
        let releases = self.list_releases(30).await?;
        releases
            .into_iter()
            .filter(|r| !r.draft)
            .filter_map(|r| r.version().ok().map(|v| (v, r)))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, r)| r)
            .ok_or_else(|| UpdateError::NotFound("no published releases".to_string()))
    }

    /// Stream an asset to `dest`, reporting progress after every chunk.
    ///
    /// # Returns
    ///
    /// Number of bytes written.
    pub async fn download_asset<F>(
        &self,
        asset_id: u64,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<u64, UpdateError>
    where
        F: FnMut(AssetProgress) + Send,
    {
        let url = self.repo_url(&format!("/releases/assets/{}", asset_id));
        let token = self.auth_token();
        let response = self.send(&url, BINARY_MEDIA_TYPE, token.as_deref()).await?;
        let total_bytes = response.content_length().unwrap_or(0);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded_bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::Network(e.to_string()))?;
            file.write_all(&chunk).await?;
            downloaded_bytes += chunk.len() as u64;

            let progress = if total_bytes > 0 {
                downloaded_bytes as f64 / total_bytes as f64 * 100.0
            } else {
                0.0
            };
            on_progress(AssetProgress {
                downloaded_bytes,
                total_bytes,
                progress,
            });
        }
        file.flush().await?;

        info!("Downloaded asset {} ({} bytes)", asset_id, downloaded_bytes);
        Ok(downloaded_bytes)
    }

    /// Whether the attached token is accepted. Transport errors count as `false`.
    pub async fn validate_token(&self) -> bool {
        match self.auth_token() {
            Some(token) => self.validate_token_value(&token).await,
            None => false,
        }
    }

    /// Whether `token` is accepted, without attaching it to the client.
    pub async fn validate_token_value(&self, token: &str) -> bool {
        match self.send(&self.api_url("/user"), API_MEDIA_TYPE, Some(token)).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Token validation failed: {}", e);
                false
            }
        }
    }

    /// Fetch the current budget from `/rate_limit` and record it.
    pub async fn check_rate_limit(&self) -> Result<RateLimitStatus, UpdateError> {
        let body: RateLimitResponse = self.get_json(&self.api_url("/rate_limit")).await?;
        let status = RateLimitStatus {
            remaining: Some(body.rate.remaining),
            limit: Some(body.rate.limit),
            reset_at: Utc.timestamp_opt(body.rate.reset, 0).single(),
        };
        self.rate_limit.update(status);
        Ok(status)
    }
}

#[async_trait]
impl ReleaseSource for RemoteReleaseClient {
    async fn fetch_latest(&self, include_prerelease: bool) -> Result<ReleaseInfo, UpdateError> {
        if include_prerelease {
            self.latest_release_including_prereleases().await
        } else {
            self.get_latest_release().await
        }
    }

    async fn fetch_by_tag(&self, tag: &str) -> Result<ReleaseInfo, UpdateError> {
        self.get_release_by_tag(tag).await
    }

    fn locate_asset(&self, asset: &Asset) -> AssetLocator {
        match self.auth_token() {
            Some(token) => AssetLocator {
                url: self.repo_url(&format!("/releases/assets/{}", asset.id)),
                headers: vec![
                    (ACCEPT.to_string(), BINARY_MEDIA_TYPE.to_string()),
                    (AUTHORIZATION.to_string(), format!("token {}", token)),
                ],
            },
            None => AssetLocator {
                url: asset.download_url.clone(),
                headers: Vec::new(),
            },
        }
    }

    fn install_token(&self, token: Option<String>) {
        self.set_auth_token(token);
    }

    fn has_token(&self) -> bool {
        self.auth_token().is_some()
    }

    async fn verify_token(&self, token: &str) -> bool {
        self.validate_token_value(token).await
    }

    async fn query_rate_limit(&self) -> Result<RateLimitStatus, UpdateError> {
        self.check_rate_limit().await
    }
}

fn check_status(response: Response) -> Result<Response, UpdateError> {
    let status = response.status();
    let url = response.url().to_string();
    match status {
        s if s.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => Err(UpdateError::AuthFailed(url)),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            Err(UpdateError::RateLimited(url))
        }
        StatusCode::NOT_FOUND => Err(UpdateError::NotFound(url)),
        s => Err(UpdateError::Network(format!(
            "unexpected status {} from {}",
            s.as_u16(),
            url
        ))),
    }
}
