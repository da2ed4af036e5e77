//! GitHub REST client: repository search, commit resolution, archive download.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

use crate::manifest::RepoIdentity;

const API_BASE: &str = "https://api.github.com";

/// Results per search page (API maximum)
pub const SEARCH_PER_PAGE: u32 = 100;

/// Search response envelope
#[derive(Debug, Deserialize)]
struct SearchRepositoriesResponse {
    items: Vec<RepoIdentity>,
}

/// Commit response from `GET {repo_url}/commits/{branch}`
#[derive(Debug, Deserialize)]
struct RepoCommitResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimit,
    search: RateLimit,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

/// GitHub API client
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    debug: bool,
}

impl GitHubClient {
    pub fn new(token: String, debug: bool) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gh-corpus/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, token, debug }
    }

    /// Build request with auth and API version headers
    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Send request with optional debug timing
    async fn send_request(&self, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        let start = std::time::Instant::now();
        let result = self.request(url).send().await;
        if self.debug {
            let now = chrono::Local::now().format("%H:%M:%S%.3f");
            // Single atomic line to avoid interleaving with other workers
            eprintln!("\x1b[90m[{}] GET {} ... {}ms\x1b[0m", now, url, start.elapsed().as_millis());
        }
        result
    }

    /// GET with retry: transient statuses back off exponentially, rate limits
    /// wait for the advertised reset (capped at 2 minutes). A non-success
    /// status after the retry budget is an error carrying the response body.
    async fn rest_get(&self, url: &str) -> Result<reqwest::Response> {
        for attempt in 0..5 {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * (1 << attempt.min(3)));
                tokio::time::sleep(delay).await;
            }

            let response = match self.send_request(url).await {
                Ok(r) => r,
                Err(e) => {
                    if attempt == 4 {
                        anyhow::bail!("Request failed: {}", e);
                    }
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }

            // Retry on transient errors
            if status == reqwest::StatusCode::BAD_GATEWAY
                || status == reqwest::StatusCode::GATEWAY_TIMEOUT
                || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            {
                continue;
            }

            // On rate limit, wait for the reset advertised in the headers
            if status == reqwest::StatusCode::FORBIDDEN
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let reset = response
                    .headers()
                    .get("x-ratelimit-reset")
                    .and_then(|h| h.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(now + 60);

                let wait_secs = if reset > now { (reset - now).min(120) } else { 2 };
                eprintln!(
                    "\x1b[33m[github]\x1b[0m rate limited ({}), waiting {}s...",
                    status, wait_secs
                );
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                continue;
            }

            // Non-retryable: surface the body as the diagnostic
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error {}: {}", status, body);
        }

        anyhow::bail!("Request failed after 5 retries")
    }

    /// Search repositories by language, one page at a time
    pub async fn search_repositories(
        &self,
        term: &str,
        sort: &str,
        page: u32,
    ) -> Result<Vec<RepoIdentity>> {
        let url = format!(
            "{}/search/repositories?q=language:{}&sort={}&page={}&per_page={}",
            API_BASE, term, sort, page, SEARCH_PER_PAGE
        );

        let response = self.rest_get(&url).await?;
        let parsed: SearchRepositoriesResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;
        Ok(parsed.items)
    }

    /// Latest commit SHA on the given branch
    pub async fn latest_commit_sha(&self, repo_url: &str, branch: &str) -> Result<String> {
        let url = format!("{}/commits/{}", repo_url, branch);

        let response = self.rest_get(&url).await?;
        let commit: RepoCommitResponse = response
            .json()
            .await
            .context("Failed to parse commit response")?;
        Ok(commit.sha)
    }

    /// Download a repository archive (zipball) into memory
    pub async fn download_archive(&self, url: &str) -> Result<Bytes> {
        let response = self.rest_get(url).await?;
        response
            .bytes()
            .await
            .context("Failed to read archive body")
    }

    /// Check core + search rate limit status
    pub async fn rate_limit(&self) -> Result<(RateLimit, RateLimit)> {
        let url = format!("{}/rate_limit", API_BASE);
        let response = self.rest_get(&url).await?;
        let data: RateLimitResponse = response
            .json()
            .await
            .context("Failed to parse rate limit response")?;
        Ok((data.resources.core, data.resources.search))
    }
}

/// Archive URL for a repository pinned to a commit
pub fn zipball_url(repo_url: &str, commit_sha: &str) -> String {
    format!("{}/zipball/{}", repo_url, commit_sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_response() {
        let json = r#"{
            "total_count": 2,
            "incomplete_results": false,
            "items": [
                {
                    "full_name": "torvalds/linux",
                    "default_branch": "master",
                    "url": "https://api.github.com/repos/torvalds/linux",
                    "stargazers_count": 150000
                },
                {
                    "full_name": "rust-lang/rust",
                    "default_branch": "master",
                    "url": "https://api.github.com/repos/rust-lang/rust"
                }
            ]
        }"#;

        let parsed: SearchRepositoriesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[0].full_name, "torvalds/linux");
        assert_eq!(parsed.items[1].url, "https://api.github.com/repos/rust-lang/rust");
    }

    #[test]
    fn test_parse_commit_response() {
        let json = r#"{"sha": "abc123def", "commit": {"message": "hi"}}"#;
        let parsed: RepoCommitResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.sha, "abc123def");
    }

    #[test]
    fn test_zipball_url() {
        assert_eq!(
            zipball_url("https://api.github.com/repos/a/b", "abc123"),
            "https://api.github.com/repos/a/b/zipball/abc123"
        );
    }
}
