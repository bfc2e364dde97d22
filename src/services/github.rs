//! Pull Request Hosting
//!
//! Opens pull requests on GitHub, falling back to a compare link when there
//! is no credential or the API call fails. Never returns an error: the
//! worst case is a link the user opens by hand.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::models::credential::Credential;
use crate::utils::text::{truncate_chars, MAX_ERROR_OUTPUT_CHARS};

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestKind {
    PullRequest,
    /// Manual "compare branches" link
    Compare,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestResult {
    pub url: String,
    pub kind: PullRequestKind,
}

impl PullRequestResult {
    pub fn is_compare_link(&self) -> bool {
        self.kind == PullRequestKind::Compare
    }
}

/// What to open: `head` into `base` on `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRequest {
    /// `owner/repo`
    pub full_name: String,
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

impl PullRequestRequest {
    /// Single-task PR: titled after the task, body from its description.
    pub fn for_task(
        full_name: &str,
        head: &str,
        base: &str,
        title: &str,
        description: Option<&str>,
    ) -> Self {
        let body = match description.map(str::trim).filter(|d| !d.is_empty()) {
            Some(description) => description.to_string(),
            None => format!("Automated PR created by Board Runner\n\n## Task\n{}", title),
        };
        Self {
            full_name: full_name.to_string(),
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            body,
        }
    }

    /// Batch PR listing every merged task title.
    pub fn for_batch(full_name: &str, head: &str, base: &str, titles: &[String]) -> Self {
        let list = titles
            .iter()
            .map(|t| format!("- {}", t))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            full_name: full_name.to_string(),
            head: head.to_string(),
            base: base.to_string(),
            title: format!("Batch: {} tasks", titles.len()),
            body: format!("Automated batch PR by Board Runner\n\n## Tasks\n{}", list),
        }
    }
}

#[async_trait]
pub trait PullRequestHost: Send + Sync {
    async fn open_pull_request(
        &self,
        request: &PullRequestRequest,
        credential: Option<&Credential>,
    ) -> PullRequestResult;
}

#[derive(Debug, Deserialize)]
struct CreatedPullRequest {
    html_url: String,
}

/// GitHub REST client
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    web_url: String,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, web_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            web_url: web_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `<web>/<owner>/<repo>/compare/<base>...<head>`
    pub fn compare_url(&self, request: &PullRequestRequest) -> String {
        format!(
            "{}/{}/compare/{}...{}",
            self.web_url, request.full_name, request.base, request.head
        )
    }

    async fn create(
        &self,
        request: &PullRequestRequest,
        credential: &Credential,
    ) -> Result<String, String> {
        let response = self
            .client
            .post(format!("{}/repos/{}/pulls", self.api_url, request.full_name))
            .bearer_auth(credential.expose())
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .header(reqwest::header::USER_AGENT, "board-runner")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&json!({
                "title": request.title,
                "head": request.head,
                "base": request.base,
                "body": request.body,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(truncate_chars(
                &format!("{}: {}", status, body),
                MAX_ERROR_OUTPUT_CHARS,
            ));
        }

        let created: CreatedPullRequest = response.json().await.map_err(|e| e.to_string())?;
        Ok(created.html_url)
    }
}

#[async_trait]
impl PullRequestHost for GitHubClient {
    async fn open_pull_request(
        &self,
        request: &PullRequestRequest,
        credential: Option<&Credential>,
    ) -> PullRequestResult {
        let compare = PullRequestResult {
            url: self.compare_url(request),
            kind: PullRequestKind::Compare,
        };

        let Some(credential) = credential else {
            info!(head = %request.head, "no credential, returning compare link");
            return compare;
        };

        match self.create(request, credential).await {
            Ok(url) => {
                info!(%url, head = %request.head, "pull request created");
                PullRequestResult {
                    url,
                    kind: PullRequestKind::PullRequest,
                }
            }
            Err(e) => {
                warn!(head = %request.head, error = %e, "pull request creation failed, falling back to compare link");
                compare
            }
        }
    }
}
