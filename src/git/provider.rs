use super::{GitRepository, url_join};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const GITHUB_HOST: &str = "github.com";
const GITHUB_API_URL: &str = "https://api.github.com";
const HOOKS_PER_PAGE: u32 = 100;
const USER_AGENT: &str = concat!("environment-controller/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum GitProviderError {
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
}

/// What to register a webhook for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookArguments {
    pub owner: String,
    pub repo: String,
    pub url: String,
    pub secret: String,
}

/// The git provider operations the controller relies on
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Ensure a webhook pointing at `args.url` exists on the repository.
    ///
    /// Implementations should avoid creating duplicates for the same URL.
    async fn create_webhook(&self, args: &WebhookArguments) -> Result<(), GitProviderError>;
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
    #[serde(default)]
    config: HookConfigResponse,
}

#[derive(Debug, Default, Deserialize)]
struct HookConfigResponse {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateHookRequest<'a> {
    name: &'a str,
    active: bool,
    events: Vec<&'a str>,
    config: CreateHookConfig<'a>,
}

#[derive(Debug, Serialize)]
struct CreateHookConfig<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
    insecure_ssl: &'a str,
}

/// GitHub and GitHub Enterprise REST API client
pub struct GitHubProvider {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubProvider {
    /// Provider for the server hosting `repository`.
    ///
    /// github.com uses `https://api.github.com`, other hosts are treated as
    /// GitHub Enterprise at `<server>/api/v3`.
    pub fn for_repository(
        repository: &GitRepository,
        token: Option<String>,
    ) -> Result<Self, GitProviderError> {
        let api_url = if repository.host() == GITHUB_HOST {
            GITHUB_API_URL.to_string()
        } else {
            url_join(&[&repository.server_url, "api/v3"])
        };
        Self::new(api_url, token)
    }

    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Result<Self, GitProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(GitProviderError::Client)?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            token,
        })
    }

    fn hooks_url(&self, owner: &str, repo: &str) -> String {
        url_join(&[&self.api_url, "repos", owner, repo, "hooks"])
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, GitProviderError> {
        let response = request
            .send()
            .await
            .map_err(|source| GitProviderError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response".to_string());
            return Err(GitProviderError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }

        Ok(response)
    }

    /// Walk every page of the repository's hooks looking for one posting to
    /// `target`
    async fn find_hook(
        &self,
        owner: &str,
        repo: &str,
        target: &str,
    ) -> Result<Option<HookResponse>, GitProviderError> {
        let mut next = Some(format!(
            "{}?per_page={}",
            self.hooks_url(owner, repo),
            HOOKS_PER_PAGE
        ));

        while let Some(url) = next.take() {
            let response = self
                .send(self.request(reqwest::Method::GET, &url), &url)
                .await?;
            next = next_page(response.headers());

            let hooks: Vec<HookResponse> =
                response.json().await.map_err(|source| GitProviderError::Request {
                    url: url.clone(),
                    source,
                })?;
            if let Some(hook) = hooks
                .into_iter()
                .find(|hook| hook.config.url.as_deref() == Some(target))
            {
                return Ok(Some(hook));
            }
        }

        Ok(None)
    }
}

/// The `rel="next"` target of a GitHub `Link` pagination header
fn next_page(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts
            .next()?
            .trim()
            .strip_prefix('<')?
            .strip_suffix('>')?;
        parts
            .any(|param| param.trim() == r#"rel="next""#)
            .then(|| target.to_string())
    })
}

#[async_trait]
impl GitProvider for GitHubProvider {
    async fn create_webhook(&self, args: &WebhookArguments) -> Result<(), GitProviderError> {
        if let Some(hook) = self.find_hook(&args.owner, &args.repo, &args.url).await? {
            info!(
                "Webhook {} already exists on {}/{} for {}",
                hook.id, args.owner, args.repo, args.url
            );
            return Ok(());
        }

        debug!(
            "Creating webhook on {}/{} for {}",
            args.owner, args.repo, args.url
        );

        let body = CreateHookRequest {
            name: "web",
            active: true,
            events: vec!["*"],
            config: CreateHookConfig {
                url: &args.url,
                content_type: "json",
                secret: &args.secret,
                insecure_ssl: "0",
            },
        };
        let url = self.hooks_url(&args.owner, &args.repo);
        self.send(self.request(reqwest::Method::POST, &url).json(&body), &url)
            .await?;

        info!(
            "Created webhook on {}/{} for {}",
            args.owner, args.repo, args.url
        );
        Ok(())
    }
}
