mod credentials;
mod provider;

pub use credentials::{GitCredentials, GitCredentialsError, StoreCredentials};
pub use provider::{GitHubProvider, GitProvider, GitProviderError, WebhookArguments};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GitUrlError {
    #[error("invalid git URL {url}: {reason}")]
    Invalid { url: String, reason: String },
}

/// Coordinates of a repository on a git server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRepository {
    /// Provider URL, e.g. `https://github.com`
    pub server_url: String,
    pub owner: String,
    pub name: String,
}

impl GitRepository {
    /// Parse an http(s), `ssh://` or scp-style (`git@host:owner/repo.git`) URL.
    ///
    /// SSH forms map to an `https` provider URL on the same host.
    pub fn parse(git_url: &str) -> Result<Self, GitUrlError> {
        let invalid = |reason: &str| GitUrlError::Invalid {
            url: git_url.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = git_url.trim();
        let mut scheme = "https";
        let (host, path) = if trimmed.contains("://") {
            let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
            if url.scheme() == "http" {
                scheme = "http";
            }
            let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
            let host = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            (host, url.path().to_string())
        } else if let Some((user_host, path)) = trimmed.split_once(':') {
            let host = user_host.rsplit('@').next().unwrap_or(user_host);
            (host.to_string(), path.to_string())
        } else {
            return Err(invalid("unsupported URL format"));
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let (owner, name) = path
            .rsplit_once('/')
            .ok_or_else(|| invalid("expected <owner>/<repository> in path"))?;
        if owner.is_empty() || name.is_empty() {
            return Err(invalid("expected <owner>/<repository> in path"));
        }

        Ok(Self {
            server_url: format!("{}://{}", scheme, host),
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Host of the provider URL, without scheme
    pub fn host(&self) -> &str {
        host_of(&self.server_url)
    }

    /// Browsable URL of the repository
    pub fn url(&self) -> String {
        url_join(&[&self.server_url, &self.owner, &self.name])
    }
}

/// Join URL fragments with exactly one `/` between them.
pub fn url_join(parts: &[&str]) -> String {
    let mut joined = String::new();
    for (i, part) in parts.iter().enumerate() {
        let part = if i == 0 {
            part.trim_end_matches('/')
        } else {
            part.trim_matches('/')
        };
        if part.is_empty() {
            continue;
        }
        if !joined.is_empty() {
            joined.push('/');
        }
        joined.push_str(part);
    }
    joined
}

fn host_of(server_url: &str) -> &str {
    let without_scheme = server_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(server_url);
    without_scheme.trim_end_matches('/')
}
