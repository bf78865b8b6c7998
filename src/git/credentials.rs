use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum GitCredentialsError {
    #[error("failed to run git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {args} exited with {status}: {stderr}")]
    Git {
        args: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("invalid git server URL {url}: {reason}")]
    InvalidServer { url: String, reason: String },
    #[error("failed to write git credentials to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Local git configuration needed before a pipeline can clone the repository
#[async_trait]
pub trait GitCredentials: Send + Sync {
    /// One-off setup of git's user identity and credential helper
    async fn init(&self) -> Result<(), GitCredentialsError>;

    /// Rewrite the stored credentials for the git server
    async fn refresh(&self) -> Result<(), GitCredentialsError>;
}

/// Owner read/write only, the store file holds a plaintext token
#[cfg(unix)]
const STORE_FILE_MODE: u32 = 0o600;

/// Credentials kept in a git `store` helper file
pub struct StoreCredentials {
    server_url: String,
    username: String,
    token: Option<String>,
    path: PathBuf,
}

impl StoreCredentials {
    /// Credentials for `server_url`, written to `$HOME/.git-credentials`
    pub fn new(server_url: &str, username: &str, token: Option<String>) -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self {
            server_url: server_url.to_string(),
            username: username.to_string(),
            token,
            path: home.join(".git-credentials"),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// The `store` helper line for the configured server
    fn credential_line(&self, token: &str) -> Result<String, GitCredentialsError> {
        let invalid = |reason: String| GitCredentialsError::InvalidServer {
            url: self.server_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.server_url).map_err(|e| invalid(e.to_string()))?;
        url.set_username(&self.username)
            .map_err(|_| invalid("cannot carry credentials".to_string()))?;
        url.set_password(Some(token))
            .map_err(|_| invalid("cannot carry credentials".to_string()))?;

        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    async fn write_store_file(&self, contents: &[u8]) -> std::io::Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(STORE_FILE_MODE);

        let mut file = options.open(&self.path).await?;
        // mode only applies on creation
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(STORE_FILE_MODE))
                .await?;
        }
        file.write_all(contents).await?;
        file.flush().await
    }

    async fn git_config(&self, key: &str, value: &str) -> Result<(), GitCredentialsError> {
        let args = ["config", "--global", key, value];
        let args_display = args.join(" ");
        debug!("Running git {}", args_display);

        let output = Command::new("git")
            .args(args)
            .output()
            .await
            .map_err(|source| GitCredentialsError::Spawn {
                args: args_display.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GitCredentialsError::Git {
                args: args_display,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitCredentials for StoreCredentials {
    async fn init(&self) -> Result<(), GitCredentialsError> {
        info!("Configuring git user {} and credential helper", self.username);
        self.git_config("user.name", &self.username).await?;
        self.git_config("user.email", &format!("{}@users.noreply.github.com", self.username))
            .await?;
        self.git_config(
            "credential.helper",
            &format!("store --file {}", self.path.display()),
        )
        .await?;
        self.refresh().await
    }

    async fn refresh(&self) -> Result<(), GitCredentialsError> {
        let Some(token) = self.token.as_deref() else {
            warn!(
                "No git token configured, skipping credentials for {}",
                self.server_url
            );
            return Ok(());
        };

        let line = self.credential_line(token)?;
        self.write_store_file(format!("{}\n", line).as_bytes())
            .await
            .map_err(|source| GitCredentialsError::Write {
                path: self.path.clone(),
                source,
            })?;

        debug!("Wrote git credentials for {}", self.server_url);
        Ok(())
    }
}
