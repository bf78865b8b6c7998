use crate::git::{GitRepository, GitUrlError};
use clap::Parser;
use std::collections::BTreeMap;
use thiserror::Error;

pub const SOURCE_URL_ENV: &str = "SOURCE_URL";
pub const GIT_SERVER_URL_ENV: &str = "GIT_SERVER_URL";
pub const OWNER_ENV: &str = "OWNER";
pub const REPO_ENV: &str = "REPO";
pub const BRANCH_ENV: &str = "BRANCH";
pub const WEBHOOK_URL_ENV: &str = "WEBHOOK_URL";

pub const DEFAULT_BRANCH: &str = "master";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing option: --{0}")]
    MissingOption(&'static str),
    #[error("invalid --source-url: {0}")]
    InvalidSourceUrl(#[from] GitUrlError),
    #[error("invalid --{option} {value:?}: paths must start with '/'")]
    InvalidPath { option: &'static str, value: String },
    #[error("--path {0:?} collides with the health or ready path")]
    PathConflict(String),
}

/// Command line of the environment controller
#[derive(Debug, Clone, Parser)]
#[command(
    name = "environment-controller",
    version,
    about = "A controller which takes a webhook and updates the environment via GitOps for remote clusters"
)]
pub struct ControllerArgs {
    /// The TCP port to listen on
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// The interface address to bind to (by default, will listen on all interfaces/addresses)
    #[arg(long, default_value = "")]
    pub bind: String,

    /// The path to listen on for requests to trigger a pipeline run
    #[arg(short = 'p', long, default_value = "/")]
    pub path: String,

    #[arg(long, default_value = "/health")]
    pub health_path: String,

    #[arg(long, default_value = "/ready")]
    pub ready_path: String,

    /// The Kubernetes ServiceAccount to use to run the pipeline
    #[arg(long, default_value = "tekton-bot")]
    pub service_account: String,

    /// Disables checking we have setup git credentials on startup
    #[arg(long)]
    pub no_git_init: bool,

    /// Disables checking to register the webhook on startup
    #[arg(long)]
    pub no_register_webhook: bool,

    /// Reject deliveries without X-GitHub-Event and X-GitHub-Delivery headers
    #[arg(long)]
    pub require_github_headers: bool,

    /// The source URL of the environment git repository. Defaults to $SOURCE_URL
    #[arg(short = 's', long)]
    pub source_url: Option<String>,

    /// The git server URL. Defaults to $GIT_SERVER_URL
    #[arg(long)]
    pub git_server_url: Option<String>,

    /// The git repository owner. Defaults to $OWNER
    #[arg(short = 'o', long)]
    pub owner: Option<String>,

    /// The git repository name. Defaults to $REPO
    #[arg(short = 'r', long)]
    pub repo: Option<String>,

    /// The branch to trigger pipelines for. Defaults to $BRANCH, then master
    #[arg(short = 'b', long)]
    pub branch: Option<String>,

    /// The external webhook URL of this controller to register with the git provider.
    /// Defaults to $WEBHOOK_URL, then the controller's Service address
    #[arg(short = 'w', long)]
    pub webhook_url: Option<String>,

    /// Custom label added to triggered pipeline runs, as key=value (repeatable)
    #[arg(long = "label", value_parser = parse_label)]
    pub labels: Vec<(String, String)>,

    /// Namespace of the controller's Secret, Service and pipeline runs.
    /// Defaults to the namespace of the Kubernetes client
    #[arg(long)]
    pub namespace: Option<String>,

    /// Name of the Tekton Pipeline to run
    #[arg(long, default_value = "environment-pipeline")]
    pub pipeline: String,

    /// Port of the Prometheus metrics server, 0 disables it
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// User name for git credentials
    #[arg(long, env = "GIT_USERNAME", default_value = "jenkins-x-bot")]
    pub git_username: String,

    /// API token for the git provider and git credentials
    #[arg(long, env = "GIT_TOKEN", hide_env_values = true)]
    pub git_token: Option<String>,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

/// Fully resolved controller settings, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub bind_address: String,
    pub port: u16,
    pub path: String,
    pub health_path: String,
    pub ready_path: String,
    pub repository: GitRepository,
    pub source_url: String,
    pub branch: String,
    /// `None` means the URL has to be discovered from the Service
    pub webhook_url: Option<String>,
    pub service_account: String,
    pub labels: BTreeMap<String, String>,
    pub no_git_init: bool,
    pub no_register_webhook: bool,
    pub require_github_headers: bool,
    pub namespace: Option<String>,
    pub pipeline: String,
    pub metrics_port: u16,
    pub git_username: String,
    pub git_token: Option<String>,
}

impl ControllerConfig {
    /// Resolve `args` against the process environment
    pub fn resolve(args: ControllerArgs) -> Result<Self, ConfigError> {
        Self::resolve_with(args, |key| std::env::var(key).ok())
    }

    /// Resolve `args`, looking up fallbacks with `lookup_env`.
    ///
    /// Repository coordinates prefer the explicit flag, then the value parsed
    /// from the source URL, then the environment. Empty values count as unset.
    pub fn resolve_with(
        args: ControllerArgs,
        lookup_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = |key: &str| non_empty(lookup_env(key));

        for (option, value) in [
            ("path", &args.path),
            ("health-path", &args.health_path),
            ("ready-path", &args.ready_path),
        ] {
            if !value.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    option,
                    value: value.clone(),
                });
            }
        }
        if args.path == args.health_path
            || args.path == args.ready_path
            || args.health_path == args.ready_path
        {
            return Err(ConfigError::PathConflict(args.path.clone()));
        }

        let source_url = non_empty(args.source_url).or_else(|| env(SOURCE_URL_ENV));
        let parsed = source_url
            .as_deref()
            .map(GitRepository::parse)
            .transpose()?;

        let server_url = non_empty(args.git_server_url)
            .or_else(|| parsed.as_ref().map(|p| p.server_url.clone()))
            .or_else(|| env(GIT_SERVER_URL_ENV))
            .ok_or(ConfigError::MissingOption("git-server-url"))?;
        let owner = non_empty(args.owner)
            .or_else(|| parsed.as_ref().map(|p| p.owner.clone()))
            .or_else(|| env(OWNER_ENV))
            .ok_or(ConfigError::MissingOption("owner"))?;
        let name = non_empty(args.repo)
            .or_else(|| parsed.as_ref().map(|p| p.name.clone()))
            .or_else(|| env(REPO_ENV))
            .ok_or(ConfigError::MissingOption("repo"))?;

        let repository = GitRepository {
            server_url,
            owner,
            name,
        };

        let branch = non_empty(args.branch)
            .or_else(|| env(BRANCH_ENV))
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        let webhook_url = non_empty(args.webhook_url).or_else(|| env(WEBHOOK_URL_ENV));
        let source_url = source_url.unwrap_or_else(|| repository.url());

        Ok(Self {
            bind_address: args.bind,
            port: args.port,
            path: args.path,
            health_path: args.health_path,
            ready_path: args.ready_path,
            repository,
            source_url,
            branch,
            webhook_url,
            service_account: args.service_account,
            labels: args.labels.into_iter().collect(),
            no_git_init: args.no_git_init,
            no_register_webhook: args.no_register_webhook,
            require_github_headers: args.require_github_headers,
            namespace: non_empty(args.namespace),
            pipeline: args.pipeline,
            metrics_port: args.metrics_port,
            git_username: args.git_username,
            git_token: non_empty(args.git_token),
        })
    }

    /// Socket address the trigger server listens on
    pub fn listen_address(&self) -> String {
        let host = if self.bind_address.is_empty() {
            "0.0.0.0"
        } else {
            self.bind_address.as_str()
        };
        format!("{}:{}", host, self.port)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
