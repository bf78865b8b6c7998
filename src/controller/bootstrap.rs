use super::{ControllerState, router};
use crate::config::ControllerConfig;
use crate::discovery::{EndpointDiscoverer, KubeServiceLookup, ServiceLookup};
use crate::git::{GitCredentials, GitHubProvider, GitProvider, StoreCredentials, url_join};
use crate::metrics;
use crate::pipeline::{PipelineRunner, TektonPipelineRunner};
use crate::registrar::WebhookRegistrar;
use crate::secret::{KubeSecretStore, SecretProvisioner, SecretStore};
use std::error::Error as StdError;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Startup runs these phases in order; any failure aborts the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    ResolveConfig,
    ResolveSecret,
    InitGitCredentials,
    RegisterWebhook,
    Serving,
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::ResolveConfig => "resolving configuration",
            Self::ResolveSecret => "resolving the HMAC secret",
            Self::InitGitCredentials => "initialising git credentials",
            Self::RegisterWebhook => "registering the webhook",
            Self::Serving => "serving",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Error)]
#[error("startup failed while {phase}: {source}")]
pub struct StartupError {
    pub phase: StartupPhase,
    #[source]
    pub source: Box<dyn StdError + Send + Sync>,
}

impl StartupError {
    fn new(phase: StartupPhase, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }
}

/// External systems the controller talks to
#[derive(Clone)]
pub struct Collaborators {
    pub secrets: Arc<dyn SecretStore>,
    pub services: Arc<dyn ServiceLookup>,
    pub git_provider: Arc<dyn GitProvider>,
    pub credentials: Arc<dyn GitCredentials>,
    pub runner: Arc<dyn PipelineRunner>,
}

impl Collaborators {
    /// Kubernetes, GitHub and git-backed collaborators for `namespace`
    pub fn kubernetes(
        client: kube::Client,
        namespace: &str,
        config: &ControllerConfig,
    ) -> Result<Self, StartupError> {
        let git_provider =
            GitHubProvider::for_repository(&config.repository, config.git_token.clone())
                .map_err(|e| StartupError::new(StartupPhase::ResolveConfig, e))?;

        Ok(Self {
            secrets: Arc::new(KubeSecretStore::new(client.clone(), namespace)),
            services: Arc::new(KubeServiceLookup::new(client.clone(), namespace)),
            git_provider: Arc::new(git_provider),
            credentials: Arc::new(StoreCredentials::new(
                &config.repository.server_url,
                &config.git_username,
                config.git_token.clone(),
            )),
            runner: Arc::new(TektonPipelineRunner::new(client, namespace, &config.pipeline)),
        })
    }
}

/// Run every startup phase up to, but not including, serving.
///
/// The returned state carries the resolved webhook URL in its config.
pub async fn bootstrap(
    mut config: ControllerConfig,
    collaborators: Collaborators,
) -> Result<ControllerState, StartupError> {
    let webhook_url = match config.webhook_url.clone() {
        Some(url) => url,
        None => EndpointDiscoverer::new(collaborators.services.clone())
            .discover()
            .await
            .map_err(|e| StartupError::new(StartupPhase::ResolveConfig, e))?,
    };
    config.webhook_url = Some(webhook_url.clone());

    info!(
        "Using environment source directory {} and external webhook URL: {}",
        config.source_url,
        url_join(&[&webhook_url, &config.path])
    );

    let secret = SecretProvisioner::new(collaborators.secrets.clone())
        .load_or_create()
        .await
        .map_err(|e| StartupError::new(StartupPhase::ResolveSecret, e))?;

    let credentials = if config.no_git_init {
        None
    } else {
        collaborators
            .credentials
            .init()
            .await
            .map_err(|e| StartupError::new(StartupPhase::InitGitCredentials, e))?;
        Some(collaborators.credentials.clone())
    };

    if !config.no_register_webhook {
        WebhookRegistrar::new(collaborators.git_provider.clone())
            .ensure(
                &config.repository,
                &config.source_url,
                &webhook_url,
                &secret,
            )
            .await
            .map_err(|e| StartupError::new(StartupPhase::RegisterWebhook, e))?;
    }

    Ok(ControllerState::new(
        config,
        secret,
        collaborators.runner.clone(),
        credentials,
    ))
}

/// Serve the trigger, health and ready routes on `listener` until the process ends
pub async fn serve(state: ControllerState, listener: TcpListener) -> Result<(), StartupError> {
    axum::serve(listener, router(state))
        .await
        .map_err(|e| StartupError::new(StartupPhase::Serving, e))
}

/// Start the controller against the cluster the process runs in
pub async fn run(config: ControllerConfig) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .map_err(|e| StartupError::new(StartupPhase::ResolveConfig, e))?;
    let namespace = config
        .namespace
        .clone()
        .unwrap_or_else(|| client.default_namespace().to_string());
    info!("Using namespace {}", namespace);

    if config.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        metrics::start_metrics_server(addr).await?;
    }

    let collaborators = Collaborators::kubernetes(client, &namespace, &config)?;
    let state = bootstrap(config, collaborators).await?;

    let address = state.config().listen_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| StartupError::new(StartupPhase::Serving, e))?;
    info!("Environment controller now listening on {}", address);

    serve(state, listener).await?;
    Ok(())
}
