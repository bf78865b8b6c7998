use crate::git::{GitProvider, GitProviderError, GitRepository, WebhookArguments};
use crate::secret::HmacSecret;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("failed to create git WebHook for repository {repository_url}: {source}")]
    CreateWebhook {
        repository_url: String,
        #[source]
        source: GitProviderError,
    },
}

/// Registers the controller's webhook with the git provider
pub struct WebhookRegistrar {
    provider: Arc<dyn GitProvider>,
}

impl WebhookRegistrar {
    pub fn new(provider: Arc<dyn GitProvider>) -> Self {
        Self { provider }
    }

    /// Ask the provider for a webhook on `repository` targeting `webhook_url`.
    ///
    /// `source_url` is the repository URL as configured and is what errors
    /// and logs report. The request is issued every time; avoiding duplicates
    /// is up to the provider.
    pub async fn ensure(
        &self,
        repository: &GitRepository,
        source_url: &str,
        webhook_url: &str,
        secret: &HmacSecret,
    ) -> Result<(), RegistrarError> {
        info!(
            "Verifying that the webhook is registered for the git repository {}",
            source_url
        );

        let args = WebhookArguments {
            owner: repository.owner.clone(),
            repo: repository.name.clone(),
            url: webhook_url.to_string(),
            secret: String::from_utf8_lossy(secret.as_bytes()).into_owned(),
        };

        self.provider
            .create_webhook(&args)
            .await
            .map_err(|source| RegistrarError::CreateWebhook {
                repository_url: source_url.to_string(),
                source,
            })
    }
}
