// Provisioning of the shared HMAC secret
//
// The secret lives in a Kubernetes Secret with a well-known name so that a
// restarted controller keeps validating against the webhook it registered
// earlier. A token is only generated when the Secret is missing or empty.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the Secret holding the HMAC token
pub const HMAC_SECRET_NAME: &str = "environment-controller-hmac";

/// Key of the HMAC token inside the Secret's data
pub const HMAC_SECRET_KEY: &str = "hmac";

/// Length of generated tokens, matching what git providers commonly issue
pub const TOKEN_LENGTH: usize = 41;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to get Secret {name} in namespace {namespace}: {source}")]
    Get {
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to create HMAC token secret {name} in namespace {namespace}: {source}")]
    Create {
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to update HMAC token secret {name} in namespace {namespace}: {source}")]
    Update {
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("no HMAC token found in Secret {name} in namespace {namespace}")]
    Empty { name: String, namespace: String },
}

/// Access to named Secrets in a single namespace
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Namespace the store operates in, used in error messages
    fn namespace(&self) -> &str;

    /// Fetch a Secret, `Ok(None)` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<Secret>, SecretError>;

    async fn create(&self, secret: &Secret) -> Result<Secret, SecretError>;

    async fn replace(&self, secret: &Secret) -> Result<Secret, SecretError>;
}

/// Secret store backed by the Kubernetes API
pub struct KubeSecretStore {
    api: Api<Secret>,
    namespace: String,
}

impl KubeSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<Option<Secret>, SecretError> {
        match self.api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(source) => Err(SecretError::Get {
                name: name.to_string(),
                namespace: self.namespace.clone(),
                source,
            }),
        }
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, SecretError> {
        self.api
            .create(&PostParams::default(), secret)
            .await
            .map_err(|source| SecretError::Create {
                name: secret.metadata.name.clone().unwrap_or_default(),
                namespace: self.namespace.clone(),
                source,
            })
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret, SecretError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|source| SecretError::Update {
                name,
                namespace: self.namespace.clone(),
                source,
            })
    }
}

/// The shared HMAC key. Its `Debug` output never reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct HmacSecret(Vec<u8>);

impl HmacSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for HmacSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HmacSecret(<{} bytes redacted>)", self.0.len())
    }
}

/// Generate a random alphanumeric token of [`TOKEN_LENGTH`] characters
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Loads the HMAC secret, creating or populating it on first run
pub struct SecretProvisioner {
    store: Arc<dyn SecretStore>,
    name: String,
}

impl SecretProvisioner {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            name: HMAC_SECRET_NAME.to_string(),
        }
    }

    /// Use a Secret name other than [`HMAC_SECRET_NAME`]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Return the stored token, generating and persisting one if there is none.
    ///
    /// An existing non-empty token is never replaced.
    pub async fn load_or_create(&self) -> Result<HmacSecret, SecretError> {
        let stored = match self.store.get(&self.name).await? {
            Some(mut secret) => {
                if let Some(token) = token_of(&secret) {
                    debug!("Using existing HMAC token from Secret {}", self.name);
                    return Ok(HmacSecret::new(token));
                }

                info!(
                    "Secret {} in namespace {} has no HMAC token, generating one",
                    self.name,
                    self.store.namespace()
                );
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(
                        HMAC_SECRET_KEY.to_string(),
                        ByteString(generate_token().into_bytes()),
                    );
                self.store.replace(&secret).await?
            },
            None => {
                info!(
                    "Creating HMAC token Secret {} in namespace {}",
                    self.name,
                    self.store.namespace()
                );
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(
                        HMAC_SECRET_KEY.to_string(),
                        ByteString(generate_token().into_bytes()),
                    )])),
                    ..Default::default()
                };
                self.store.create(&secret).await?
            },
        };

        token_of(&stored)
            .map(HmacSecret::new)
            .ok_or_else(|| SecretError::Empty {
                name: self.name.clone(),
                namespace: self.store.namespace().to_string(),
            })
    }
}

fn token_of(secret: &Secret) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(HMAC_SECRET_KEY))
        .filter(|value| !value.0.is_empty())
        .map(|value| value.0.clone())
}
