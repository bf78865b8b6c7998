// Common test utilities for integration tests
//
// In-memory stand-ins for the Kubernetes API, the git provider, git
// credentials and the pipeline runner, plus fixtures for configs, Services
// and signed webhook requests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, header};
use clap::Parser;
use environment_controller::config::{ControllerArgs, ControllerConfig};
use environment_controller::controller::Collaborators;
use environment_controller::discovery::{DiscoveryError, ServiceLookup};
use environment_controller::git::{
    GitCredentials, GitCredentialsError, GitProvider, GitProviderError, WebhookArguments,
};
use environment_controller::pipeline::{
    PipelineError, PipelineRunResponse, PipelineRunner, PipelineTriggerRequest,
};
use environment_controller::secret::{HMAC_SECRET_KEY, HMAC_SECRET_NAME, SecretError, SecretStore};
use environment_controller::signature;
use environment_controller::webhook::{JSON_CONTENT_TYPE, SIGNATURE_HEADER};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, ObjectReference, Secret, Service, ServiceSpec,
    ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const NAMESPACE: &str = "jx";
pub const SOURCE_URL: &str = "https://github.com/acme/environment-staging";
pub const PUSH_PAYLOAD: &str = r#"{"ref":"refs/heads/master","after":"6113728f27ae82c7b1a177c8d03f9e96e0adf246"}"#;

/// Resolve a config from command line flags with an empty environment
pub fn test_config(extra: &[&str]) -> ControllerConfig {
    let mut argv = vec!["environment-controller", "--source-url", SOURCE_URL];
    argv.extend_from_slice(extra);
    let args = ControllerArgs::try_parse_from(argv).expect("valid test arguments");
    ControllerConfig::resolve_with(args, |_| None).expect("resolvable test config")
}

/// A POST to `path` signed with `secret`
pub fn signed_post(path: &str, payload: &str, secret: &[u8]) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
        .header("X-GitHub-Event", "push")
        .header("X-GitHub-Delivery", "72d3162e-cc78-11e3-81ab-4c9367dc0958")
        .header(SIGNATURE_HEADER, signature::sign(payload.as_bytes(), secret))
        .body(Body::from(payload.to_string()))
        .expect("valid request")
}

pub fn hmac_secret(token: &[u8]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(HMAC_SECRET_NAME.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            HMAC_SECRET_KEY.to_string(),
            ByteString(token.to_vec()),
        )])),
        ..Default::default()
    }
}

/// Secret store holding at most one Secret, counting writes
#[derive(Default)]
pub struct InMemorySecretStore {
    secret: Mutex<Option<Secret>>,
    writes: AtomicUsize,
    fail_writes: bool,
}

impl InMemorySecretStore {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: Secret) -> Self {
        Self {
            secret: Mutex::new(Some(secret)),
            ..Default::default()
        }
    }

    /// A store whose `create` and `replace` are refused by the API server
    pub fn rejecting_writes(secret: Option<Secret>) -> Self {
        Self {
            secret: Mutex::new(secret),
            fail_writes: true,
            ..Default::default()
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn stored_token(&self) -> Option<Vec<u8>> {
        self.secret
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|secret| secret.data.as_ref())
            .and_then(|data| data.get(HMAC_SECRET_KEY))
            .map(|value| value.0.clone())
    }

    fn store(&self, secret: &Secret) -> Secret {
        self.writes.fetch_add(1, Ordering::SeqCst);
        *self.secret.lock().unwrap() = Some(secret.clone());
        secret.clone()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    fn namespace(&self) -> &str {
        NAMESPACE
    }

    async fn get(&self, name: &str) -> Result<Option<Secret>, SecretError> {
        let secret = self.secret.lock().unwrap().clone();
        Ok(secret.filter(|s| s.metadata.name.as_deref() == Some(name)))
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, SecretError> {
        if self.fail_writes {
            return Err(SecretError::Create {
                name: secret.metadata.name.clone().unwrap_or_default(),
                namespace: NAMESPACE.to_string(),
                source: forbidden("create"),
            });
        }
        Ok(self.store(secret))
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret, SecretError> {
        if self.fail_writes {
            return Err(SecretError::Update {
                name: secret.metadata.name.clone().unwrap_or_default(),
                namespace: NAMESPACE.to_string(),
                source: forbidden("update"),
            });
        }
        Ok(self.store(secret))
    }
}

fn forbidden(verb: &str) -> kube::Error {
    api_error(
        403,
        "Forbidden",
        &format!(
            "secrets is forbidden: User cannot {} resource \"secrets\" in namespace \"{}\"",
            verb, NAMESPACE
        ),
    )
}

/// An error as returned by the Kubernetes API server
pub fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}

pub fn load_balancer_service(ip: Option<&str>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("environment-controller".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ..Default::default()
        }),
        status: ip.map(|ip| ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(ip.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

pub fn cluster_ip_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("environment-controller".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Returns the queued responses in order, repeating the last one forever.
/// A `None` response is an API server error.
pub struct FakeServiceLookup {
    responses: Mutex<VecDeque<Option<Service>>>,
    calls: AtomicUsize,
}

impl FakeServiceLookup {
    pub fn new(services: Vec<Service>) -> Self {
        Self::with_responses(services.into_iter().map(Some).collect())
    }

    pub fn with_responses(responses: Vec<Option<Service>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceLookup for FakeServiceLookup {
    fn namespace(&self) -> &str {
        NAMESPACE
    }

    async fn get(&self, name: &str) -> Result<Service, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        match response {
            Some(Some(service)) => Ok(service),
            Some(None) => Err(DiscoveryError::Lookup {
                name: name.to_string(),
                namespace: NAMESPACE.to_string(),
                source: api_error(
                    503,
                    "ServiceUnavailable",
                    "the server is currently unable to handle the request",
                ),
            }),
            None => Err(DiscoveryError::NoExternalUrl {
                name: name.to_string(),
                namespace: NAMESPACE.to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct RecordingGitProvider {
    pub calls: Mutex<Vec<WebhookArguments>>,
    pub fail: bool,
}

impl RecordingGitProvider {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<WebhookArguments> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitProvider for RecordingGitProvider {
    async fn create_webhook(&self, args: &WebhookArguments) -> Result<(), GitProviderError> {
        self.calls.lock().unwrap().push(args.clone());
        if self.fail {
            return Err(GitProviderError::Status {
                url: "https://api.github.com/repos/acme/environment-staging/hooks".to_string(),
                status: reqwest::StatusCode::FORBIDDEN,
                body: "Resource not accessible by integration".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingCredentials {
    inits: AtomicUsize,
    refreshes: AtomicUsize,
    fail: bool,
}

impl RecordingCredentials {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn result(&self) -> Result<(), GitCredentialsError> {
        if self.fail {
            return Err(GitCredentialsError::InvalidServer {
                url: "not a url".to_string(),
                reason: "relative URL without a base".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitCredentials for RecordingCredentials {
    async fn init(&self) -> Result<(), GitCredentialsError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.result()
    }

    async fn refresh(&self) -> Result<(), GitCredentialsError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.result()
    }
}

#[derive(Default)]
pub struct RecordingRunner {
    requests: Mutex<Vec<PipelineTriggerRequest>>,
    fail: bool,
}

impl RecordingRunner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<PipelineTriggerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineRunner for RecordingRunner {
    async fn trigger(
        &self,
        request: &PipelineTriggerRequest,
    ) -> Result<PipelineRunResponse, PipelineError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(PipelineError::Timeout(Duration::from_secs(20)));
        }
        Ok(PipelineRunResponse {
            resources: vec![ObjectReference {
                api_version: Some("tekton.dev/v1beta1".to_string()),
                kind: Some("PipelineRun".to_string()),
                name: Some("environment-staging-master-x7k2p".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            }],
        })
    }
}

/// Handles on every fake, kept so tests can inspect them after startup
pub struct Fakes {
    pub secrets: Arc<InMemorySecretStore>,
    pub services: Arc<FakeServiceLookup>,
    pub git_provider: Arc<RecordingGitProvider>,
    pub credentials: Arc<RecordingCredentials>,
    pub runner: Arc<RecordingRunner>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            secrets: Arc::new(InMemorySecretStore::absent()),
            services: Arc::new(FakeServiceLookup::new(vec![load_balancer_service(Some(
                "35.204.1.2",
            ))])),
            git_provider: Arc::new(RecordingGitProvider::default()),
            credentials: Arc::new(RecordingCredentials::default()),
            runner: Arc::new(RecordingRunner::default()),
        }
    }
}

impl Fakes {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            secrets: self.secrets.clone(),
            services: self.services.clone(),
            git_provider: self.git_provider.clone(),
            credentials: self.credentials.clone(),
            runner: self.runner.clone(),
        }
    }
}
