// Discovery of the externally reachable URL of the controller
//
// The controller's Service either carries an explicit expose URL annotation
// or, for `LoadBalancer` Services, gets an ingress address assigned by the
// cloud provider some time after creation. The latter is polled for.

use crate::retry::poll_until_some_or_timeout;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Name of the Service exposing the controller
pub const CONTROLLER_SERVICE_NAME: &str = "environment-controller";

/// Annotation holding an explicit external URL for a Service
pub const EXPOSE_URL_ANNOTATION: &str = "fabric8.io/exposeUrl";

pub const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

/// How long to wait for a load balancer address
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Delay between Service lookups while waiting
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to find Service {name} in namespace {namespace}: {source}")]
    Lookup {
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("could not find external URL of Service {name} in namespace {namespace}")]
    NoExternalUrl { name: String, namespace: String },
    #[error(
        "timed out after {timeout:?} waiting for the external URL of Service {name} in namespace {namespace}"
    )]
    TimedOut {
        name: String,
        namespace: String,
        timeout: Duration,
    },
}

/// Read access to Services in a single namespace
#[async_trait]
pub trait ServiceLookup: Send + Sync {
    fn namespace(&self) -> &str;

    async fn get(&self, name: &str) -> Result<Service, DiscoveryError>;
}

/// Service lookup backed by the Kubernetes API
pub struct KubeServiceLookup {
    api: Api<Service>,
    namespace: String,
}

impl KubeServiceLookup {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl ServiceLookup for KubeServiceLookup {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<Service, DiscoveryError> {
        self.api
            .get(name)
            .await
            .map_err(|source| DiscoveryError::Lookup {
                name: name.to_string(),
                namespace: self.namespace.clone(),
                source,
            })
    }
}

/// Derive the externally reachable URL of a Service, if it has one yet.
///
/// The expose URL annotation wins. Otherwise the first load balancer ingress
/// hostname or IP is used, with `https` for port 443 and an explicit port
/// for anything but 80 and 443.
pub fn service_url(service: &Service) -> Option<String> {
    if let Some(url) = service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXPOSE_URL_ANNOTATION))
        .filter(|u| !u.is_empty())
    {
        return Some(url.clone());
    }

    let host = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| {
            ingress
                .hostname
                .clone()
                .filter(|h| !h.is_empty())
                .or_else(|| ingress.ip.clone().filter(|ip| !ip.is_empty()))
        })?;

    let port = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.port);

    Some(match port {
        Some(443) => format!("https://{}", host),
        Some(80) | None => format!("http://{}", host),
        Some(port) => format!("http://{}:{}", host, port),
    })
}

fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(LOAD_BALANCER_TYPE)
}

/// Resolves the controller's external URL from its Service
pub struct EndpointDiscoverer {
    lookup: Arc<dyn ServiceLookup>,
    service_name: String,
    timeout: Duration,
    interval: Duration,
}

impl EndpointDiscoverer {
    pub fn new(lookup: Arc<dyn ServiceLookup>) -> Self {
        Self {
            lookup,
            service_name: CONTROLLER_SERVICE_NAME.to_string(),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_timing(mut self, timeout: Duration, interval: Duration) -> Self {
        self.timeout = timeout;
        self.interval = interval;
        self
    }

    /// Return the Service's external URL, waiting for a load balancer address
    /// for up to the configured timeout.
    pub async fn discover(&self) -> Result<String, DiscoveryError> {
        let service = self.lookup.get(&self.service_name).await?;

        if let Some(url) = service_url(&service) {
            debug!("Service {} exposes {}", self.service_name, url);
            return Ok(url);
        }

        if !is_load_balancer(&service) {
            return Err(self.no_external_url());
        }

        info!(
            "Waiting for the external IP on the service {} in namespace {} ...",
            self.service_name,
            self.lookup.namespace()
        );

        let lookup = self.lookup.clone();
        let name = self.service_name.clone();
        let result = poll_until_some_or_timeout(self.timeout, self.interval, move || {
            let lookup = lookup.clone();
            let name = name.clone();
            async move {
                let service = lookup.get(&name).await?;
                Ok::<_, DiscoveryError>(service_url(&service))
            }
        })
        .await;

        match result {
            Ok(url) => {
                info!("Service {} is now reachable at {}", self.service_name, url);
                Ok(url)
            },
            Err(e) => match e.into_last_error() {
                Some(last) => Err(last),
                None => Err(DiscoveryError::TimedOut {
                    name: self.service_name.clone(),
                    namespace: self.lookup.namespace().to_string(),
                    timeout: self.timeout,
                }),
            },
        }
    }

    fn no_external_url(&self) -> DiscoveryError {
        DiscoveryError::NoExternalUrl {
            name: self.service_name.clone(),
            namespace: self.lookup.namespace().to_string(),
        }
    }
}
