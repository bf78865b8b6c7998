// Pipeline trigger requests and the runners that execute them

mod tekton;

pub use tekton::TektonPipelineRunner;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Revision checked out by every triggered run
pub const DEFAULT_REVISION: &str = "master";

/// Name of the workspace the source is cloned into
pub const SOURCE_NAME: &str = "source";

/// Time budget for a single trigger
pub const TRIGGER_DURATION: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("timed out after {0:?} triggering pipeline")]
    Timeout(Duration),
    #[error("failed to create PipelineRun in namespace {namespace}: {source}")]
    Create {
        namespace: String,
        #[source]
        source: kube::Error,
    },
}

/// Why a pipeline run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
        }
    }
}

/// Everything needed to start one pipeline run for the environment repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTriggerRequest {
    pub source_url: String,
    pub branch: String,
    pub revision: String,
    pub trigger: TriggerKind,
    pub service_account: String,
    /// `key=value` pairs, sorted by key
    pub custom_labels: Vec<String>,
    /// Name of the ephemeral workspace holding the checkout
    pub source_name: String,
    /// Whether the workspace is removed once the run finishes
    pub delete_temp_dir: bool,
    pub duration: Duration,
}

impl PipelineTriggerRequest {
    /// A manual trigger of `branch` at the default revision
    pub fn new(
        source_url: &str,
        branch: &str,
        service_account: &str,
        labels: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            source_url: source_url.to_string(),
            branch: branch.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            trigger: TriggerKind::Manual,
            service_account: service_account.to_string(),
            custom_labels: labels
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
            source_name: SOURCE_NAME.to_string(),
            delete_temp_dir: true,
            duration: TRIGGER_DURATION,
        }
    }
}

/// Objects created by a triggered run, returned to the webhook caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunResponse {
    #[serde(default)]
    pub resources: Vec<ObjectReference>,
}

/// Starts pipeline runs
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn trigger(
        &self,
        request: &PipelineTriggerRequest,
    ) -> Result<PipelineRunResponse, PipelineError>;
}
