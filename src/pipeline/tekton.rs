use super::{PipelineError, PipelineRunResponse, PipelineRunner, PipelineTriggerRequest};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::PostParams;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

const TEKTON_GROUP: &str = "tekton.dev";
const TEKTON_VERSION: &str = "v1beta1";
const PIPELINE_RUN_KIND: &str = "PipelineRun";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "environment-controller";
const TRIGGER_LABEL: &str = "environment-controller/trigger";

/// Longest `generateName` prefix that leaves room for the random suffix
const MAX_GENERATE_NAME: usize = 57;

/// Triggers runs by creating Tekton `PipelineRun` resources for a named Pipeline
pub struct TektonPipelineRunner {
    client: Client,
    namespace: String,
    pipeline: String,
}

impl TektonPipelineRunner {
    pub fn new(client: Client, namespace: &str, pipeline: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            pipeline: pipeline.to_string(),
        }
    }
}

fn pipeline_run_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        TEKTON_GROUP,
        TEKTON_VERSION,
        PIPELINE_RUN_KIND,
    ))
}

/// Build the `PipelineRun` for a trigger request
fn pipeline_run(request: &PipelineTriggerRequest, pipeline: &str) -> DynamicObject {
    let mut labels: BTreeMap<String, String> = request
        .custom_labels
        .iter()
        .filter_map(|label| label.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels.insert(
        TRIGGER_LABEL.to_string(),
        request.trigger.as_str().to_string(),
    );

    // emptyDir lives exactly as long as the run's pods
    let workspace = if request.delete_temp_dir {
        json!({ "name": request.source_name, "emptyDir": {} })
    } else {
        json!({
            "name": request.source_name,
            "volumeClaimTemplate": {
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": { "requests": { "storage": "1Gi" } }
                }
            }
        })
    };

    let mut run = DynamicObject::new("", &pipeline_run_resource()).data(json!({
        "spec": {
            "pipelineRef": { "name": pipeline },
            "serviceAccountName": request.service_account,
            "params": [
                { "name": "source-url", "value": request.source_url },
                { "name": "branch", "value": request.branch },
                { "name": "revision", "value": request.revision },
            ],
            "workspaces": [workspace],
        }
    }));
    run.metadata.name = None;
    run.metadata.generate_name = Some(generate_name(&request.source_url, &request.branch));
    run.metadata.labels = Some(labels);
    run
}

/// `<repo>-<branch>-` lowercased and reduced to DNS label characters
fn generate_name(source_url: &str, branch: &str) -> String {
    let repo = source_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");

    let mut name: String = format!("{}-{}", repo, branch)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(MAX_GENERATE_NAME - 1);
    let name = name.trim_matches('-');

    if name.is_empty() {
        "pipeline-".to_string()
    } else {
        format!("{}-", name)
    }
}

#[async_trait]
impl PipelineRunner for TektonPipelineRunner {
    async fn trigger(
        &self,
        request: &PipelineTriggerRequest,
    ) -> Result<PipelineRunResponse, PipelineError> {
        let resource = pipeline_run_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &self.namespace, &resource);
        let run = pipeline_run(request, &self.pipeline);

        let created = tokio::time::timeout(
            request.duration,
            api.create(&PostParams::default(), &run),
        )
        .await
        .map_err(|_| PipelineError::Timeout(request.duration))?
        .map_err(|source| PipelineError::Create {
            namespace: self.namespace.clone(),
            source,
        })?;

        info!(
            "Created PipelineRun {}/{} for {} branch {}",
            self.namespace,
            created.metadata.name.as_deref().unwrap_or_default(),
            request.source_url,
            request.branch
        );

        Ok(PipelineRunResponse {
            resources: vec![ObjectReference {
                api_version: Some(resource.api_version.clone()),
                kind: Some(resource.kind.clone()),
                name: created.metadata.name.clone(),
                namespace: Some(self.namespace.clone()),
                uid: created.metadata.uid.clone(),
                ..Default::default()
            }],
        })
    }
}
