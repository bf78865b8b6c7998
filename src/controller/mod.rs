mod bootstrap;

pub use bootstrap::{Collaborators, StartupError, StartupPhase, bootstrap, run, serve};

use crate::config::ControllerConfig;
use crate::git::GitCredentials;
use crate::metrics::{
    PIPELINE_TRIGGER_DURATION, PIPELINE_TRIGGER_FAILURES_TOTAL, PIPELINE_TRIGGERS_TOTAL,
};
use crate::pipeline::{PipelineRunner, PipelineTriggerRequest};
use crate::secret::HmacSecret;
use crate::webhook::{self, WebhookOutcome};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Decides whether the controller should receive traffic
pub trait ReadinessCheck: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Readiness that always holds once the server is up
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl ReadinessCheck for AlwaysReady {
    fn is_ready(&self) -> bool {
        true
    }
}

impl<F> ReadinessCheck for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_ready(&self) -> bool {
        self()
    }
}

/// Everything the request handlers need, fixed once startup completes
#[derive(Clone)]
pub struct ControllerState {
    config: Arc<ControllerConfig>,
    secret: Arc<HmacSecret>,
    runner: Arc<dyn PipelineRunner>,
    /// `None` when git credentials are managed elsewhere
    credentials: Option<Arc<dyn GitCredentials>>,
    readiness: Arc<dyn ReadinessCheck>,
}

impl std::fmt::Debug for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerState")
            .field("config", &self.config)
            .field("secret", &self.secret)
            .finish_non_exhaustive()
    }
}

impl ControllerState {
    pub fn new(
        config: ControllerConfig,
        secret: HmacSecret,
        runner: Arc<dyn PipelineRunner>,
        credentials: Option<Arc<dyn GitCredentials>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            secret: Arc::new(secret),
            runner,
            credentials,
            readiness: Arc::new(AlwaysReady),
        }
    }

    pub fn with_readiness(mut self, readiness: Arc<dyn ReadinessCheck>) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn secret(&self) -> &HmacSecret {
        &self.secret
    }
}

/// Routes for liveness, readiness and the webhook trigger path
pub fn router(state: ControllerState) -> Router {
    let config = state.config.clone();

    Router::new()
        .route(&config.health_path, get(health))
        .route(&config.ready_path, get(ready))
        .route(&config.path, any(handle_trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness: 204 as long as the process answers
async fn health() -> StatusCode {
    debug!("Health check");
    StatusCode::NO_CONTENT
}

/// Readiness: 204 when ready to serve, otherwise 503
async fn ready(State(state): State<ControllerState>) -> StatusCode {
    debug!("Ready check");
    if state.readiness.is_ready() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn handle_trigger(State(state): State<ControllerState>, request: Request) -> Response {
    let outcome = webhook::validate(
        request,
        state.secret.as_bytes(),
        state.config.require_github_headers,
    )
    .await;

    let event = match outcome {
        WebhookOutcome::Accepted(event) => event,
        WebhookOutcome::Probe => return StatusCode::OK.into_response(),
        WebhookOutcome::Rejected(rejection) => return rejection.into_response(),
    };

    if event.event_type.is_empty() {
        return StatusCode::OK.into_response();
    }

    debug!(
        event_type = %event.event_type,
        delivery_id = %event.delivery_id,
        "Accepted webhook delivery"
    );

    start_pipeline_run(&state).await
}

async fn start_pipeline_run(state: &ControllerState) -> Response {
    if let Some(credentials) = &state.credentials
        && let Err(e) = credentials.refresh().await
    {
        warn!("Failed to refresh git credentials: {}", e);
    }

    let config = &state.config;
    let request = PipelineTriggerRequest::new(
        &config.source_url,
        &config.branch,
        &config.service_account,
        &config.labels,
    );

    info!(
        "Triggering pipeline for repo {} branch {} revision {}",
        request.source_url, request.branch, request.revision
    );

    let timer = PIPELINE_TRIGGER_DURATION.start_timer();
    let result = state.runner.trigger(&request).await;
    timer.observe_duration();

    match result {
        Ok(response) => {
            PIPELINE_TRIGGERS_TOTAL.inc();
            (StatusCode::OK, Json(response)).into_response()
        },
        Err(e) => {
            PIPELINE_TRIGGER_FAILURES_TOTAL.inc();
            error!(
                "Failed to trigger pipeline for repo {} branch {}: {}",
                request.source_url, request.branch, e
            );
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        },
    }
}
