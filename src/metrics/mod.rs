use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Webhook metrics
    pub static ref WEBHOOK_REQUESTS_TOTAL: IntCounter = IntCounter::new(
        "environment_controller_webhook_requests_total",
        "Total number of requests received on the trigger path"
    ).unwrap();

    pub static ref WEBHOOK_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "environment_controller_webhook_rejections_total",
            "Total number of webhook requests rejected, by HTTP status"
        ),
        &["status"]
    ).unwrap();

    // Pipeline metrics
    pub static ref PIPELINE_TRIGGERS_TOTAL: IntCounter = IntCounter::new(
        "environment_controller_pipeline_triggers_total",
        "Total number of pipeline runs triggered successfully"
    ).unwrap();

    pub static ref PIPELINE_TRIGGER_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "environment_controller_pipeline_trigger_failures_total",
        "Total number of pipeline triggers that failed"
    ).unwrap();

    pub static ref PIPELINE_TRIGGER_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "environment_controller_pipeline_trigger_duration_seconds",
            "Time spent triggering a pipeline run"
        ).buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0])
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY
        .register(Box::new(WEBHOOK_REQUESTS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(WEBHOOK_REJECTIONS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(PIPELINE_TRIGGERS_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(PIPELINE_TRIGGER_FAILURES_TOTAL.clone()))
        .ok();
    REGISTRY
        .register(Box::new(PIPELINE_TRIGGER_DURATION.clone()))
        .ok();

    info!("Metrics registered");
}

pub async fn start_metrics_server(addr: SocketAddr) -> Result<JoinHandle<()>> {
    register_metrics();

    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
    info!("Starting metrics server on {}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server failed: {}", e);
        }
    });

    Ok(handle)
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_handler_exposes_registered_counters() {
        register_metrics();
        WEBHOOK_REQUESTS_TOTAL.inc();

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("environment_controller_webhook_requests_total"));
    }
}
