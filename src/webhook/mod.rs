use crate::metrics::{WEBHOOK_REJECTIONS_TOTAL, WEBHOOK_REQUESTS_TOTAL};
use crate::signature;
use axum::body::Bytes;
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::debug;

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

/// The only content type accepted on the trigger path
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Event type assumed when the provider does not send one
pub const DEFAULT_EVENT_TYPE: &str = "push";

/// Upper bound on a webhook body (GitHub caps deliveries at 25 MB)
pub const MAX_PAYLOAD_BYTES: usize = 25 * 1024 * 1024;

/// An authenticated webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event_type: String,
    pub delivery_id: String,
    pub payload: Bytes,
}

/// A refused webhook request, rendered as a plaintext error response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: String,
}

impl Rejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        debug!(
            status_code = status.as_u16(),
            response = %message,
            "Rejecting webhook request"
        );
        WEBHOOK_REJECTIONS_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();
        Self { status, message }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Result of validating a request against the trigger path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// A plain GET, e.g. a load balancer health probe. Nothing to do.
    Probe,
    Accepted(WebhookEvent),
    Rejected(Rejection),
}

impl WebhookOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Status code to answer with; `OK` for probes and accepted deliveries
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Probe | Self::Accepted(_) => StatusCode::OK,
            Self::Rejected(rejection) => rejection.status,
        }
    }

    pub fn event(&self) -> Option<&WebhookEvent> {
        match self {
            Self::Accepted(event) => Some(event),
            _ => None,
        }
    }
}

/// Validate that `request` is a GitHub-style webhook signed with `secret`.
///
/// Checks run in order and the first failure wins:
/// method, provider headers, signature header, content type, body, signature.
/// When `require_github_headers` is false a missing event type defaults to `push`.
pub async fn validate(
    request: Request,
    secret: &[u8],
    require_github_headers: bool,
) -> WebhookOutcome {
    WEBHOOK_REQUESTS_TOTAL.inc();

    let method = request.method().clone();
    if method == Method::GET {
        return WebhookOutcome::Probe;
    }
    if method != Method::POST {
        return reject(StatusCode::METHOD_NOT_ALLOWED, "405 Method not allowed");
    }

    let headers = request.headers();
    let mut event_type = header_value(headers, EVENT_HEADER).map(str::to_string);
    let delivery_id = header_value(headers, DELIVERY_HEADER).map(str::to_string);

    if require_github_headers {
        if event_type.is_none() {
            return reject(
                StatusCode::BAD_REQUEST,
                format!("400 Bad Request: Missing {} Header", EVENT_HEADER),
            );
        }
        if delivery_id.is_none() {
            return reject(
                StatusCode::BAD_REQUEST,
                format!("400 Bad Request: Missing {} Header", DELIVERY_HEADER),
            );
        }
    } else if event_type.is_none() {
        event_type = Some(DEFAULT_EVENT_TYPE.to_string());
    }

    let Some(sig) = header_value(headers, SIGNATURE_HEADER).map(str::to_string) else {
        return reject(
            StatusCode::FORBIDDEN,
            format!("403 Forbidden: Missing {}", SIGNATURE_HEADER),
        );
    };

    if header_value(headers, header::CONTENT_TYPE.as_str()) != Some(JSON_CONTENT_TYPE) {
        return reject(
            StatusCode::BAD_REQUEST,
            "400 Bad Request: Hook only accepts content-type: application/json - please reconfigure this hook",
        );
    }

    let payload = match axum::body::to_bytes(request.into_body(), MAX_PAYLOAD_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to read webhook body: {}", e);
            return reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "500 Internal Server Error: Failed to read request body",
            );
        },
    };

    if !signature::verify(&payload, &sig, secret) {
        return reject(
            StatusCode::FORBIDDEN,
            format!("403 Forbidden: Invalid {}", SIGNATURE_HEADER),
        );
    }

    WebhookOutcome::Accepted(WebhookEvent {
        event_type: event_type.unwrap_or_default(),
        delivery_id: delivery_id.unwrap_or_default(),
        payload,
    })
}

fn reject(status: StatusCode, message: impl Into<String>) -> WebhookOutcome {
    WebhookOutcome::Rejected(Rejection::new(status, message))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
