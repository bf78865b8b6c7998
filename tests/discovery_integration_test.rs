// Integration tests for external URL discovery
//
// Time is paused so the load balancer wait runs instantly.

mod common;

use common::{FakeServiceLookup, cluster_ip_service, load_balancer_service};
use environment_controller::discovery::{DiscoveryError, EndpointDiscoverer, EXPOSE_URL_ANNOTATION};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(10);
const INTERVAL: Duration = Duration::from_secs(3);

fn discoverer(lookup: Arc<FakeServiceLookup>) -> EndpointDiscoverer {
    EndpointDiscoverer::new(lookup).with_timing(TIMEOUT, INTERVAL)
}

#[tokio::test(start_paused = true)]
async fn test_load_balancer_without_address_times_out() {
    let lookup = Arc::new(FakeServiceLookup::new(vec![load_balancer_service(None)]));
    let start = Instant::now();

    let err = discoverer(lookup.clone()).discover().await.unwrap_err();

    assert!(matches!(err, DiscoveryError::TimedOut { .. }));
    assert!(start.elapsed() >= TIMEOUT);
    // initial lookup plus polls at 0s, 3s, 6s, 9s and 12s
    assert_eq!(lookup.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_non_load_balancer_fails_immediately() {
    let lookup = Arc::new(FakeServiceLookup::new(vec![cluster_ip_service()]));
    let start = Instant::now();

    let err = discoverer(lookup.clone()).discover().await.unwrap_err();

    assert!(matches!(err, DiscoveryError::NoExternalUrl { .. }));
    assert_eq!(lookup.calls(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_address_assigned_while_waiting() {
    let lookup = Arc::new(FakeServiceLookup::new(vec![
        load_balancer_service(None),
        load_balancer_service(None),
        load_balancer_service(None),
        load_balancer_service(Some("10.0.0.7")),
    ]));

    let url = discoverer(lookup.clone()).discover().await.unwrap();

    assert_eq!(url, "http://10.0.0.7");
    assert_eq!(lookup.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_expose_annotation_needs_no_wait() {
    let mut service = cluster_ip_service();
    service.metadata.annotations = Some(BTreeMap::from([(
        EXPOSE_URL_ANNOTATION.to_string(),
        "https://environment-controller.jx.example.com".to_string(),
    )]));
    let lookup = Arc::new(FakeServiceLookup::new(vec![service]));

    let url = discoverer(lookup.clone()).discover().await.unwrap();

    assert_eq!(url, "https://environment-controller.jx.example.com");
    assert_eq!(lookup.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_last_lookup_error() {
    let lookup = Arc::new(FakeServiceLookup::with_responses(vec![
        Some(load_balancer_service(None)),
        Some(load_balancer_service(None)),
        None,
    ]));
    let start = Instant::now();

    let err = discoverer(lookup.clone()).discover().await.unwrap_err();

    match err {
        DiscoveryError::Lookup { name, source, .. } => {
            assert_eq!(name, "environment-controller");
            assert!(source.to_string().contains("unable to handle the request"));
        },
        other => panic!("expected the last lookup error, got {}", other),
    }
    assert!(start.elapsed() >= TIMEOUT);
    assert_eq!(lookup.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_lookup_errors_while_waiting_are_retried() {
    let lookup = Arc::new(FakeServiceLookup::with_responses(vec![
        Some(load_balancer_service(None)),
        None,
        None,
        Some(load_balancer_service(Some("10.0.0.8"))),
    ]));

    let url = discoverer(lookup.clone()).discover().await.unwrap();

    assert_eq!(url, "http://10.0.0.8");
    assert_eq!(lookup.calls(), 4);
}
