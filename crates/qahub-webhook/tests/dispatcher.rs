//! Wire behaviour of the HTTP dispatcher against a mock receiver.

mod common;

use common::config;
use qahub_core::DeliveryConfig;
use qahub_webhook::{
    AttemptOutcome, Dispatch, HttpDispatcher, OutcomeClass, UrlValidator, WebhookConfig,
    WebhookDelivery, WebhookSigner, WebhookVerifier, ATTEMPT_HEADER, DELIVERY_HEADER,
    EVENT_HEADER,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_bytes, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PAYLOAD: &[u8] = br#"{"packageId":"p-42","status":"COMPLETED"}"#;

fn dispatcher(delivery_config: DeliveryConfig) -> HttpDispatcher {
    HttpDispatcher::new(&delivery_config, Arc::new(UrlValidator::default())).unwrap()
}

fn delivery_for(config: &WebhookConfig) -> WebhookDelivery {
    WebhookDelivery::pending(config.id, "package.completed", PAYLOAD.to_vec(), chrono::Utc::now())
}

async fn send(
    server: &MockServer,
    route: &str,
    delivery_config: DeliveryConfig,
) -> AttemptOutcome {
    let config = config(&format!("{}{route}", server.uri()), &["*"]);
    dispatcher(delivery_config)
        .attempt(&delivery_for(&config), &config)
        .await
}

// ==================== Request Shape Tests ====================

#[tokio::test]
async fn test_signed_post_with_custom_headers() {
    let server = MockServer::start().await;
    let secret = b"whsec_test";
    let signature = WebhookSigner::new(secret).sign(PAYLOAD);

    Mock::given(method("POST"))
        .and(path("/hooks/qa"))
        .and(header("content-type", "application/json"))
        .and(header("x-signature", signature.as_str()))
        .and(header("x-team", "qa-core"))
        .and(header(EVENT_HEADER, "package.completed"))
        .and(header(ATTEMPT_HEADER, "1"))
        .and(header_exists(DELIVERY_HEADER))
        .and(body_bytes(PAYLOAD.to_vec()))
        .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&format!("{}/hooks/qa", server.uri()), &["*"])
        .with_header("X-Team", "qa-core")
        .with_secret(secret.to_vec());
    let outcome = dispatcher(DeliveryConfig::default())
        .attempt(&delivery_for(&config), &config)
        .await;

    assert_eq!(outcome.status_code, Some(200));
    assert_eq!(outcome.body.as_deref(), Some("thanks"));
    assert_eq!(outcome.classify(), OutcomeClass::Success);

    // What the receiver sees verifies with the shared secret
    let received = server.received_requests().await.unwrap();
    let sent_signature = received[0].headers.get("x-signature").unwrap().to_str().unwrap();
    assert!(WebhookVerifier::new(secret)
        .verify(&received[0].body, sent_signature)
        .is_ok());
}

#[tokio::test]
async fn test_unsigned_without_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let outcome = send(&server, "/hook", DeliveryConfig::default()).await;

    assert_eq!(outcome.status_code, Some(204));
    assert!(outcome.body.is_none());
    let received = server.received_requests().await.unwrap();
    assert!(received[0].headers.get("x-signature").is_none());
}

// ==================== Outcome Classification Tests ====================

#[tokio::test]
async fn test_status_classification() {
    for (status, expected) in [
        (500, OutcomeClass::Retryable),
        (503, OutcomeClass::Retryable),
        (429, OutcomeClass::Retryable),
        (400, OutcomeClass::Permanent),
        (401, OutcomeClass::Permanent),
        (404, OutcomeClass::Permanent),
        (410, OutcomeClass::Permanent),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;

        let outcome = send(&server, "/hook", DeliveryConfig::default()).await;

        assert_eq!(outcome.status_code, Some(status));
        assert_eq!(outcome.classify(), expected, "status {status}");
    }
}

#[tokio::test]
async fn test_timeout_is_retryable_network_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let config = DeliveryConfig::default().with_request_timeout(Duration::from_secs(1));
    let outcome = send(&server, "/slow", config).await;

    assert!(outcome.status_code.is_none());
    assert_eq!(outcome.error.as_deref(), Some("request timed out"));
    assert_eq!(outcome.classify(), OutcomeClass::Retryable);
}

#[tokio::test]
async fn test_connection_refused_is_retryable() {
    // Bind and drop a listener to get a port nobody serves
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = config(&format!("http://127.0.0.1:{port}/hook"), &["*"]);

    let outcome = dispatcher(DeliveryConfig::default())
        .attempt(&delivery_for(&config), &config)
        .await;

    assert!(outcome.status_code.is_none());
    assert!(outcome.error.is_some());
    assert_eq!(outcome.classify(), OutcomeClass::Retryable);
}

#[tokio::test]
async fn test_response_body_capture_is_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("e".repeat(100_000)))
        .mount(&server)
        .await;

    let config = DeliveryConfig {
        max_response_body_bytes: 64,
        ..DeliveryConfig::default()
    };
    let outcome = send(&server, "/hook", config).await;

    assert_eq!(outcome.body.as_deref().map(str::len), Some(64));
}

// ==================== Redirect Tests ====================

#[tokio::test]
async fn test_redirect_to_internal_address_is_rejected() {
    for location in [
        "http://169.254.169.254/latest/meta-data/".to_string(),
        "http://10.0.0.5/admin".to_string(),
        "http://localhost/".to_string(),
    ] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", location.as_str()))
            .mount(&server)
            .await;

        let outcome = send(&server, "/hook", DeliveryConfig::default()).await;

        assert_eq!(outcome.classify(), OutcomeClass::Rejected, "{location}");
        let reason = outcome.rejected.unwrap();
        assert_eq!(reason.category(), "private/internal");
        assert!(outcome
            .error
            .unwrap()
            .starts_with("blocked by safety policy"));
    }
}

#[tokio::test]
async fn test_redirect_to_blocked_port_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(307).insert_header("location", "http://hooks.example.com:22/"),
        )
        .mount(&server)
        .await;

    let outcome = send(&server, "/hook", DeliveryConfig::default()).await;

    assert_eq!(outcome.rejected.unwrap().category(), "blocked port");
}

#[tokio::test]
async fn test_safe_redirect_is_followed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(307).insert_header("location", "http://192.0.2.10/landing"),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Documentation range: passes the policy but nothing answers there
    let config = DeliveryConfig {
        connect_timeout_secs: 1,
        ..DeliveryConfig::default().with_request_timeout(Duration::from_secs(2))
    };
    let outcome = send(&server, "/hook", config).await;

    assert!(outcome.rejected.is_none());
    assert!(outcome.status_code.is_none());
    assert!(outcome.error.is_some());
    assert_eq!(outcome.classify(), OutcomeClass::Retryable);
}

#[tokio::test]
async fn test_redirects_beyond_limit_return_the_redirect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/moved"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/moved"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let config = DeliveryConfig {
        max_redirects: 0,
        ..DeliveryConfig::default()
    };
    let outcome = send(&server, "/hook", config).await;

    assert_eq!(outcome.status_code, Some(302));
    assert!(outcome.rejected.is_none());
    assert_eq!(outcome.classify(), OutcomeClass::Permanent);
}

#[tokio::test]
async fn test_redirect_chain_within_limit_is_followed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/one"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/two"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/two"))
        .respond_with(ResponseTemplate::new(307).insert_header("location", "/three"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/three"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let two = DeliveryConfig {
        max_redirects: 2,
        ..DeliveryConfig::default()
    };
    assert_eq!(send(&server, "/one", two).await.status_code, Some(200));

    let one = DeliveryConfig {
        max_redirects: 1,
        ..DeliveryConfig::default()
    };
    assert_eq!(send(&server, "/one", one).await.status_code, Some(307));
}

// ==================== Resolution Tests ====================

#[tokio::test]
async fn test_hostname_resolution_is_pinned() {
    // Listening on loopback, addressed by name
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let port = server.address().port();
    let config = config(&format!("http://localhost:{port}/hook"), &["*"]);

    let outcome = dispatcher(DeliveryConfig::default())
        .attempt(&delivery_for(&config), &config)
        .await;

    assert_eq!(outcome.classify(), OutcomeClass::Rejected);
    assert_eq!(outcome.rejected.unwrap().category(), "private/internal");
    assert!(server.received_requests().await.unwrap().is_empty());
}
