//! API routes

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use outpost_common::config::ApiConfig;
use outpost_core::Mailer;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::structured_payload_too_large;
use crate::handlers::{account, configuration_sets, health, identities, messages, send, templates};
use crate::state::AppState;

/// Create the API router
pub fn create_router(mailer: Arc<Mailer>, config: &ApiConfig) -> Router {
    let body_limit = body_limit(mailer.max_message_size());
    let state = Arc::new(AppState { mailer });

    let health_routes = Router::new()
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    let send_routes = Router::new()
        .route("/", post(send::send_email))
        .route("/templated", post(send::send_templated_email))
        .route("/bulk", post(send::send_bulk_templated_email))
        .route("/raw", post(send::send_raw_email));

    let template_routes = Router::new()
        .route("/", get(templates::list_templates))
        .route("/", post(templates::create_template))
        .route("/:name", get(templates::get_template))
        .route("/:name", put(templates::update_template))
        .route("/:name", delete(templates::delete_template))
        .route("/:name/test-render", post(templates::test_render_template));

    let identity_routes = Router::new()
        .route("/", get(identities::list_identities))
        .route("/email", post(identities::verify_email_identity))
        .route("/email/confirm", post(identities::confirm_email_identity))
        .route("/domain", post(identities::verify_domain_identity))
        .route(
            "/verification-attributes",
            post(identities::get_identity_verification_attributes),
        )
        .route("/:identity", delete(identities::delete_identity))
        .route("/:identity/dkim", post(identities::verify_domain_dkim))
        .route("/:identity/dkim", put(identities::set_identity_dkim_enabled));

    let configuration_set_routes = Router::new()
        .route("/", get(configuration_sets::list_configuration_sets))
        .route("/", post(configuration_sets::create_configuration_set))
        .route("/:name", get(configuration_sets::describe_configuration_set))
        .route("/:name", delete(configuration_sets::delete_configuration_set))
        .route(
            "/:name/sending-enabled",
            put(configuration_sets::update_sending_enabled),
        )
        .route(
            "/:name/tracking-domain",
            put(configuration_sets::set_tracking_domain),
        )
        .route(
            "/:name/event-destinations",
            post(configuration_sets::create_event_destination),
        )
        .route(
            "/:name/event-destinations/:destination",
            delete(configuration_sets::delete_event_destination),
        );

    let account_routes = Router::new()
        .route("/quota", get(account::get_send_quota))
        .route("/statistics", get(account::get_send_statistics))
        .route("/sending-enabled", get(account::get_sending_enabled))
        .route("/sending-enabled", put(account::update_sending_enabled));

    let message_routes = Router::new()
        .route("/:id", get(messages::get_message))
        .route("/:id/cancel", post(messages::cancel_message))
        .route("/:id/complaint", post(messages::record_complaint));

    let api_v1 = Router::new()
        .nest("/email", send_routes)
        .nest("/templates", template_routes)
        .nest("/identities", identity_routes)
        .nest("/configuration-sets", configuration_set_routes)
        .nest("/account", account_routes)
        .nest("/messages", message_routes);

    Router::new()
        .nest("/health", health_routes)
        .nest("/v1", api_v1)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::map_response(move |response: axum::response::Response| {
            structured_payload_too_large(response, body_limit)
        }))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Largest request body: a base64-encoded message at the size limit plus
/// room for the JSON around it
fn body_limit(max_message_size: usize) -> usize {
    max_message_size.saturating_mul(4) / 3 + BODY_ENVELOPE_SLACK
}

const BODY_ENVELOPE_SLACK: usize = 64 * 1024;

/// `*` allows any origin; an empty list allows none
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use outpost_common::config::{Config, ManagementConfig, SendingConfig};
    use outpost_core::{
        DeliveryOutcome, Envelope, MailTransport, Stores, VerificationCheck, VerificationChecker,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct AcceptAll;

    #[async_trait]
    impl MailTransport for AcceptAll {
        async fn send(&self, _envelope: &Envelope, _message: &[u8]) -> DeliveryOutcome {
            DeliveryOutcome::Delivered {
                response: "250 OK".into(),
            }
        }
    }

    struct NeverVerified;

    #[async_trait]
    impl VerificationChecker for NeverVerified {
        async fn check_domain(&self, _domain: &str, _token: &str) -> VerificationCheck {
            VerificationCheck::NotFound
        }
    }

    fn router_with(calls_per_second: f64) -> Router {
        let config = Config {
            sending: SendingConfig {
                max_send_rate: 0.0,
                ..Default::default()
            },
            management: ManagementConfig { calls_per_second },
            ..Default::default()
        };
        let mailer = Mailer::new(
            &config,
            Stores::memory(),
            Arc::new(AcceptAll),
            Arc::new(NeverVerified),
            Vec::new(),
        )
        .unwrap();
        create_router(Arc::new(mailer), &config.api)
    }

    fn router() -> Router {
        router_with(0.0)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Verifies `sender@example.com` through the confirmation flow
    async fn verified_sender(app: &Router) {
        let (status, body) = call(
            app,
            "POST",
            "/v1/identities/email",
            Some(json!({ "emailAddress": "sender@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let token = body["verificationToken"].as_str().unwrap().to_string();

        let (status, _) = call(
            app,
            "POST",
            "/v1/identities/email/confirm",
            Some(json!({ "emailAddress": "sender@example.com", "token": token })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_liveness() {
        let app = router();
        let (status, body) = call(&app, "GET", "/health/live", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "alive" }));
    }

    #[tokio::test]
    async fn test_readiness_with_memory_storage() {
        let app = router();
        let (status, body) = call(&app, "GET", "/health/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ready"));
        assert_eq!(body["storageReady"], json!(true));
        assert_eq!(body["queueDepth"], json!(0));
    }

    #[tokio::test]
    async fn test_send_email_returns_message_id() {
        let app = router();
        verified_sender(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/v1/email",
            Some(json!({
                "source": "sender@example.com",
                "destination": { "to": ["a@example.org"] },
                "subject": "Hi",
                "text": "Hello"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let id = body["messageId"].as_str().unwrap();
        let (status, record) = call(&app, "GET", &format!("/v1/messages/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["state"], json!("Queued"));
    }

    #[tokio::test]
    async fn test_unverified_sender_error_shape() {
        let app = router();
        let (status, body) = call(
            &app,
            "POST",
            "/v1/email",
            Some(json!({
                "source": "nobody@unknown.test",
                "destination": { "to": ["a@example.org"] },
                "subject": "Hi",
                "text": "Hello"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("SenderNotVerified"));
        assert_eq!(body["kind"], json!("validation"));
        assert!(body["message"].as_str().unwrap().contains("nobody@unknown.test"));
    }

    #[tokio::test]
    async fn test_too_many_recipients() {
        let app = router();
        verified_sender(&app).await;
        let to: Vec<String> = (0..51).map(|i| format!("user{}@example.org", i)).collect();

        let (status, body) = call(
            &app,
            "POST",
            "/v1/email",
            Some(json!({
                "source": "sender@example.com",
                "destination": { "to": to },
                "subject": "Hi",
                "text": "Hello"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("TooManyRecipients"));
    }

    #[tokio::test]
    async fn test_template_lifecycle_and_bulk() {
        let app = router();
        verified_sender(&app).await;

        let (status, _) = call(
            &app,
            "POST",
            "/v1/templates",
            Some(json!({
                "name": "welcome",
                "subjectPart": "Welcome {{name}}",
                "textPart": "Hi {{name}}"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/templates",
            Some(json!({ "name": "welcome", "subjectPart": "again", "textPart": "again" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("TemplateAlreadyExists"));

        let (status, body) = call(
            &app,
            "POST",
            "/v1/templates/welcome/test-render",
            Some(json!({ "templateData": { "name": "Ada" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["renderedTemplate"]
            .as_str()
            .unwrap()
            .contains("Welcome Ada"));

        let too_many: Vec<String> = (0..51).map(|i| format!("u{}@example.org", i)).collect();
        let (status, body) = call(
            &app,
            "POST",
            "/v1/email/bulk",
            Some(json!({
                "source": "sender@example.com",
                "template": "welcome",
                "defaultTemplateData": { "name": "friend" },
                "destinations": [
                    { "destination": { "to": ["a@example.org"] } },
                    { "destination": { "to": too_many } },
                    { "destination": { "to": ["c@example.org"] },
                      "replacementTemplateData": { "name": "Cy" } }
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let statuses: Vec<&str> = body["status"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["Success", "Failed", "Success"]);
        assert_eq!(body["status"][1]["error"], json!("TooManyRecipients"));

        let (status, _) = call(&app, "DELETE", "/v1/templates/welcome", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, "GET", "/v1/templates/welcome", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], json!("existence"));
    }

    #[tokio::test]
    async fn test_raw_email_base64() {
        let app = router();
        verified_sender(&app).await;

        let raw = "From: sender@example.com\r\nTo: a@example.org\r\nSubject: Raw\r\n\r\nBody\r\n";
        let data = base64::engine::general_purpose::STANDARD.encode(raw);
        let (status, body) = call(
            &app,
            "POST",
            "/v1/email/raw",
            Some(json!({ "rawMessage": { "data": data } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["messageId"].is_string());

        let (status, body) = call(
            &app,
            "POST",
            "/v1/email/raw",
            Some(json!({ "rawMessage": { "data": "not base64!" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("InvalidParameterValue"));
    }

    /// Raw message of roughly `size` bytes, base64-encoded
    fn raw_of_size(size: usize) -> String {
        let mut raw =
            String::from("From: sender@example.com\r\nTo: a@example.org\r\nSubject: Big\r\n\r\n");
        let line = format!("{}\r\n", "x".repeat(998));
        while raw.len() < size {
            raw.push_str(&line);
        }
        base64::engine::general_purpose::STANDARD.encode(raw)
    }

    #[tokio::test]
    async fn test_raw_email_near_size_limit_is_accepted() {
        let app = router();
        verified_sender(&app).await;

        let data = raw_of_size(9 * 1024 * 1024);
        let (status, body) = call(
            &app,
            "POST",
            "/v1/email/raw",
            Some(json!({ "rawMessage": { "data": data } })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["messageId"].is_string());
    }

    #[tokio::test]
    async fn test_raw_email_over_size_limit_is_structured_413() {
        let app = router();
        verified_sender(&app).await;

        let data = raw_of_size(10 * 1024 * 1024 + 512 * 1024);
        let (status, body) = call(
            &app,
            "POST",
            "/v1/email/raw",
            Some(json!({ "rawMessage": { "data": data } })),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], json!("PayloadTooLarge"));
        assert_eq!(body["kind"], json!("validation"));
        assert!(body["message"].is_string());
    }

    #[test]
    fn test_body_limit_fits_encoded_message() {
        let max = 10 * 1024 * 1024;
        assert!(body_limit(max) > max / 3 * 4 + 1024);
        assert!(body_limit(usize::MAX) > BODY_ENVELOPE_SLACK);
    }

    #[tokio::test]
    async fn test_configuration_set_routes() {
        let app = router();

        let (status, _) = call(
            &app,
            "POST",
            "/v1/configuration-sets",
            Some(json!({ "name": "marketing" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/configuration-sets/marketing/event-destinations",
            Some(json!({
                "name": "bounces",
                "matchingEventTypes": ["Bounce", "Complaint"],
                "sns": { "topic": "arn:aws:sns:us-east-1:123456789012:bounces" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["eventDestinations"][0]["name"], json!("bounces"));

        let (status, _) = call(
            &app,
            "PUT",
            "/v1/configuration-sets/marketing/sending-enabled",
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = call(&app, "GET", "/v1/configuration-sets/marketing", None).await;
        assert_eq!(body["sendingEnabled"], json!(false));

        let (_, body) = call(&app, "GET", "/v1/configuration-sets", None).await;
        assert_eq!(body, json!({ "configurationSets": ["marketing"] }));

        let (status, body) = call(&app, "GET", "/v1/configuration-sets/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("ConfigurationSetDoesNotExist"));
    }

    #[tokio::test]
    async fn test_account_pause() {
        let app = router();
        verified_sender(&app).await;

        let (status, _) = call(
            &app,
            "PUT",
            "/v1/account/sending-enabled",
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/email",
            Some(json!({
                "source": "sender@example.com",
                "destination": { "to": ["a@example.org"] },
                "subject": "Hi",
                "text": "Hello"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], json!("AccountSendingPaused"));
        assert_eq!(body["kind"], json!("capacity"));

        let (status, body) = call(&app, "GET", "/v1/account/quota", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sentLast24Hours"], json!(0));
    }

    #[tokio::test]
    async fn test_identity_listing_and_attributes() {
        let app = router();
        verified_sender(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/v1/identities/domain",
            Some(json!({ "domain": "example.net" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["verificationToken"].is_string());

        let (_, body) = call(&app, "GET", "/v1/identities?identityType=Domain", None).await;
        assert_eq!(body, json!({ "identities": ["example.net"] }));

        let (status, body) = call(
            &app,
            "POST",
            "/v1/identities/verification-attributes",
            Some(json!({ "identities": ["sender@example.com", "example.net"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let attributes = &body["verificationAttributes"];
        assert_eq!(
            attributes["sender@example.com"]["verificationStatus"],
            json!("Success")
        );
        assert_eq!(attributes["example.net"]["verificationStatus"], json!("Pending"));

        let (status, _) = call(&app, "DELETE", "/v1/identities/example.net", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_cancel_and_unknown_message() {
        let app = router();
        verified_sender(&app).await;

        let (_, body) = call(
            &app,
            "POST",
            "/v1/email",
            Some(json!({
                "source": "sender@example.com",
                "destination": { "to": ["a@example.org"] },
                "subject": "Hi",
                "text": "Hello"
            })),
        )
        .await;
        let id = body["messageId"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", &format!("/v1/messages/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("Cancelled"));

        // Complaints only apply to sent messages
        let (status, body) =
            call(&app, "POST", &format!("/v1/messages/{}/complaint", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("InvalidState"));

        let (status, body) = call(
            &app,
            "GET",
            "/v1/messages/00000000-0000-0000-0000-000000000000",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("MessageDoesNotExist"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_management_throttle() {
        let app = router_with(1.0);

        let (status, _) = call(&app, "GET", "/v1/templates", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/v1/templates", None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], json!("Throttling"));
    }
}
