//! Outbound HTTP for webhook deliveries.
//!
//! [`WebhookClient::deliver`] never returns an error: every exit path, including
//! timeouts and connection failures, is folded into a [`DeliveryOutcome`] so the
//! caller can always write exactly one delivery log row.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use tracing::{debug, instrument};

use crate::db::models::delivery_logs::DeliveryStatus;
use crate::db::models::subscriptions::Subscriber;
use crate::types::abbrev_uuid;
use crate::webhooks::signing;

/// Sent as `User-Agent` on every delivery.
pub const USER_AGENT: &str = concat!("hookd/", env!("CARGO_PKG_VERSION"));

/// Status recorded when no HTTP response was received.
pub const TRANSPORT_FAILURE_STATUS: i32 = 500;

/// Most response body bytes kept for the delivery log.
pub const MAX_CAPTURED_BODY_BYTES: usize = 64 * 1024;

/// Appended to a captured body that hit [`MAX_CAPTURED_BODY_BYTES`].
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Result of one delivery attempt to one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub response_status_code: i32,
    /// The response body (capped, NUL escaped), or the transport error text.
    pub response_body: String,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Success
    }

    fn transport_failure(error: &reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            format!("request timed out: {error}")
        } else {
            error.to_string()
        };

        Self {
            status: DeliveryStatus::Failed,
            response_status_code: TRANSPORT_FAILURE_STATUS,
            response_body: message,
        }
    }
}

/// Signs and POSTs webhook payloads.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
    signature_header: HeaderName,
}

impl WebhookClient {
    pub fn new(timeout: Duration, signature_header: &str) -> anyhow::Result<Self> {
        let signature_header = HeaderName::from_bytes(signature_header.as_bytes())?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { http, signature_header })
    }

    /// POST `body` to the subscriber, signed with its secret.
    ///
    /// `body` is sent byte-for-byte as signed.
    #[instrument(skip_all, fields(subscription_id = %abbrev_uuid(&subscriber.id), url = %subscriber.endpoint_url))]
    pub async fn deliver(&self, subscriber: &Subscriber, body: Bytes) -> DeliveryOutcome {
        let signature = signing::sign(&subscriber.secret_key, &body);
        // Hex digits are always a valid header value
        let signature = HeaderValue::from_str(&signature).unwrap_or_else(|_| HeaderValue::from_static(""));

        let response = self
            .http
            .post(&subscriber.endpoint_url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(self.signature_header.clone(), signature)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Webhook request failed without a response");
                return DeliveryOutcome::transport_failure(&e);
            }
        };

        let status = response.status();
        let response_body = match capture_body(response).await {
            Ok(text) => text,
            // Headers arrived but the body didn't, e.g. a timeout mid-stream
            Err(e) if status.is_success() => return DeliveryOutcome::transport_failure(&e),
            Err(e) => format!("failed to read response body: {e}"),
        };

        debug!(status = status.as_u16(), "Webhook response received");

        DeliveryOutcome {
            status: if status.is_success() {
                DeliveryStatus::Success
            } else {
                DeliveryStatus::Failed
            },
            response_status_code: i32::from(status.as_u16()),
            response_body,
        }
    }
}

/// Read at most [`MAX_CAPTURED_BODY_BYTES`] of the body as text.
///
/// The rest of an oversized body is never read.
async fn capture_body(mut response: reqwest::Response) -> reqwest::Result<String> {
    let mut captured = Vec::new();
    let mut truncated = false;

    while let Some(chunk) = response.chunk().await? {
        let room = MAX_CAPTURED_BODY_BYTES - captured.len();
        if chunk.len() > room {
            captured.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        captured.extend_from_slice(&chunk);
    }

    let mut body = escape_nul(&String::from_utf8_lossy(&captured));
    if truncated {
        body.push_str(TRUNCATION_MARKER);
    }
    Ok(body)
}

/// Postgres `TEXT` rejects `\0`, so it is stored as the JSON escape `\u0000`.
fn escape_nul(body: &str) -> String {
    body.replace('\0', "\\u0000")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subscriber(url: String) -> Subscriber {
        Subscriber {
            id: Uuid::new_v4(),
            endpoint_url: url,
            secret_key: "abc123".to_string(),
        }
    }

    fn client() -> WebhookClient {
        WebhookClient::new(Duration::from_secs(5), "X-Hookd-Signature").unwrap()
    }

    #[tokio::test]
    async fn test_successful_delivery_is_signed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header(
                "x-hookd-signature",
                "1184fb1bbd72c7b56146a72fca8cf0819ed8c97d3f98e9b6d86d9a1dfa6ab5dc",
            ))
            .and(header("user-agent", USER_AGENT))
            .and(body_string(r#"{"id":1}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = client()
            .deliver(
                &subscriber(format!("{}/hook", mock_server.uri())),
                Bytes::from_static(br#"{"id":1}"#),
            )
            .await;

        assert_eq!(
            outcome,
            DeliveryOutcome {
                status: DeliveryStatus::Success,
                response_status_code: 200,
                response_body: r#"{"ok":true}"#.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_custom_signature_header() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(
                "x-algohire-signature",
                "1184fb1bbd72c7b56146a72fca8cf0819ed8c97d3f98e9b6d86d9a1dfa6ab5dc",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = WebhookClient::new(Duration::from_secs(5), "X-AlgoHire-Signature").unwrap();
        let outcome = client
            .deliver(&subscriber(mock_server.uri()), Bytes::from_static(br#"{"id":1}"#))
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.response_status_code, 204);
    }

    #[tokio::test]
    async fn test_non_2xx_is_failure_with_real_status_and_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let outcome = client()
            .deliver(&subscriber(mock_server.uri()), Bytes::from_static(b"{}"))
            .await;

        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.response_status_code, 503);
        assert_eq!(outcome.response_body, "maintenance");
    }

    #[tokio::test]
    async fn test_connection_refused_records_500() {
        // Point to a port that's not listening
        let outcome = client()
            .deliver(&subscriber("http://127.0.0.1:1".to_string()), Bytes::from_static(b"{}"))
            .await;

        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.response_status_code, TRANSPORT_FAILURE_STATUS);
        assert!(!outcome.response_body.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_records_500() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::new(Duration::from_millis(100), "X-Hookd-Signature").unwrap();
        let outcome = client
            .deliver(&subscriber(mock_server.uri()), Bytes::from_static(b"{}"))
            .await;

        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.response_status_code, TRANSPORT_FAILURE_STATUS);
        assert!(outcome.response_body.contains("timed out"));
    }

    #[tokio::test]
    async fn test_nul_bytes_in_body_are_escaped() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok\0".to_vec()))
            .mount(&mock_server)
            .await;

        let outcome = client()
            .deliver(&subscriber(mock_server.uri()), Bytes::from_static(b"{}"))
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.response_body, "ok\\u0000");
        assert!(!outcome.response_body.contains('\0'));
    }

    #[tokio::test]
    async fn test_oversized_body_is_truncated() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(MAX_CAPTURED_BODY_BYTES * 3)))
            .mount(&mock_server)
            .await;

        let outcome = client()
            .deliver(&subscriber(mock_server.uri()), Bytes::from_static(b"{}"))
            .await;

        assert_eq!(outcome.response_status_code, 500);
        assert_eq!(
            outcome.response_body.len(),
            MAX_CAPTURED_BODY_BYTES + TRUNCATION_MARKER.len()
        );
        assert!(outcome.response_body.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_body_at_cap_is_not_marked_truncated() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("y".repeat(MAX_CAPTURED_BODY_BYTES)))
            .mount(&mock_server)
            .await;

        let outcome = client()
            .deliver(&subscriber(mock_server.uri()), Bytes::from_static(b"{}"))
            .await;

        assert_eq!(outcome.response_body.len(), MAX_CAPTURED_BODY_BYTES);
        assert!(!outcome.response_body.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_invalid_signature_header_is_rejected() {
        assert!(WebhookClient::new(Duration::from_secs(5), "bad header").is_err());
    }
}
