//! REST implementation of the ticket command port.
//!
//! Talks to the ticket API with reqwest. Each request carries the outbox
//! entry's idempotency key in the `Idempotency-Key` header, plus the bearer
//! token when one is stored. Failures are classified here, at the boundary:
//! transport problems, throttling, auth and 5xx are transient; any other
//! rejection is terminal.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::RemoteError;
use crate::remote::{TicketCommandPort, TicketCreated, TicketLinePayload};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the API base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment (paths below already start with it)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Transport failures never reached a verdict from the server, so they are
/// always worth retrying with the same key.
fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    let message = if err.is_connect() {
        format!("Cannot reach ticket API at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid ticket API URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    RemoteError::Transient(message)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(status.as_u16(), 401 | 403 | 408 | 425 | 429)
}

fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let body = body.trim();
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string());
    let message = if detail.is_empty() {
        format!("{}", status.as_u16())
    } else {
        format!("{} {}", status.as_u16(), detail)
    };

    if is_retryable_status(status) {
        RemoteError::Transient(message)
    } else {
        RemoteError::Terminal(message)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RestTicketPort {
    base_url: String,
    client: Client,
    access_token: Option<Zeroizing<String>>,
}

impl RestTicketPort {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        access_token: Option<Zeroizing<String>>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            client,
            access_token: access_token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, path: &str, body: &Value, idempotency_key: &str) -> Result<Value, RemoteError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(token) = self.access_token.as_ref() {
            req = req.bearer_auth(token.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        // A body cut off mid-read leaves the outcome unknown; retry with the same key.
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !status.is_success() {
            let err = status_error(status, &text);
            warn!(
                path,
                status = status.as_u16(),
                terminal = err.is_terminal(),
                "ticket API rejected request"
            );
            return Err(err);
        }

        debug!(path, status = status.as_u16(), "ticket API request ok");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::Terminal(format!("Invalid JSON from ticket API: {e}")))
    }
}

#[async_trait]
impl TicketCommandPort for RestTicketPort {
    async fn create_ticket(&self, idempotency_key: &str) -> Result<TicketCreated, RemoteError> {
        let body = self
            .post("/api/tickets", &serde_json::json!({}), idempotency_key)
            .await?;
        serde_json::from_value::<TicketCreated>(body)
            .map_err(|e| RemoteError::Terminal(format!("Unexpected create-ticket response: {e}")))
    }

    async fn add_line(
        &self,
        ticket_id: &str,
        line: &TicketLinePayload,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let body = serde_json::to_value(line)
            .map_err(|e| RemoteError::Terminal(format!("Unserialisable line payload: {e}")))?;
        let path = format!("/api/tickets/{}/lines", percent_encode(ticket_id));
        self.post(&path, &body, idempotency_key).await.map(|_| ())
    }

    async fn pay_cash(&self, ticket_id: &str, idempotency_key: &str) -> Result<(), RemoteError> {
        let path = format!("/api/tickets/{}/pay/cash", percent_encode(ticket_id));
        self.post(&path, &serde_json::json!({}), idempotency_key)
            .await
            .map(|_| ())
    }

    async fn pay_mock(
        &self,
        ticket_id: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<(), RemoteError> {
        let path = format!("/api/tickets/{}/pay/mock", percent_encode(ticket_id));
        let body = if payload.is_null() {
            serde_json::json!({})
        } else {
            payload.clone()
        };
        self.post(&path, &body, idempotency_key).await.map(|_| ())
    }
}
