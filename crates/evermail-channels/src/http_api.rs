//! HTTP API transport — posts messages to a SendGrid-shaped JSON mail
//! API with bearer auth.
//!
//! Error classification: 429 and 5xx responses are transient (the
//! dispatcher backs off and retries), every other 4xx is permanent.

use async_trait::async_trait;
use serde::Serialize;

use evermail_core::config::HttpApiConfig;
use evermail_core::error::{DeliveryError, EvermailError, Result};
use evermail_core::traits::MailTransport;
use evermail_core::types::{Receipt, RenderedMessage};

pub struct HttpApiTransport {
    config: HttpApiConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct MailSendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a str,
}

impl HttpApiTransport {
    pub fn new(config: HttpApiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(EvermailError::Config(
                "http transport requires transport.http.api_key".into(),
            ));
        }
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn payload<'a>(&'a self, message: &'a RenderedMessage) -> MailSendRequest<'a> {
        // Plain text part first when present, per the API's ordering rule.
        let mut content = Vec::new();
        if let Some(text) = &message.text {
            content.push(Content {
                kind: "text/plain",
                value: text,
            });
        }
        content.push(Content {
            kind: "text/html",
            value: &message.html,
        });
        MailSendRequest {
            personalizations: vec![Personalization {
                to: vec![Address { email: &message.to }],
            }],
            from: Address {
                email: from_address(&self.config.from),
            },
            subject: &message.subject,
            content,
        }
    }
}

/// "Name <addr>" → "addr"; bare addresses pass through.
fn from_address(from: &str) -> &str {
    match (from.rfind('<'), from.rfind('>')) {
        (Some(open), Some(close)) if open < close => &from[open + 1..close],
        _ => from,
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> DeliveryError {
    if status.as_u16() == 429 || status.is_server_error() {
        DeliveryError::Transient(format!("provider returned {status}: {body}"))
    } else {
        DeliveryError::Permanent(format!("provider returned {status}: {body}"))
    }
}

#[async_trait]
impl MailTransport for HttpApiTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        message: &RenderedMessage,
    ) -> std::result::Result<Receipt, DeliveryError> {
        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&self.payload(message))
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("HTTP send: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| format!("http-{}", uuid::Uuid::new_v4()));
        tracing::info!("📤 API accepted message for {} ({message_id})", message.to);
        Ok(Receipt { message_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_transient() {
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_server_error_is_transient() {
        let err = classify_status(reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_client_error_is_permanent() {
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, "bad payload");
        assert!(err.is_permanent());
    }

    #[test]
    fn test_from_address_strips_display_name() {
        assert_eq!(from_address("Evermail <noreply@example.com>"), "noreply@example.com");
        assert_eq!(from_address("noreply@example.com"), "noreply@example.com");
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let config = HttpApiConfig::default();
        assert!(HttpApiTransport::new(config).is_err());
    }
}
