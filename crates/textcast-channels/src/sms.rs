//! Outbound SMS transports.
//!
//! Contract: accept an E.164 recipient and a text body, return success with
//! an optional provider message id, or an error describing the failure.
//! Every HTTP transport carries a request timeout; that timeout is the only
//! bound on a stuck send.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use textcast_core::config::TransportConfig;
use textcast_core::error::{Result, TextcastError};

/// Result of a successful hand-off to the SMS provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmsReceipt {
    /// Provider-assigned message id, when the provider returns one.
    pub provider_id: Option<String>,
}

/// An outbound SMS channel.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Send `body` to `to` (already E.164-normalized).
    async fn send(&self, to: &str, body: &str) -> Result<SmsReceipt>;
}

/// Build the transport named in config.
pub fn from_config(config: &TransportConfig) -> Result<Arc<dyn SmsTransport>> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    match config.kind.as_str() {
        "log" => Ok(Arc::new(LogTransport)),
        "webhook" => {
            if config.endpoint.is_empty() {
                return Err(TextcastError::Config(
                    "transport.endpoint is required for the webhook transport".into(),
                ));
            }
            Ok(Arc::new(WebhookTransport::new(
                &config.endpoint,
                &config.api_key,
                timeout,
            )?))
        }
        "twilio" => {
            if config.account_sid.is_empty() || config.auth_token.is_empty() || config.from_number.is_empty() {
                return Err(TextcastError::Config(
                    "transport.account_sid, auth_token and from_number are required for twilio".into(),
                ));
            }
            Ok(Arc::new(TwilioTransport::new(
                &config.account_sid,
                &config.auth_token,
                &config.from_number,
                timeout,
            )?))
        }
        other => Err(TextcastError::Config(format!("unknown transport kind '{other}'"))),
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TextcastError::Transport(format!("HTTP client build failed: {e}")))
}

/// Dry-run transport: logs instead of sending.
pub struct LogTransport;

#[async_trait]
impl SmsTransport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, to: &str, body: &str) -> Result<SmsReceipt> {
        tracing::info!("📨 [dry-run] SMS to {to}: {body}");
        Ok(SmsReceipt::default())
    }
}

/// Generic JSON webhook: POST `{to, body}` with a bearer key.
pub struct WebhookTransport {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl SmsTransport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, to: &str, body: &str) -> Result<SmsReceipt> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "to": to, "body": body }));
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| TextcastError::Transport(format!("Webhook request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(TextcastError::Transport(format!(
                "Webhook error {status}: {error_text}"
            )));
        }

        // Providers that answer with an empty body are still a success
        let result: serde_json::Value = response.json().await.unwrap_or_default();
        let provider_id = result["id"]
            .as_str()
            .or_else(|| result["messageId"].as_str())
            .map(String::from);

        tracing::debug!("Webhook SMS accepted: {:?} → {}", provider_id, to);
        Ok(SmsReceipt { provider_id })
    }
}

/// Twilio Programmable Messaging.
pub struct TwilioTransport {
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
    client: reqwest::Client,
}

impl TwilioTransport {
    pub fn new(account_sid: &str, auth_token: &str, from_number: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
            from_number: from_number.to_string(),
            base_url: "https://api.twilio.com".into(),
            client: http_client(timeout)?,
        })
    }

    /// Point at a different API host (test servers, regional edges).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SmsTransport for TwilioTransport {
    fn name(&self) -> &str {
        "twilio"
    }

    async fn send(&self, to: &str, body: &str) -> Result<SmsReceipt> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", self.from_number.as_str()), ("Body", body)])
            .send()
            .await
            .map_err(|e| TextcastError::Transport(format!("Twilio request failed: {e}")))?;

        let status = response.status();
        let result: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            let message = result["message"].as_str().unwrap_or("no error message");
            return Err(TextcastError::Transport(format!("Twilio error {status}: {message}")));
        }

        let provider_id = result["sid"].as_str().map(String::from);
        tracing::debug!("Twilio SMS queued: {:?} → {}", provider_id, to);
        Ok(SmsReceipt { provider_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_kinds() {
        let mut cfg = TransportConfig::default();
        assert_eq!(from_config(&cfg).unwrap().name(), "log");

        cfg.kind = "webhook".into();
        assert!(matches!(from_config(&cfg), Err(TextcastError::Config(_))));
        cfg.endpoint = "https://sms.example.com/send".into();
        assert_eq!(from_config(&cfg).unwrap().name(), "webhook");

        cfg.kind = "twilio".into();
        assert!(from_config(&cfg).is_err());
        cfg.account_sid = "AC1".into();
        cfg.auth_token = "secret".into();
        cfg.from_number = "+15550000000".into();
        assert_eq!(from_config(&cfg).unwrap().name(), "twilio");

        cfg.kind = "pigeon".into();
        assert!(from_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_log_transport_always_succeeds() {
        let receipt = LogTransport.send("+15550000001", "hello").await.unwrap();
        assert_eq!(receipt, SmsReceipt::default());
    }
}
