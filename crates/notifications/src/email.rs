//! Email gateway
//!
//! `EmailGateway` is the narrow port the rest of the crate sends mail
//! through. `ResendEmailService` implements it over the Resend HTTP API.
//! The adapter makes exactly one request per call; callers decide whether
//! a failed send is worth repeating.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{NotificationError, NotificationResult};

const DEFAULT_RESEND_BASE_URL: &str = "https://api.resend.com";

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    /// Domain the notification sender address lives on
    pub from_domain: String,
    pub from_name: String,
    pub timeout: Duration,
    /// Base URL of the dashboard, used for links in emails
    pub dashboard_url: String,
    pub base_url: String,
}

impl EmailConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> NotificationResult<Self> {
        let timeout_secs = match std::env::var("EMAIL_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                NotificationError::Config(format!("EMAIL_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            Err(_) => 10,
        };

        Ok(Self {
            api_key: required_env("RESEND_API_KEY")?,
            from_domain: required_env("EMAIL_FROM_DOMAIN")?,
            from_name: std::env::var("EMAIL_FROM_NAME")
                .unwrap_or_else(|_| "ConsultDesk".to_string()),
            timeout: Duration::from_secs(timeout_secs),
            dashboard_url: std::env::var("DASHBOARD_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            base_url: std::env::var("RESEND_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_RESEND_BASE_URL.to_string()),
        })
    }

    /// `Name <notifications@domain>`
    pub fn from_address(&self) -> String {
        format!("{} <notifications@{}>", self.from_name, self.from_domain)
    }
}

fn required_env(name: &str) -> NotificationResult<String> {
    std::env::var(name).map_err(|_| NotificationError::Config(format!("{} must be set", name)))
}

/// A rendered message ready to hand to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Port for sending email
#[async_trait]
pub trait EmailGateway: Send + Sync {
    /// Send one message and return the provider's message id
    async fn send(&self, email: &OutgoingEmail) -> NotificationResult<String>;
}

/// Resend API request body
#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

/// Resend API response
#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

/// Email service using the Resend API
#[derive(Clone)]
pub struct ResendEmailService {
    config: EmailConfig,
    http_client: Client,
}

impl ResendEmailService {
    pub fn new(config: EmailConfig) -> NotificationResult<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NotificationError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn from_env() -> NotificationResult<Self> {
        Self::new(EmailConfig::from_env()?)
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }
}

#[async_trait]
impl EmailGateway for ResendEmailService {
    async fn send(&self, email: &OutgoingEmail) -> NotificationResult<String> {
        let from = self.config.from_address();
        let request = ResendEmailRequest {
            from: &from,
            to: vec![email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
        };

        let response = self
            .http_client
            .post(format!("{}/emails", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // Network errors and timeouts are transient
                tracing::error!(error = %e, timeout = e.is_timeout(), "Failed to send request to Resend API");
                NotificationError::provider(format!("Email request failed: {}", e), true)
            })?;

        let status = response.status();

        if status.is_success() {
            let body: ResendEmailResponse = response.json().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to parse Resend API response");
                NotificationError::provider("Unreadable email provider response", false)
            })?;

            tracing::info!(
                to = %email.to,
                message_id = %body.id,
                "Email sent via Resend"
            );
            return Ok(body.id);
        }

        let body = response.text().await.unwrap_or_default();
        let transient = status.as_u16() == 429 || status.is_server_error();

        if transient {
            tracing::warn!(status = %status, body = %body, "Resend API returned transient error");
        } else {
            tracing::error!(status = %status, body = %body, "Resend API returned non-transient error");
        }

        Err(NotificationError::provider(
            format!("Email provider returned {}: {}", status, body),
            transient,
        ))
    }
}
