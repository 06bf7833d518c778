//! Client for the EmailJS REST API, used to send templated transactional email
//! without operating a mail server.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, instrument};

pub const EMAILJS_ENDPOINT: &str = "https://api.emailjs.com/api/v1.0/email/send";
pub const BUSINESS_INBOX: &str = "audentix@gmail.com";

#[derive(Error, Debug)]
pub enum EmailError {
    #[error("EmailJS API Error: {0}")]
    Api(String),

    #[error("Failed to reach EmailJS: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Email settings as loaded from configuration. The four identifiers are optional so
/// the server can start without them; the contact form reports the gap instead.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub owner_template_id: Option<String>,
    #[serde(default)]
    pub customer_template_id: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// EmailJS private key, required when the account enforces strict mode for API calls
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_business_inbox")]
    pub business_inbox: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            service_id: None,
            owner_template_id: None,
            customer_template_id: None,
            public_key: None,
            access_token: None,
            endpoint: default_endpoint(),
            business_inbox: default_business_inbox(),
        }
    }
}

impl EmailSettings {
    /// The complete credential set, or None if any required identifier is unset or blank
    pub fn credentials(&self) -> Option<EmailJsCredentials> {
        fn present(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        }

        Some(EmailJsCredentials {
            service_id: present(&self.service_id)?,
            owner_template_id: present(&self.owner_template_id)?,
            customer_template_id: present(&self.customer_template_id)?,
            public_key: present(&self.public_key)?,
            access_token: present(&self.access_token),
        })
    }
}

fn default_endpoint() -> String {
    EMAILJS_ENDPOINT.to_string()
}

fn default_business_inbox() -> String {
    BUSINESS_INBOX.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailJsCredentials {
    pub service_id: String,
    pub owner_template_id: String,
    pub customer_template_id: String,
    pub public_key: String,
    pub access_token: Option<String>,
}

/// Variables substituted into an EmailJS template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParams {
    pub from_name: String,
    pub from_email: String,
    pub email: String,
    pub reply_to: String,
    pub phone: String,
    pub company: String,
    pub service: String,
    pub message: String,
    pub submission_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to_email: String,
}

impl TemplateParams {
    /// Address the params to `to_email`, with replies going to `reply_to`
    pub fn addressed(&self, to_email: &str, reply_to: &str) -> Self {
        Self {
            to_email: to_email.to_string(),
            reply_to: reply_to.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    service_id: &'a str,
    template_id: &'a str,
    user_id: &'a str,
    template_params: &'a TemplateParams,
    #[serde(rename = "accessToken", skip_serializing_if = "Option::is_none")]
    access_token: Option<&'a str>,
}

pub struct EmailJsClient {
    client: Client,
    endpoint: String,
}

impl EmailJsClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, EmailError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Send one templated email. Any 2xx status counts as delivered.
    #[instrument(skip(self, credentials, params))]
    pub async fn send(
        &self,
        credentials: &EmailJsCredentials,
        template_id: &str,
        params: &TemplateParams,
    ) -> Result<(), EmailError> {
        let payload = SendRequest {
            service_id: &credentials.service_id,
            template_id,
            user_id: &credentials.public_key,
            template_params: params,
            access_token: credentials.access_token.as_deref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            error!(%status, template_id, "EmailJS rejected the request");
            return Err(EmailError::Api(body));
        }

        debug!(%status, template_id, "EmailJS accepted the request");
        Ok(())
    }
}
