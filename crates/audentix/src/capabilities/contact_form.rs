use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::Capability;
use crate::emailjs::{EmailError, EmailJsClient, EmailSettings, TemplateParams};
use crate::errors::{AgentError, AgentResult};

pub const NOT_PROVIDED: &str = "Not provided";
pub const DEFAULT_SERVICE: &str = "General Inquiry (Via AI Agent)";
pub const CONFIGURATION_MISSING: &str = "Email configuration missing.";
pub const SUBMITTED: &str = "Form successfully submitted to the Audentix team!";

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_'+\-.]*[A-Za-z0-9_+\-]@([A-Za-z0-9][A-Za-z0-9\-]*\.)+[A-Za-z]{2,}$")
            .unwrap();
}

fn is_valid_email(email: &str) -> bool {
    !email.starts_with('.') && !email.contains("..") && EMAIL_RE.is_match(email)
}

/// Arguments of a contact form submission as produced by the model
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContactSubmission {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    pub message: String,
}

impl ContactSubmission {
    pub fn from_arguments(arguments: Value) -> AgentResult<Self> {
        let submission: ContactSubmission = serde_json::from_value(arguments)
            .map_err(|e| AgentError::InvalidParameters(e.to_string()))?;
        submission.validate()?;
        Ok(submission)
    }

    fn validate(&self) -> AgentResult<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::InvalidParameters("'name' must not be empty".into()));
        }
        if !is_valid_email(&self.email) {
            return Err(AgentError::InvalidParameters(format!(
                "'{}' is not a valid email address",
                self.email
            )));
        }
        if self.message.trim().is_empty() {
            return Err(AgentError::InvalidParameters("'message' must not be empty".into()));
        }
        Ok(())
    }

    fn phone(&self) -> Option<&str> {
        non_blank(&self.phone)
    }

    fn subject(&self) -> Option<&str> {
        non_blank(&self.subject)
    }

    /// Template parameters shared by the owner notification and the customer thank-you
    pub fn template_params(&self, submitted_at: DateTime<Utc>) -> TemplateParams {
        let email = self.email.clone();
        TemplateParams {
            from_name: self.name.trim().to_string(),
            from_email: email.clone(),
            email: email.clone(),
            reply_to: email,
            phone: self.phone().unwrap_or(NOT_PROVIDED).to_string(),
            company: self.subject().unwrap_or(NOT_PROVIDED).to_string(),
            service: self.subject().unwrap_or(DEFAULT_SERVICE).to_string(),
            message: self.message.clone(),
            submission_time: submission_time(submitted_at),
            to_email: String::new(),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Full date with a short time, e.g. "Monday, October 19, 2026 at 3:45 PM"
pub fn submission_time(at: DateTime<Utc>) -> String {
    at.format("%A, %B %-d, %Y at %-I:%M %p").to_string()
}

/// The structured result fed back to the model after a submission attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmissionOutcome {
    pub fn submitted() -> Self {
        Self {
            success: true,
            message: Some(SUBMITTED.to_string()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Sends a lead from the chat to the sales inbox, and a thank-you to the prospect.
///
/// Each invocation sends both emails again; repeated submissions are not deduplicated.
pub struct ContactFormCapability {
    settings: EmailSettings,
    client: EmailJsClient,
    input_schema: Value,
}

impl ContactFormCapability {
    pub const NAME: &'static str = "submit_contact_form";

    pub fn new(settings: EmailSettings) -> Result<Self, EmailError> {
        let client = EmailJsClient::new(settings.endpoint.clone())?;
        let input_schema = json!({
            "type": "object",
            "required": ["name", "email", "message"],
            "properties": {
                "name": {
                    "type": "string",
                    "description": "The full name of the visitor."
                },
                "email": {
                    "type": "string",
                    "description": "The email address of the visitor."
                },
                "phone": {
                    "type": "string",
                    "description": "The phone number of the visitor, including country code if provided."
                },
                "subject": {
                    "type": "string",
                    "description": "A short subject line summarizing the inquiry."
                },
                "message": {
                    "type": "string",
                    "description": "The detailed message or project description from the visitor."
                }
            }
        });

        Ok(Self {
            settings,
            client,
            input_schema,
        })
    }

    pub async fn submit(
        &self,
        submission: &ContactSubmission,
        submitted_at: DateTime<Utc>,
    ) -> SubmissionOutcome {
        let Some(credentials) = self.settings.credentials() else {
            warn!("EmailJS credentials are not configured, contact form not sent");
            return SubmissionOutcome::failed(CONFIGURATION_MISSING);
        };

        let params = submission.template_params(submitted_at);
        let inbox = self.settings.business_inbox.as_str();
        let prospect = params.email.clone();

        // The customer thank-you only goes out once the owner has been notified.
        let sent = async {
            self.client
                .send(
                    &credentials,
                    &credentials.owner_template_id,
                    &params.addressed(inbox, &prospect),
                )
                .await?;
            self.client
                .send(
                    &credentials,
                    &credentials.customer_template_id,
                    &params.addressed(&prospect, inbox),
                )
                .await
        }
        .await;

        match sent {
            Ok(()) => {
                info!("Contact form submitted");
                SubmissionOutcome::submitted()
            }
            Err(e) => {
                error!("Contact form submission failed: {}", e);
                SubmissionOutcome::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl Capability for ContactFormCapability {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Submits the user's contact information and project inquiry to the Audentix sales team."
    }

    fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    async fn execute(&self, arguments: Value) -> AgentResult<Value> {
        let submission = ContactSubmission::from_arguments(arguments)?;
        info!(capability = Self::NAME, "Tool called");

        let outcome = self.submit(&submission, Utc::now()).await;
        serde_json::to_value(outcome).map_err(|e| AgentError::Internal(e.to_string()))
    }
}
