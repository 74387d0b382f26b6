//! Payment webhook payloads.
//!
//! Only `checkout.session.completed` events start a pipeline. Signature
//! verification happens before an event reaches this module.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::data::PipelineData;

/// Event type that triggers onboarding
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// A webhook event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutEvent {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub event_type: String,

    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    /// Raw object; only parsed once the event type is known
    pub object: Value,
}

/// The checkout session object of a completed payment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSession {
    pub id: String,

    #[serde(default)]
    pub customer_email: Option<String>,

    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,

    #[serde(default)]
    pub amount_total: Option<i64>,

    #[serde(default)]
    pub currency: Option<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

impl CheckoutEvent {
    /// Parse an event from its JSON body
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body).context("Failed to parse webhook event JSON")
    }

    /// The completed session, or `None` for any other event type
    pub fn completed_session(&self) -> Result<Option<CheckoutSession>> {
        if self.event_type != CHECKOUT_COMPLETED {
            return Ok(None);
        }

        let session = serde_json::from_value(self.data.object.clone())
            .context("Malformed checkout session object")?;
        Ok(Some(session))
    }
}

impl CheckoutSession {
    /// Recipient email: explicit metadata first, then what the customer typed
    pub fn email(&self) -> Option<&str> {
        let from_metadata = self.metadata.get("user_email").and_then(Value::as_str);
        let from_details = self
            .customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref());

        [from_metadata, from_details, self.customer_email.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|email| !email.is_empty())
    }

    /// Build the pipeline input; `None` when there is no email to onboard
    pub fn to_pipeline_data(&self) -> Option<PipelineData> {
        let email = self.email()?;
        let name = self
            .customer_details
            .as_ref()
            .and_then(|d| d.name.clone())
            .unwrap_or_default();

        Some(PipelineData {
            session_id: Some(self.id.clone()),
            email: email.to_string(),
            name,
            amount_total: self.amount_total,
            currency: self.currency.clone(),
            metadata: self.metadata.clone(),
        })
    }
}
