//! Adapter interfaces for external systems.
//!
//! The engine talks to the outside world only through [`StepActions`].
//! [`HttpActions`] is the production implementation: a community webhook
//! for invites and unlocks, and a CRM webhook for member notifications.

pub mod community;
pub mod crm;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::IntegrationSettings;
use crate::domain::MemberInfo;

pub use community::CommunityClient;
pub use crm::CrmClient;

/// Outbound operations the pipeline steps perform.
///
/// Each returns a JSON payload recorded as the step result; an error makes
/// the retry wrapper try again.
#[async_trait]
pub trait StepActions: Send + Sync {
    /// Invite a buyer to the community
    async fn invite_member(&self, email: &str) -> Result<Value>;

    /// Notify the CRM about a paid member
    async fn notify_crm(&self, member: &MemberInfo) -> Result<Value>;

    /// Unlock purchased content for a buyer
    async fn unlock_content(&self, email: &str, content_id: &str) -> Result<Value>;
}

/// Payload for an integration that is not configured
pub fn skipped(reason: &str) -> Value {
    json!({ "skipped": true, "reason": reason })
}

/// Turn a response into `{status, body}`, failing on any non-2xx status
pub(crate) async fn response_payload(label: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    if !status.is_success() {
        anyhow::bail!("{} error ({}): {}", label, status, text);
    }

    // Keep structured bodies structured
    let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
    Ok(json!({ "status": status.as_u16(), "body": body }))
}

/// HTTP-backed step actions
pub struct HttpActions {
    community: Option<CommunityClient>,
    crm: Option<CrmClient>,
}

impl HttpActions {
    pub fn new(community: Option<CommunityClient>, crm: Option<CrmClient>) -> Self {
        Self { community, crm }
    }

    /// Build clients for whichever integrations are configured
    pub fn from_settings(settings: &IntegrationSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.request_timeout_seconds);

        let community = settings
            .community_webhook_url
            .as_deref()
            .map(|url| CommunityClient::new(url, timeout))
            .transpose()?;
        let crm = settings
            .crm_endpoint
            .as_deref()
            .map(|endpoint| CrmClient::new(endpoint, settings.crm_api_key.clone(), timeout))
            .transpose()?;

        Ok(Self::new(community, crm))
    }
}

#[async_trait]
impl StepActions for HttpActions {
    async fn invite_member(&self, email: &str) -> Result<Value> {
        match &self.community {
            Some(client) => client.invite(email).await,
            None => {
                debug!("Community webhook not configured, skipping invite");
                Ok(skipped("community webhook not configured"))
            }
        }
    }

    async fn notify_crm(&self, member: &MemberInfo) -> Result<Value> {
        match &self.crm {
            Some(client) => client.notify(member).await,
            None => {
                debug!("CRM endpoint not configured, skipping notification");
                Ok(skipped("crm endpoint not configured"))
            }
        }
    }

    async fn unlock_content(&self, email: &str, content_id: &str) -> Result<Value> {
        match &self.community {
            Some(client) => client.unlock(email, content_id).await,
            None => {
                debug!("Community webhook not configured, skipping unlock");
                Ok(skipped("community webhook not configured"))
            }
        }
    }
}
