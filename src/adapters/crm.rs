//! CRM webhook client for paid-member notifications.
//!
//! Endpoint: POST <crm_endpoint>
//! Auth: Bearer token (optional)

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::domain::MemberInfo;

use super::response_payload;

/// CRM webhook client
pub struct CrmClient {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

/// Payload for a paid member notification
#[derive(Debug, Serialize)]
pub struct CrmEvent<'a> {
    pub event: &'static str,
    pub member: &'a MemberInfo,
}

impl CrmClient {
    /// Create a new client with a per-request timeout
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build CRM HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
            client,
        })
    }

    /// Report a new paid member
    pub async fn notify(&self, member: &MemberInfo) -> Result<Value> {
        let mut request = self.client.post(&self.endpoint).json(&CrmEvent {
            event: "paid_member",
            member,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("Failed to send CRM notification")?;
        response_payload("CRM", response).await
    }
}
