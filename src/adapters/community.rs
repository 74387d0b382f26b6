//! Community platform webhook client.
//!
//! Endpoint: POST <community_webhook_url>
//! Invites carry the email both as a query parameter and in the JSON body;
//! unlocks post `{email, courseId, action: "unlock_course"}`.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::response_payload;

/// Community webhook client
pub struct CommunityClient {
    webhook_url: String,
    client: reqwest::Client,
}

/// Body of an unlock request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockPayload<'a> {
    pub email: &'a str,
    pub course_id: &'a str,
    pub action: &'static str,
}

impl CommunityClient {
    /// Create a new client with a per-request timeout
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build community HTTP client")?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            client,
        })
    }

    /// Invite URL: the webhook with `?email=` appended
    pub fn invite_url(&self, email: &str) -> Result<Url> {
        Url::parse_with_params(&self.webhook_url, &[("email", email)])
            .with_context(|| format!("Invalid community webhook URL: {}", self.webhook_url))
    }

    /// Invite a member to the community
    pub async fn invite(&self, email: &str) -> Result<Value> {
        let url = self.invite_url(email)?;
        debug!(url = %url, "Sending community invite");

        let response = self
            .client
            .post(url.clone())
            .json(&json!({ "email": email }))
            .send()
            .await
            .context("Failed to send community invite")?;

        let mut payload = response_payload("Community invite", response).await?;
        payload["invited"] = Value::Bool(true);
        payload["url_used"] = Value::String(url.to_string());
        Ok(payload)
    }

    /// Unlock purchased content for a member
    pub async fn unlock(&self, email: &str, content_id: &str) -> Result<Value> {
        let payload = UnlockPayload {
            email,
            course_id: content_id,
            action: "unlock_course",
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send content unlock")?;

        response_payload("Content unlock", response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> CommunityClient {
        CommunityClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_invite_url_encodes_email() {
        let url = client("https://community.example.com/hooks/invite")
            .invite_url("a+b@example.com")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://community.example.com/hooks/invite?email=a%2Bb%40example.com"
        );
    }

    #[test]
    fn test_invite_url_keeps_existing_query() {
        let url = client("https://community.example.com/hook?token=abc")
            .invite_url("a@example.com")
            .unwrap();
        assert_eq!(url.query(), Some("token=abc&email=a%40example.com"));
    }

    #[test]
    fn test_invalid_url_is_an_error() {
        assert!(client("not a url").invite_url("a@example.com").is_err());
    }

    #[test]
    fn test_unlock_payload_shape() {
        let payload = UnlockPayload {
            email: "a@example.com",
            course_id: "c1",
            action: "unlock_course",
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"email": "a@example.com", "courseId": "c1", "action": "unlock_course"})
        );
    }
}
