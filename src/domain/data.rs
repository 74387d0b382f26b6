//! Input payload carried by a pipeline record.
//!
//! Written once at creation and only read afterwards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata keys that may carry the purchased course/content identifier
pub const CONTENT_ID_KEYS: [&str; 3] = ["course_id", "courseId", "course"];

/// Data captured from the completed payment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineData {
    /// Originating payment session
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Recipient email (invite and unlock target)
    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub name: String,

    /// Amount in the smallest currency unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_total: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,

    /// Arbitrary key/value metadata from the checkout
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PipelineData {
    /// Create a payload with just an email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    /// Add a metadata entry (builder style)
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Course/content identifier, if the checkout carried one.
    ///
    /// Empty strings and nulls count as absent.
    pub fn content_id(&self) -> Option<String> {
        CONTENT_ID_KEYS.iter().find_map(|key| match self.metadata.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }
}

/// Member details sent to the CRM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl From<&PipelineData> for MemberInfo {
    fn from(data: &PipelineData) -> Self {
        Self {
            email: data.email.clone(),
            name: data.name.clone(),
            session_id: data.session_id.clone(),
        }
    }
}
