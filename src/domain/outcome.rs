//! Step outcomes produced by the retry wrapper.
//!
//! On disk an outcome keeps the `{ok, attempt, result | error}` envelope so
//! existing store files stay readable. In memory it is a tagged enum, which
//! makes "ok without a result" or "failed with a result" unrepresentable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Final result of running one step through the retry wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "OutcomeEnvelope", into = "OutcomeEnvelope")]
pub enum StepOutcome {
    /// The operation succeeded on attempt `attempt`
    Success { attempt: u32, result: Value },

    /// Every attempt failed; `error` describes the last failure
    Failure { attempt: u32, error: String },
}

impl StepOutcome {
    pub fn success(attempt: u32, result: Value) -> Self {
        Self::Success { attempt, result }
    }

    pub fn failure(attempt: u32, error: impl Into<String>) -> Self {
        Self::Failure {
            attempt,
            error: error.into(),
        }
    }

    /// True only when the operation ultimately succeeded
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Number of attempts actually made
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Success { attempt, .. } | Self::Failure { attempt, .. } => *attempt,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success { result, .. } => Some(result),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    /// Compact JSON form used in record log lines
    pub fn to_log_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Persisted shape of a [`StepOutcome`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutcomeEnvelope {
    ok: bool,

    #[serde(default)]
    attempt: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl From<OutcomeEnvelope> for StepOutcome {
    fn from(envelope: OutcomeEnvelope) -> Self {
        if envelope.ok {
            return Self::Success {
                attempt: envelope.attempt,
                result: envelope.result.unwrap_or(Value::Null),
            };
        }

        // Older files sometimes stored structured errors
        let error = match envelope.error {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        };

        Self::Failure {
            attempt: envelope.attempt,
            error,
        }
    }
}

impl From<StepOutcome> for OutcomeEnvelope {
    fn from(outcome: StepOutcome) -> Self {
        match outcome {
            StepOutcome::Success { attempt, result } => Self {
                ok: true,
                attempt,
                result: Some(result),
                error: None,
            },
            StepOutcome::Failure { attempt, error } => Self {
                ok: false,
                attempt,
                result: None,
                error: Some(Value::String(error)),
            },
        }
    }
}
