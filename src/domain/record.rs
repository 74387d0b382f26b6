//! Pipeline records and the patch operation applied to them.
//!
//! A record is the durable state of one post-payment workflow. Stores hand
//! records out by value; every mutation goes through [`PipelineRecord::apply_patch`],
//! [`PipelineRecord::push_log`] or [`PipelineRecord::push_note`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::data::PipelineData;
use super::outcome::StepOutcome;

/// Lifecycle state of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, not yet processed
    Pending,

    /// Processing has started (or was interrupted mid-run)
    InProgress,

    /// A required step exhausted its attempts; retriable
    Failed,

    /// All required steps succeeded; never reprocessed
    Finished,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
            Self::Finished => "finished",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Re-asserting the current state is allowed so an interrupted run can be
    /// resumed from `in_progress`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelineStatus::*;

        self == next
            || matches!(
                (self, next),
                (Pending, InProgress)
                    | (InProgress, Failed)
                    | (InProgress, Finished)
                    | (Failed, InProgress)
            )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "failed" => Ok(Self::Failed),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown pipeline status '{}'", other)),
        }
    }
}

/// Rejected status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: PipelineStatus,
    pub to: PipelineStatus,
}

/// One entry of a record's append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(alias = "ts")]
    pub timestamp: DateTime<Utc>,

    #[serde(alias = "entry")]
    pub message: String,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Durable record of one pipeline, keyed by an external id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRecord {
    /// External identifier (payment session id)
    pub id: String,

    pub created_at: DateTime<Utc>,

    /// Refreshed by every mutation except notes
    pub updated_at: DateTime<Utc>,

    pub status: PipelineStatus,

    /// Number of processing runs that entered `in_progress`
    #[serde(default)]
    pub attempts: u32,

    /// Input payload, write-once
    #[serde(default)]
    pub data: PipelineData,

    /// Insertion-ordered log
    #[serde(default)]
    pub logs: Vec<LogEntry>,

    /// Last recorded outcome per step name
    #[serde(default)]
    pub steps: BTreeMap<String, StepOutcome>,
}

impl PipelineRecord {
    /// Create a fresh `pending` record
    pub fn new(id: impl Into<String>, data: PipelineData) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            status: PipelineStatus::Pending,
            attempts: 0,
            data,
            logs: Vec::new(),
            steps: BTreeMap::new(),
        }
    }

    /// Recorded outcome for a step
    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.get(name)
    }

    /// Whether a step has a recorded success
    pub fn is_step_succeeded(&self, name: &str) -> bool {
        self.step(name).map(StepOutcome::is_ok).unwrap_or(false)
    }

    /// Apply a patch: validate first, then mutate and bump `updated_at`.
    ///
    /// Steps merge key-wise. A recorded success is never replaced by a failure.
    pub fn apply_patch(&mut self, patch: RecordPatch) -> Result<(), InvalidTransition> {
        if let Some(next) = patch.status {
            if !self.status.can_transition_to(next) {
                return Err(InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }

        if let Some(attempts) = patch.attempts {
            self.attempts = attempts;
        }

        for (name, outcome) in patch.steps {
            if !outcome.is_ok() && self.is_step_succeeded(&name) {
                continue;
            }
            self.steps.insert(name, outcome);
        }

        self.touch();
        Ok(())
    }

    /// Append a log entry and bump `updated_at`
    pub fn push_log(&mut self, message: impl Into<String>) {
        self.logs.push(LogEntry::now(message));
        self.touch();
    }

    /// Append a log entry without touching `updated_at`
    pub fn push_note(&mut self, message: impl Into<String>) {
        self.logs.push(LogEntry::now(message));
    }

    fn touch(&mut self) {
        // never move backwards, even if the wall clock does
        self.updated_at = Utc::now().max(self.updated_at);
    }
}

/// Partial update applied by [`PipelineRecord::apply_patch`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub status: Option<PipelineStatus>,
    pub attempts: Option<u32>,
    pub steps: BTreeMap<String, StepOutcome>,
}

impl RecordPatch {
    pub fn status(status: PipelineStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn step(name: impl Into<String>, outcome: StepOutcome) -> Self {
        let mut patch = Self::default();
        patch.steps.insert(name.into(), outcome);
        patch
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> PipelineRecord {
        PipelineRecord::new("sess_1", PipelineData::new("a@example.com"))
    }

    #[test]
    fn test_new_record_defaults() {
        let record = record();

        assert_eq!(record.status, PipelineStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.logs.is_empty());
        assert!(record.steps.is_empty());
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_status_transitions() {
        use PipelineStatus::*;

        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Finished));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(InProgress));

        assert!(!Finished.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Finished));
        assert!(!Failed.can_transition_to(Finished));
    }

    #[test]
    fn test_invalid_transition_leaves_record_untouched() {
        let mut record = record();
        let before = record.clone();

        let patch = RecordPatch::status(PipelineStatus::Finished)
            .with_attempts(5);
        let err = record.apply_patch(patch).unwrap_err();

        assert_eq!(err.from, PipelineStatus::Pending);
        assert_eq!(record, before);
    }

    #[test]
    fn test_steps_merge_keywise() {
        let mut record = record();
        record
            .apply_patch(RecordPatch::step("invite", StepOutcome::success(1, json!({}))))
            .unwrap();
        record
            .apply_patch(RecordPatch::step("crm", StepOutcome::failure(3, "boom")))
            .unwrap();

        assert!(record.is_step_succeeded("invite"));
        assert!(!record.is_step_succeeded("crm"));
        assert_eq!(record.steps.len(), 2);
    }

    #[test]
    fn test_success_is_never_downgraded() {
        let mut record = record();
        record
            .apply_patch(RecordPatch::step("invite", StepOutcome::success(2, json!("ok"))))
            .unwrap();
        record
            .apply_patch(RecordPatch::step("invite", StepOutcome::failure(3, "late failure")))
            .unwrap();

        assert_eq!(
            record.step("invite"),
            Some(&StepOutcome::success(2, json!("ok")))
        );
    }

    #[test]
    fn test_note_keeps_updated_at() {
        let mut record = record();
        record.push_log("first");
        let stamp = record.updated_at;

        record.push_note("note");

        assert_eq!(record.updated_at, stamp);
        assert_eq!(record.logs.len(), 2);
        assert_eq!(record.logs[1].message, "note");
    }

    #[test]
    fn test_reads_legacy_document_fields() {
        let record: PipelineRecord = serde_json::from_value(json!({
            "id": "cs_1",
            "createdAt": "2025-01-01T10:00:00.000Z",
            "updatedAt": "2025-01-01T10:00:05.000Z",
            "status": "in_progress",
            "attempts": 0,
            "data": {"email": "a@example.com", "metadata": {}},
            "logs": [{"ts": "2025-01-01T10:00:01.000Z", "entry": "Processing pipeline"}],
            "steps": {"invite": {"ok": true, "attempt": 1, "result": {"status": 200}}}
        }))
        .unwrap();

        assert_eq!(record.status, PipelineStatus::InProgress);
        assert_eq!(record.logs[0].message, "Processing pipeline");
        assert!(record.is_step_succeeded("invite"));
    }
}
