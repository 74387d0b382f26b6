//! Pipeline engine.
//!
//! Drives one record through the fixed step sequence
//! `invite -> crm -> unlock` and persists every outcome before moving on.
//! Calling [`PipelineEngine::process`] again on an unfinished record resumes
//! it: steps that already succeeded are skipped, never re-invoked.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::adapters::StepActions;
use crate::domain::{MemberInfo, PipelineData, PipelineRecord, PipelineStatus, RecordPatch, StepOutcome};

use super::retry::RetryPolicy;
use super::store::{PipelineStore, StoreError};

/// Errors that stop a `process` call before it reaches a verdict
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The record disappeared between two store calls
    #[error("Pipeline record vanished during processing: {0}")]
    RecordVanished(String),
}

/// One step of the onboarding sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStep {
    /// Invite the buyer to the community
    Invite,
    /// Tell the CRM about the new paid member
    Crm,
    /// Unlock the purchased content
    Unlock { content_id: String },
}

impl PipelineStep {
    /// Key under which the outcome is stored in `steps`
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStep::Invite => "invite",
            PipelineStep::Crm => "crm",
            PipelineStep::Unlock { .. } => "unlock",
        }
    }

    /// A failed required step fails the whole pipeline
    pub fn is_required(&self) -> bool {
        !matches!(self, PipelineStep::Crm)
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStep::Unlock { content_id } => write!(f, "unlock ({})", content_id),
            other => f.write_str(other.name()),
        }
    }
}

/// Ordered steps for a payload. Unlock only appears when a content id is present.
pub fn plan(data: &PipelineData) -> Vec<PipelineStep> {
    let mut steps = vec![PipelineStep::Invite, PipelineStep::Crm];
    if let Some(content_id) = data.content_id() {
        steps.push(PipelineStep::Unlock { content_id });
    }
    steps
}

/// How a `process` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No record with that id
    NotFound,
    /// Record was already finished; nothing ran
    AlreadyFinished,
    /// Every required step succeeded
    Finished,
    /// A required step exhausted its attempts
    Failed { step: &'static str },
}

/// Runs pipelines against a store and a set of step actions
pub struct PipelineEngine {
    store: Arc<dyn PipelineStore>,
    actions: Arc<dyn StepActions>,
    retry: RetryPolicy,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        actions: Arc<dyn StepActions>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            actions,
            retry,
        }
    }

    /// Store the engine persists into
    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Process a pipeline from its first non-successful step.
    ///
    /// Store failures propagate; the last committed state stays as it was.
    #[instrument(skip(self), fields(pipeline_id = %id))]
    pub async fn process(&self, id: &str) -> Result<ProcessOutcome, EngineError> {
        let Some(record) = self.store.get(id).await? else {
            warn!("Pipeline not found");
            return Ok(ProcessOutcome::NotFound);
        };

        if record.status == PipelineStatus::Finished {
            info!("Pipeline already finished, skipping");
            self.store
                .annotate(id, "Pipeline already finished, skip")
                .await?;
            return Ok(ProcessOutcome::AlreadyFinished);
        }

        let record = self
            .update(
                id,
                RecordPatch::status(PipelineStatus::InProgress)
                    .with_attempts(record.attempts.saturating_add(1)),
            )
            .await?;
        info!(attempt = record.attempts, "Processing pipeline");
        self.log(id, "Processing pipeline").await?;

        for step in plan(&record.data) {
            self.log(id, &format!("Step: {}", step)).await?;

            let outcome = self.run_step(id, &step).await?;

            if !outcome.is_ok() {
                if step.is_required() {
                    self.update(id, RecordPatch::status(PipelineStatus::Failed))
                        .await?;
                    let message = format!("Pipeline failed at {} step", step.name());
                    warn!(step = step.name(), "{}", message);
                    self.log(id, &message).await?;
                    return Ok(ProcessOutcome::Failed { step: step.name() });
                }
                warn!(step = step.name(), "Optional step failed, continuing");
            }
        }

        self.update(id, RecordPatch::status(PipelineStatus::Finished))
            .await?;
        info!("Pipeline finished successfully");
        self.log(id, "Pipeline finished successfully").await?;

        Ok(ProcessOutcome::Finished)
    }

    /// Run or skip a single step, returning the outcome that now stands for it
    async fn run_step(&self, id: &str, step: &PipelineStep) -> Result<StepOutcome, EngineError> {
        let record = self.fetch(id).await?;
        let name = step.name();

        if let Some(previous) = record.step(name) {
            if previous.is_ok() {
                self.log(id, &format!("Skipping {} (already succeeded)", name))
                    .await?;
                return Ok(previous.clone());
            }
            if !step.is_required() {
                self.log(id, &format!("Skipping {} (outcome already recorded)", name))
                    .await?;
                return Ok(previous.clone());
            }
        }

        let outcome = self.execute(step, &record).await;

        self.update(id, RecordPatch::step(name, outcome.clone()))
            .await?;
        self.log(id, &format!("{} result: {}", name, outcome.to_log_json()))
            .await?;

        Ok(outcome)
    }

    async fn execute(&self, step: &PipelineStep, record: &PipelineRecord) -> StepOutcome {
        let actions = &self.actions;
        let data = &record.data;

        match step {
            PipelineStep::Invite => {
                self.retry
                    .execute(step.name(), || actions.invite_member(&data.email))
                    .await
            }
            PipelineStep::Crm => {
                let member = MemberInfo::from(data);
                self.retry
                    .execute(step.name(), || actions.notify_crm(&member))
                    .await
            }
            PipelineStep::Unlock { content_id } => {
                self.retry
                    .execute(step.name(), || {
                        actions.unlock_content(&data.email, content_id)
                    })
                    .await
            }
        }
    }

    async fn fetch(&self, id: &str) -> Result<PipelineRecord, EngineError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::RecordVanished(id.to_string()))
    }

    async fn update(&self, id: &str, patch: RecordPatch) -> Result<PipelineRecord, EngineError> {
        self.store
            .update(id, patch)
            .await?
            .ok_or_else(|| EngineError::RecordVanished(id.to_string()))
    }

    async fn log(&self, id: &str, message: &str) -> Result<(), EngineError> {
        self.store
            .append_log(id, message)
            .await?
            .map(|_| ())
            .ok_or_else(|| EngineError::RecordVanished(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_without_content_id() {
        let steps = plan(&PipelineData::new("a@example.com"));
        assert_eq!(steps, vec![PipelineStep::Invite, PipelineStep::Crm]);
    }

    #[test]
    fn test_plan_with_content_id() {
        let data = PipelineData::new("a@example.com").with_metadata("courseId", json!(42));
        let steps = plan(&data);

        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps[2],
            PipelineStep::Unlock {
                content_id: "42".to_string()
            }
        );
        assert_eq!(steps[2].to_string(), "unlock (42)");
    }

    #[test]
    fn test_required_steps() {
        assert!(PipelineStep::Invite.is_required());
        assert!(!PipelineStep::Crm.is_required());
        assert!(PipelineStep::Unlock {
            content_id: "c1".to_string()
        }
        .is_required());
    }
}
