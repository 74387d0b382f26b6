//! Engine Integration Tests
//!
//! Tests for step sequencing, skip-on-success, failure handling and
//! resume behavior of the pipeline engine.

mod common;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{engine, file_store, CountingActions};
use postpay::core::{EngineError, PipelineStore, ProcessOutcome, StoreError};
use postpay::domain::{PipelineData, PipelineRecord, PipelineStatus, RecordPatch, StepOutcome};
use serde_json::json;
use tempfile::TempDir;

fn course_data() -> PipelineData {
    PipelineData::new("a@example.com").with_metadata("course_id", "c1")
}

fn messages(record: &PipelineRecord) -> Vec<&str> {
    record.logs.iter().map(|l| l.message.as_str()).collect()
}

#[tokio::test]
async fn test_full_pipeline_finishes() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let actions = Arc::new(CountingActions::succeeding());
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();
    let outcome = engine.process("sess_1").await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Finished);

    let record = store.get("sess_1").await.unwrap().unwrap();
    assert_eq!(record.status, PipelineStatus::Finished);
    assert_eq!(record.attempts, 1);
    for name in ["invite", "crm", "unlock"] {
        assert!(record.is_step_succeeded(name), "{} should be ok", name);
    }
    assert_eq!(
        record.step("unlock").unwrap().result(),
        Some(&json!({"email": "a@example.com", "courseId": "c1"}))
    );

    let logs = messages(&record);
    assert!(logs.len() >= 5);
    assert!(logs.contains(&"Processing pipeline"));
    assert!(logs.contains(&"Step: unlock (c1)"));
    assert_eq!(logs.last(), Some(&"Pipeline finished successfully"));

    assert_eq!(
        (actions.invites(), actions.crm(), actions.unlocks()),
        (1, 1, 1)
    );
}

#[tokio::test]
async fn test_unlock_omitted_without_content_id() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let actions = Arc::new(CountingActions::succeeding());
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store
        .create("sess_2", PipelineData::new("b@example.com"))
        .await
        .unwrap();
    engine.process("sess_2").await.unwrap();

    let record = store.get("sess_2").await.unwrap().unwrap();
    assert_eq!(record.status, PipelineStatus::Finished);
    assert!(record.step("unlock").is_none());
    assert_eq!(actions.unlocks(), 0);
}

#[tokio::test]
async fn test_successful_step_is_not_reexecuted() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let actions = Arc::new(CountingActions::succeeding());
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();
    store
        .update(
            "sess_1",
            RecordPatch::step("invite", StepOutcome::success(1, json!({"invited": true}))),
        )
        .await
        .unwrap();

    engine.process("sess_1").await.unwrap();

    assert_eq!(actions.invites(), 0);
    let record = store.get("sess_1").await.unwrap().unwrap();
    assert!(messages(&record).contains(&"Skipping invite (already succeeded)"));
    // stored outcome is kept as is
    assert_eq!(
        record.step("invite"),
        Some(&StepOutcome::success(1, json!({"invited": true})))
    );
    assert_eq!(record.status, PipelineStatus::Finished);
}

#[tokio::test]
async fn test_required_step_failure_halts_pipeline() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let actions = Arc::new(CountingActions::failing_invite(u32::MAX));
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();
    let outcome = engine.process("sess_1").await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Failed { step: "invite" });
    assert_eq!(actions.invites(), 3);
    assert_eq!(actions.crm(), 0);
    assert_eq!(actions.unlocks(), 0);

    let record = store.get("sess_1").await.unwrap().unwrap();
    assert_eq!(record.status, PipelineStatus::Failed);
    let invite = record.step("invite").unwrap();
    assert!(!invite.is_ok());
    assert_eq!(invite.attempt(), 3);
    assert!(invite.error().unwrap().contains("community unavailable"));
    assert!(record.step("crm").is_none());
    assert_eq!(messages(&record).last(), Some(&"Pipeline failed at invite step"));
}

#[tokio::test]
async fn test_optional_step_failure_does_not_halt() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let actions = Arc::new(CountingActions::failing_crm(u32::MAX));
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();
    let outcome = engine.process("sess_1").await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Finished);
    assert_eq!(actions.crm(), 3);
    assert_eq!(actions.unlocks(), 1);

    let record = store.get("sess_1").await.unwrap().unwrap();
    assert_eq!(record.status, PipelineStatus::Finished);
    assert!(!record.step("crm").unwrap().is_ok());
    assert!(record.is_step_succeeded("unlock"));
}

#[tokio::test]
async fn test_resume_from_failed_skips_invite() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let actions = Arc::new(CountingActions::succeeding());
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();
    for status in [PipelineStatus::InProgress, PipelineStatus::Failed] {
        store
            .update("sess_1", RecordPatch::status(status))
            .await
            .unwrap();
    }
    store
        .update(
            "sess_1",
            RecordPatch::step("invite", StepOutcome::success(2, json!({}))),
        )
        .await
        .unwrap();

    let outcome = engine.process("sess_1").await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Finished);
    assert_eq!(actions.invites(), 0);
    assert_eq!(actions.crm(), 1);
    assert_eq!(actions.unlocks(), 1);
}

#[tokio::test]
async fn test_second_run_recovers_failed_invite() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    // fails the whole first run, then succeeds
    let actions = Arc::new(CountingActions::failing_invite(3));
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();

    assert_eq!(
        engine.process("sess_1").await.unwrap(),
        ProcessOutcome::Failed { step: "invite" }
    );
    assert_eq!(
        engine.process("sess_1").await.unwrap(),
        ProcessOutcome::Finished
    );

    let record = store.get("sess_1").await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(actions.invites(), 4);
    assert_eq!(record.step("invite").unwrap().attempt(), 1);
}

#[tokio::test]
async fn test_recorded_crm_failure_is_final() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    // crm always fails, unlock fails the first run only
    let actions = Arc::new(CountingActions::with_failures(0, u32::MAX, 3));
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();

    assert_eq!(
        engine.process("sess_1").await.unwrap(),
        ProcessOutcome::Failed { step: "unlock" }
    );
    assert_eq!(actions.crm(), 3);

    assert_eq!(
        engine.process("sess_1").await.unwrap(),
        ProcessOutcome::Finished
    );
    assert_eq!(actions.crm(), 3);
    assert_eq!(actions.invites(), 1);

    let record = store.get("sess_1").await.unwrap().unwrap();
    assert!(!record.step("crm").unwrap().is_ok());
    assert!(record.is_step_succeeded("unlock"));
    assert!(messages(&record).contains(&"Skipping crm (outcome already recorded)"));
}

#[tokio::test]
async fn test_finished_is_a_fixed_point() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let actions = Arc::new(CountingActions::succeeding());
    let engine = engine(Arc::clone(&store), Arc::clone(&actions));

    store.create("sess_1", course_data()).await.unwrap();
    engine.process("sess_1").await.unwrap();
    let before = store.get("sess_1").await.unwrap().unwrap();

    for _ in 0..2 {
        assert_eq!(
            engine.process("sess_1").await.unwrap(),
            ProcessOutcome::AlreadyFinished
        );
    }

    let after = store.get("sess_1").await.unwrap().unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.status, before.status);
    assert_eq!(after.attempts, before.attempts);
    assert_eq!(after.steps, before.steps);
    assert_eq!(after.logs.len(), before.logs.len() + 2);
    assert_eq!(messages(&after).last(), Some(&"Pipeline already finished, skip"));
    assert_eq!((actions.invites(), actions.crm(), actions.unlocks()), (1, 1, 1));
}

#[tokio::test]
async fn test_unknown_pipeline_is_not_found() {
    let temp = TempDir::new().unwrap();
    let store = file_store(&temp).await;
    let engine = engine(store, Arc::new(CountingActions::succeeding()));

    assert_eq!(
        engine.process("missing").await.unwrap(),
        ProcessOutcome::NotFound
    );
}

/// Delegates to a real store but can be told to fail every update
struct BrokenUpdates {
    inner: Arc<dyn PipelineStore>,
    broken: AtomicBool,
}

#[async_trait]
impl PipelineStore for BrokenUpdates {
    fn backend(&self) -> &'static str {
        "broken"
    }

    async fn get(&self, id: &str) -> Result<Option<PipelineRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn create(&self, id: &str, data: PipelineData) -> Result<PipelineRecord, StoreError> {
        self.inner.create(id, data).await
    }

    async fn update(
        &self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.inner.update(id, patch).await
    }

    async fn append_log(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        self.inner.append_log(id, message).await
    }

    async fn annotate(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<PipelineRecord>, StoreError> {
        self.inner.annotate(id, message).await
    }

    async fn list(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        self.inner.list().await
    }

    async fn insert_if_absent(&self, record: PipelineRecord) -> Result<bool, StoreError> {
        self.inner.insert_if_absent(record).await
    }
}

#[tokio::test]
async fn test_persistence_failure_propagates() {
    let temp = TempDir::new().unwrap();
    let inner = file_store(&temp).await;
    let store = Arc::new(BrokenUpdates {
        inner: Arc::clone(&inner),
        broken: AtomicBool::new(true),
    });
    let actions = Arc::new(CountingActions::succeeding());
    let engine = engine(store, Arc::clone(&actions));

    inner.create("sess_1", course_data()).await.unwrap();
    let result = engine.process("sess_1").await;

    assert!(matches!(result, Err(EngineError::Store(StoreError::Io(_)))));
    assert_eq!(actions.invites(), 0);

    // last committed state stands
    let record = inner.get("sess_1").await.unwrap().unwrap();
    assert_eq!(record.status, PipelineStatus::Pending);
    assert!(record.steps.is_empty());
}
