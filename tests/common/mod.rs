//! Shared test doubles for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use postpay::adapters::StepActions;
use postpay::core::{FileStore, PipelineEngine, PipelineStore, RetryPolicy};
use postpay::domain::MemberInfo;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Counts calls per operation; each operation fails its first `n` calls
#[derive(Default)]
pub struct CountingActions {
    pub invite_calls: AtomicU32,
    pub crm_calls: AtomicU32,
    pub unlock_calls: AtomicU32,
    invite_failures: u32,
    crm_failures: u32,
    unlock_failures: u32,
}

impl CountingActions {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn with_failures(invite: u32, crm: u32, unlock: u32) -> Self {
        Self {
            invite_failures: invite,
            crm_failures: crm,
            unlock_failures: unlock,
            ..Default::default()
        }
    }

    pub fn failing_invite(times: u32) -> Self {
        Self {
            invite_failures: times,
            ..Default::default()
        }
    }

    pub fn failing_crm(times: u32) -> Self {
        Self {
            crm_failures: times,
            ..Default::default()
        }
    }

    pub fn failing_unlock(times: u32) -> Self {
        Self {
            unlock_failures: times,
            ..Default::default()
        }
    }

    pub fn invites(&self) -> u32 {
        self.invite_calls.load(Ordering::SeqCst)
    }

    pub fn crm(&self) -> u32 {
        self.crm_calls.load(Ordering::SeqCst)
    }

    pub fn unlocks(&self) -> u32 {
        self.unlock_calls.load(Ordering::SeqCst)
    }
}

fn bump(counter: &AtomicU32, failures: u32, label: &str, payload: Value) -> anyhow::Result<Value> {
    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= failures {
        anyhow::bail!("{} unavailable (call {})", label, n);
    }
    Ok(payload)
}

#[async_trait]
impl StepActions for CountingActions {
    async fn invite_member(&self, email: &str) -> anyhow::Result<Value> {
        bump(&self.invite_calls, self.invite_failures, "community", json!({"invited": email}))
    }

    async fn notify_crm(&self, member: &MemberInfo) -> anyhow::Result<Value> {
        bump(&self.crm_calls, self.crm_failures, "crm", json!({"member": member.email}))
    }

    async fn unlock_content(&self, email: &str, content_id: &str) -> anyhow::Result<Value> {
        bump(
            &self.unlock_calls,
            self.unlock_failures,
            "unlock",
            json!({"email": email, "courseId": content_id}),
        )
    }
}

/// Fast retries so failing steps do not slow the suite down
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, 1)
}

pub async fn file_store(temp: &TempDir) -> Arc<dyn PipelineStore> {
    Arc::new(
        FileStore::open(temp.path().join("pipelines.json"))
            .await
            .unwrap(),
    )
}

pub fn engine(
    store: Arc<dyn PipelineStore>,
    actions: Arc<CountingActions>,
) -> PipelineEngine {
    PipelineEngine::new(store, actions, fast_retry())
}
