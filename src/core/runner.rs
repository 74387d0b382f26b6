//! Supervised background processing.
//!
//! The webhook path and the manual retry path both end here: the record is
//! made durable first, then `process` runs on a tokio task. A task that fails
//! with an engine error leaves an `Async processing error` line on the record
//! instead of vanishing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::domain::{CheckoutEvent, PipelineStatus};

use super::engine::PipelineEngine;
use super::store::StoreError;

/// What intake did with an incoming event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    /// Event was not something we onboard from
    Ignored(String),
    /// Record exists; `spawned` is false when processing was already running
    Accepted { id: String, spawned: bool },
}

/// Answer to a manual retry request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NotFound,
    AlreadyFinished,
    AlreadyRunning,
    Started,
}

/// Releases the id from the in-flight set when the task ends, even on panic
struct InFlightGuard {
    id: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Spawns and tracks pipeline processing tasks
pub struct PipelineRunner {
    engine: Arc<PipelineEngine>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl PipelineRunner {
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self {
            engine,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Turn a completed checkout into a durable record and start processing it
    pub async fn intake(&self, event: &CheckoutEvent) -> Result<Intake, StoreError> {
        let session = match event.completed_session() {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!(event_type = %event.event_type, "Ignoring event");
                return Ok(Intake::Ignored(format!(
                    "unhandled event type {}",
                    event.event_type
                )));
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Malformed checkout event");
                return Ok(Intake::Ignored(format!("{:#}", e)));
            }
        };

        let Some(data) = session.to_pipeline_data() else {
            warn!(session_id = %session.id, "Checkout session has no email");
            return Ok(Intake::Ignored(format!(
                "session {} has no customer email",
                session.id
            )));
        };

        let store = self.engine.store();
        store.create(&session.id, data).await?;
        store
            .append_log(
                &session.id,
                &format!("Pipeline created for session {}", session.id),
            )
            .await?;
        info!(pipeline_id = %session.id, "Pipeline created");

        let spawned = self.spawn(&session.id);
        Ok(Intake::Accepted {
            id: session.id,
            spawned,
        })
    }

    /// Start processing `id` in the background. Returns false if it is already running.
    pub fn spawn(&self, id: &str) -> bool {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        if !inserted {
            debug!(pipeline_id = %id, "Processing already in flight");
            return false;
        }

        let guard = InFlightGuard {
            id: id.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        };
        let engine = Arc::clone(&self.engine);
        let id = id.to_string();

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                let _guard = guard;
                if let Err(e) = engine.process(&id).await {
                    error!(pipeline_id = %id, error = %e, "Async processing error");
                    let message = format!("Async processing error: {}", e);
                    if let Err(log_err) = engine.store().append_log(&id, &message).await {
                        error!(pipeline_id = %id, error = %log_err, "Failed to record processing error");
                    }
                }
            });

        true
    }

    /// Operator-triggered retry; finished pipelines are rejected
    pub async fn retry(&self, id: &str) -> Result<RetryDecision, StoreError> {
        let store = self.engine.store();
        let Some(record) = store.get(id).await? else {
            return Ok(RetryDecision::NotFound);
        };

        if record.status == PipelineStatus::Finished {
            return Ok(RetryDecision::AlreadyFinished);
        }
        if self.is_running(id) {
            return Ok(RetryDecision::AlreadyRunning);
        }

        store.append_log(id, "Manual retry requested").await?;
        info!(pipeline_id = %id, "Manual retry requested");

        if self.spawn(id) {
            Ok(RetryDecision::Started)
        } else {
            Ok(RetryDecision::AlreadyRunning)
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Wait until every spawned task has completed
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(
                &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if tasks.is_empty() {
                return;
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Processing task did not complete");
                }
            }
        }
    }
}
