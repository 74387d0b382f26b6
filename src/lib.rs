//! postpay - Resumable post-payment onboarding pipelines
//!
//! Turns a completed checkout into a durable pipeline record and drives it
//! through a fixed sequence of outbound steps: community invite, CRM
//! notification, and (when the purchase names one) content unlock.
//!
//! # Architecture
//!
//! The system is built around a durable record per payment:
//! - Every step outcome is persisted before the next step starts
//! - Transient step failures are retried with exponential backoff
//! - Failed pipelines resume from the first step that has not succeeded
//!
//! # Modules
//!
//! - `adapters`: External system integrations (community webhook, CRM)
//! - `core`: Store backends, retry policy, engine and background runner
//! - `domain`: Data structures (PipelineRecord, StepOutcome, CheckoutEvent)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Take in a checkout webhook event
//! postpay intake --event event.json
//!
//! # Check pipeline status
//! postpay status cs_test_123
//!
//! # Retry a failed pipeline
//! postpay retry cs_test_123
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{HttpActions, StepActions};
pub use crate::core::{
    FileStore, PipelineEngine, PipelineRunner, PipelineStore, ProcessOutcome, RetryPolicy,
    SqliteStore, StoreError,
};
pub use domain::{PipelineData, PipelineRecord, PipelineStatus, StepOutcome};
