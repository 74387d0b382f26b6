//! Core pipeline logic.
//!
//! This module contains:
//! - PipelineStore: Durable record store (file and SQLite backends)
//! - RetryPolicy: Exponential backoff wrapper
//! - PipelineEngine: Resumable step execution
//! - PipelineRunner: Supervised background processing

pub mod engine;
pub mod file_store;
pub mod retry;
pub mod runner;
pub mod sqlite_store;
pub mod store;

// Re-export commonly used types
pub use engine::{plan, EngineError, PipelineEngine, PipelineStep, ProcessOutcome};
pub use file_store::FileStore;
pub use retry::RetryPolicy;
pub use runner::{Intake, PipelineRunner, RetryDecision};
pub use sqlite_store::SqliteStore;
pub use store::{migrate, open_store, MigrationReport, PipelineStore, StoreError};
