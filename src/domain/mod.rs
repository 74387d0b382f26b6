//! Domain types for the postpay pipeline.
//!
//! This module contains the core data structures:
//! - PipelineRecord: Durable per-payment workflow state
//! - StepOutcome: Result envelope of one step
//! - PipelineData: Input captured from the payment
//! - CheckoutEvent: Incoming webhook payloads

pub mod checkout;
pub mod data;
pub mod outcome;
pub mod record;

// Re-export commonly used types
pub use checkout::{CheckoutEvent, CheckoutSession, CHECKOUT_COMPLETED};
pub use data::{MemberInfo, PipelineData};
pub use outcome::StepOutcome;
pub use record::{InvalidTransition, LogEntry, PipelineRecord, PipelineStatus, RecordPatch};
