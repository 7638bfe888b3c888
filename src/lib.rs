//! Notification batching and delivery processor for a recruitment
//! marketplace: eligibility gating, an in-memory delivery queue, and a
//! retrying dispatcher with a per-day idempotency ledger.

pub mod catalog;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod eligibility;
pub mod model;
pub mod processor;
pub mod queue;
pub mod transport;

pub use dispatcher::{DispatchContext, DrainSummary};
pub use processor::{DrainOutcome, Processor, ProcessorStatus};
