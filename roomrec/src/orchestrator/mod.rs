//! Top-level orchestration: feed polling, task lifecycle, reporting.

mod completed_log;
mod service;

pub use completed_log::{CompletedLog, CompletedRecord};
pub use service::Orchestrator;
