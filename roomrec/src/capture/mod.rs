//! Encoder subprocess supervision.

mod supervisor;

pub use supervisor::{CaptureExit, ProcessSupervisor, StartOutcome};
