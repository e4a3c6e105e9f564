//! Capture scheduling engine for live-streaming room recording.
//!
//! roomrec tracks a set of rooms, predicts when each goes live, and
//! captures the broadcast to disk through an external encoder process.
//! The crate is the scheduling core: callers supply the room directory,
//! the poll feeds, the live-status probe, and the stream resolver (see
//! [`sources`]), and drive an [`orchestrator::Orchestrator`].

pub mod capture;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod sources;
pub mod watcher;

pub use error::{Error, Result};
