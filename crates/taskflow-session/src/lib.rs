//! Session lifecycle and checkpointing for taskflow.
//!
//! Provides:
//! - `SessionManager` - Create, end and checkpoint sessions
//! - `Session` / `Checkpoint` records persisted through the memory store

pub mod error;
pub mod manager;
pub mod types;

pub use error::SessionError;
pub use manager::{AUTO_CHECKPOINT, FINAL_CHECKPOINT, SessionConfig, SessionManager};
pub use types::{
    CapturedState, Checkpoint, Session, SessionOptions, SessionStats, SessionUpdate,
    WorkflowSummary,
};
