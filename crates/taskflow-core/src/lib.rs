//! Core abstractions for the taskflow orchestration engine.
//!
//! This crate provides the building blocks shared by every component:
//! - `BlobStorage` - Durable namespaced storage trait
//! - `EventBus` - Broadcast + history for lifecycle events
//! - `PeriodicTask` - Cancellable background timers
//! - Identifiers, status enums and error kinds

pub mod error;
pub mod event;
pub mod event_bus;
pub mod namespace;
pub mod periodic;
pub mod traits;

pub use error::{Classify, ErrorKind, ErrorReport};
pub use event::FlowEvent;
pub use event_bus::EventBus;
pub use namespace::{DEFAULT_NAMESPACE, SESSIONS_NAMESPACE, SYSTEM_NAMESPACE, session_namespace};
pub use periodic::PeriodicTask;
pub use traits::{
    BlobStorage, CheckpointId, SessionId, SessionStatus, StorageError, WorkflowId, WorkflowStatus,
};
