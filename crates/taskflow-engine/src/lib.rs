//! Facade for the taskflow orchestration engine.
//!
//! Provides:
//! - `Engine` / `EngineBuilder` - Own and wire every component
//! - `EngineConfig` - Layered configuration (defaults, file, environment)
//! - `EngineProvider` - The router's in-process primary provider
//! - `telemetry::init_tracing` - Subscriber setup for binaries

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod telemetry;

pub use config::{
    DEFAULT_CONFIG, EngineConfig, EngineSettings, ExternalToolSettings, MemorySettings,
    SessionSettings, StorageBackend, StorageSettings, WorkflowSettings, load_config,
};
pub use engine::{ENGINE_VERSION, Engine, EngineBuilder, EngineState, EngineStatus};
pub use error::EngineError;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use provider::{EXTERNAL_TOOL_HANDLER, EngineProvider, ExternalToolStep, RoutedTextGeneration};

// Re-exported so embedders need only this crate.
pub use taskflow_core::{Classify, ErrorKind, ErrorReport, FlowEvent, SessionId, WorkflowId};
pub use taskflow_memory::{SearchOptions, SearchQuery, SortBy, SortOrder};
pub use taskflow_router::{ProviderKind, Task, TaskKind, TaskOptions, Urgency};
pub use taskflow_session::{SessionOptions, SessionUpdate};
pub use taskflow_workflow::{Step, StepKind, WorkflowDefinition};
