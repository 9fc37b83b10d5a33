//! Provider routing for taskflow tasks.
//!
//! Provides:
//! - `ProviderRouter` - Selection rules, fallback chain and call stats
//! - `Provider` - Trait implemented by each link of the chain
//! - `ExternalToolProvider` - Runs instructions through an external CLI
//! - `StaticProvider` - Canned responses, never fails

pub mod command;
pub mod error;
pub mod external;
pub mod provider;
pub mod router;
pub mod static_provider;
pub mod task;

pub use command::{CommandBuildError, CommandBuilder, CommandParts, resolve_executable_path};
pub use error::{ProviderError, RouterError};
pub use external::{ExternalToolConfig, ExternalToolProvider};
pub use provider::Provider;
pub use router::{ProviderRouter, RouterConfig, RouterStats, RouterStatus};
pub use static_provider::StaticProvider;
pub use task::{ProviderKind, ProviderResponse, Task, TaskKind, TaskOptions, Urgency};
