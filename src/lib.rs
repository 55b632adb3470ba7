pub mod condition;
pub mod config;
pub mod controller;
pub mod converter;
pub mod error;
pub mod logger;
pub mod migration;
pub mod network;
pub mod platform;
pub mod preflight;
pub mod reconciler;
pub mod source;
pub mod source_controller;
pub mod sources;
pub mod vm;

pub use error::{ErrorList, ImportError};

pub type Result<T> = std::result::Result<T, ImportError>;

// Convenience re-exports for embedders
pub use config::ImportConfig;
pub use migration::{MigrationRequest, Phase};
pub use platform::{MemoryPlatform, PlatformClient};
pub use reconciler::{Action, Context};
pub use sources::{AdapterResolver, ExportContext, SourceResolver, VirtualMachineOperations};
