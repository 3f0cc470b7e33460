use crate::config::ConfigError;
use crate::orchestration::RegistryError;
use crate::storage::StoreError;

/// Startup and wiring failures of the long-running service.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unknown workflow `{0}`")]
    UnknownWorkflow(String),
    #[error("startup task failed: {0}")]
    Startup(String),
}
