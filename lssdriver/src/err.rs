use crate::kernels::KernelError;
use config::ConfigError;
use lsscache::CacheError;
use tokio::task::JoinError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Join error: {0}")]
    JoinError(#[from] JoinError),

    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Shutdown: {0}")]
    Shutdown(String),

    #[error("{0}")]
    Custom(String),
}

impl DriverError {
    pub fn new(msg: impl Into<String>) -> Self {
        DriverError::Custom(msg.into())
    }
}
