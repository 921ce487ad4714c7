// Service Errors
// Crate-wide error type wrapping the errors of each module

use crate::config::ConfigError;
use crate::db::StoreError;
use crate::engine::{EngineError, UnknownEngineError};
use crate::exec::ExecError;
use crate::plan::PlanError;
use crate::resource::ResourceError;

use thiserror::Error;

/// Any error the build service can produce
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}

impl From<UnknownEngineError> for ServiceError {
    fn from(err: UnknownEngineError) -> Self {
        ServiceError::Engine(err.into())
    }
}

/// Result type for build service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
