use thiserror::Error;

use crate::config::LoadError;
use crate::infra::error::InfraError;

/// Failure that ends a binary command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
}
