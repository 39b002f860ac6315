use domain::{DomainError, RepositoryError};
use thiserror::Error;

use crate::push::PushError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0:?}")]
    Repository(RepositoryError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("push error: {0}")]
    Push(#[from] PushError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String), // 基础设施接线阶段的错误
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: String) -> Self {
        ApplicationError::Infrastructure(message)
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
