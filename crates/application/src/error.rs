use domain::{ActionDecodeError, DomainError};
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("commit conflict persisted after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error("store is already bound to a backend")]
    AlreadyBound,
    #[error("store is not bound to a backend")]
    NotBound,
    /// 调用方与 reducer 的动作集合不一致，不可恢复
    #[error("fatal dispatch error: {0}")]
    Fatal(ActionDecodeError),
    #[error("invalid action payload: {0}")]
    InvalidAction(ActionDecodeError),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_channel_not_found(&self) -> bool {
        self.domain().is_some_and(DomainError::is_channel_not_found)
    }

    pub fn is_user_not_found(&self) -> bool {
        self.domain().is_some_and(DomainError::is_user_not_found)
    }
}

impl From<ActionDecodeError> for StoreError {
    fn from(value: ActionDecodeError) -> Self {
        if value.is_fatal() {
            Self::Fatal(value)
        } else {
            Self::InvalidAction(value)
        }
    }
}
