//! 领域模型错误定义
//!
//! 所有领域操作都是纯函数，失败时返回具体的错误类型，由调用方（Store）原样向上传播。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 会话已存在，或同一频道内用户名冲突
    #[error("duplicate user: {reason}")]
    DuplicateUser { reason: DuplicateReason },

    /// 会话没有对应的用户
    #[error("user not found: {key}")]
    UserNotFound { key: String },

    /// 频道不存在（从未创建，或最后一个用户离开后已被删除）
    #[error("channel not found: {channel_name}")]
    ChannelNotFound { channel_name: String },

    /// 会话与频道成员身份不匹配
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// 参数校验失败
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },
}

/// 重复用户的具体原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateReason {
    Session(String),
    Name { channel_name: String, name: String },
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(session_id) => write!(f, "session {session_id} already joined"),
            Self::Name { channel_name, name } => {
                write!(f, "name {name} already taken in channel {channel_name}")
            }
        }
    }
}

impl DomainError {
    pub fn duplicate_session(session_id: impl Into<String>) -> Self {
        Self::DuplicateUser {
            reason: DuplicateReason::Session(session_id.into()),
        }
    }

    pub fn duplicate_name(channel_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self::DuplicateUser {
            reason: DuplicateReason::Name {
                channel_name: channel_name.into(),
                name: name.into(),
            },
        }
    }

    pub fn user_not_found(key: impl Into<String>) -> Self {
        Self::UserNotFound { key: key.into() }
    }

    pub fn channel_not_found(channel_name: impl Into<String>) -> Self {
        Self::ChannelNotFound {
            channel_name: channel_name.into(),
        }
    }

    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::AccessDenied {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn is_channel_not_found(&self) -> bool {
        matches!(self, Self::ChannelNotFound { .. })
    }

    pub fn is_user_not_found(&self) -> bool {
        matches!(self, Self::UserNotFound { .. })
    }
}

/// 从线路格式解码 Action 时的错误
///
/// `UnknownAction` 表示调用方与 reducer 的动作集合不一致，属于不可恢复的编程错误。
#[derive(Error, Debug)]
pub enum ActionDecodeError {
    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("malformed action payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ActionDecodeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownAction(_))
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
