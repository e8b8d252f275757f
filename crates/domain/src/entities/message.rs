use serde::{Deserialize, Serialize};

use crate::value_objects::ColorId;

/// 频道消息
///
/// 线路格式以 `type` 字段区分：`{"type": "system", ...}` 或 `{"type": "user", ...}`。
/// 消息一旦追加到频道就不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    System(SystemMessage),
    User(UserMessage),
}

impl Message {
    pub fn content(&self) -> &str {
        match self {
            Self::System(message) => &message.content,
            Self::User(message) => &message.content,
        }
    }
}

/// 系统通知（加入/离开频道）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub content: String,
}

impl SystemMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn user_joined(user_name: &str) -> Self {
        Self::new(format!("{user_name} has joined the channel."))
    }

    pub fn user_left(user_name: &str) -> Self {
        Self::new(format!("{user_name} has left the channel."))
    }
}

/// 用户发送的消息，携带发送者名字和颜色的快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub sender_name: String,
    pub sender_color_id: ColorId,
    pub content: String,
}

impl From<SystemMessage> for Message {
    fn from(value: SystemMessage) -> Self {
        Self::System(value)
    }
}

impl From<UserMessage> for Message {
    fn from(value: UserMessage) -> Self {
        Self::User(value)
    }
}
