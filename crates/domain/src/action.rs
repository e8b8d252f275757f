//! 状态变更意图
//!
//! `Action` 是修改 `AppState` 的唯一合法途径。集合是封闭的，新增动作时编译器会指出
//! 所有需要处理的匹配分支。

use serde::{Deserialize, Serialize};

use crate::entities::Message;
use crate::errors::ActionDecodeError;
use crate::value_objects::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AddUser {
        session_id: SessionId,
        name: String,
        channel_name: String,
    },
    RemoveUser {
        session_id: SessionId,
    },
    AddMessage {
        channel_name: String,
        message: Message,
    },
}

impl Action {
    const KINDS: [&'static str; 3] = ["add_user", "remove_user", "add_message"];

    pub fn add_user(
        session_id: SessionId,
        name: impl Into<String>,
        channel_name: impl Into<String>,
    ) -> Self {
        Self::AddUser {
            session_id,
            name: name.into(),
            channel_name: channel_name.into(),
        }
    }

    pub fn remove_user(session_id: SessionId) -> Self {
        Self::RemoveUser { session_id }
    }

    pub fn add_message(channel_name: impl Into<String>, message: impl Into<Message>) -> Self {
        Self::AddMessage {
            channel_name: channel_name.into(),
            message: message.into(),
        }
    }

    /// 线路格式中的 `type` 标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddUser { .. } => "add_user",
            Self::RemoveUser { .. } => "remove_user",
            Self::AddMessage { .. } => "add_message",
        }
    }

    /// 解码线路格式的动作
    ///
    /// 未知的 `type` 标签返回 `UnknownAction`，与字段缺失等格式错误区分开。
    pub fn from_json(payload: &str) -> Result<Self, ActionDecodeError> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        if !Self::KINDS.contains(&kind) {
            return Err(ActionDecodeError::UnknownAction(kind.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
