use serde::{Deserialize, Serialize};

use crate::value_objects::{color_id_for, ColorId, SessionId};

/// 频道内的用户
///
/// 同时被所属频道（按名字）和 `AppState`（按会话）索引。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub session_id: SessionId,
    pub name: String,
    pub channel_name: String,
    pub color_id: ColorId,
}

impl User {
    pub fn new(
        session_id: SessionId,
        name: impl Into<String>,
        channel_name: impl Into<String>,
    ) -> Self {
        let color_id = color_id_for(&session_id);
        Self {
            session_id,
            name: name.into(),
            channel_name: channel_name.into(),
            color_id,
        }
    }
}
