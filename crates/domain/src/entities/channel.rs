use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Message, User};
use crate::errors::{DomainError, DomainResult};
use crate::value_objects::SessionId;

/// 聊天频道
///
/// 成员按名字索引；消息按追加顺序排列，是频道内的全序。
/// 修改方法只对 crate 内可见，外部只能通过 `AppState` 的状态转换得到新值。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    name: String,
    #[serde(default)]
    users: BTreeMap<String, User>,
    #[serde(default)]
    messages: Vec<Message>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: BTreeMap::new(),
            messages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains_user(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    pub fn get_user(&self, name: &str) -> DomainResult<&User> {
        self.users
            .get(name)
            .ok_or_else(|| DomainError::user_not_found(name))
    }

    /// 当前成员的会话列表
    pub fn member_sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.users.values().map(|user| &user.session_id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub(crate) fn set_user(&mut self, user: User) {
        self.users.insert(user.name.clone(), user);
    }

    pub(crate) fn del_user(&mut self, name: &str) -> DomainResult<User> {
        self.users
            .remove(name)
            .ok_or_else(|| DomainError::user_not_found(name))
    }

    pub(crate) fn append_message(&mut self, message: Message) {
        self.messages.push(message);
    }
}
