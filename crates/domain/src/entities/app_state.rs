use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Channel, Message, User};
use crate::errors::{DomainError, DomainResult};
use crate::value_objects::SessionId;

/// 应用状态，系统唯一的事实来源
///
/// 每次状态转换都返回一个新值，旧值保持不变。频道以 `Arc` 存放，
/// 未被修改的频道在新旧状态之间共享，转换开销只与被修改的频道相关。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    channels: BTreeMap<String, Arc<Channel>>,
    users: BTreeMap<SessionId, User>,
}

impl AppState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values().map(Arc::as_ref)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn get_channel(&self, name: &str) -> DomainResult<&Channel> {
        self.channels
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| DomainError::channel_not_found(name))
    }

    pub fn get_user(&self, session_id: &SessionId) -> DomainResult<&User> {
        self.users
            .get(session_id)
            .ok_or_else(|| DomainError::user_not_found(session_id.as_str()))
    }

    /// 将用户加入频道，频道不存在时创建
    pub fn add_user(
        &self,
        session_id: &SessionId,
        name: &str,
        channel_name: &str,
    ) -> DomainResult<Self> {
        if self.users.contains_key(session_id) {
            return Err(DomainError::duplicate_session(session_id.as_str()));
        }

        if let Some(channel) = self.channels.get(channel_name) {
            if channel.contains_user(name) {
                return Err(DomainError::duplicate_name(channel_name, name));
            }
        }

        let user = User::new(session_id.clone(), name, channel_name);
        let mut next = self.clone();

        let channel = next
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(channel_name)));
        Arc::make_mut(channel).set_user(user.clone());
        next.users.insert(session_id.clone(), user);

        Ok(next)
    }

    /// 将用户移出所在频道，频道变空时一并删除
    pub fn remove_user(&self, session_id: &SessionId) -> DomainResult<Self> {
        let user = self.get_user(session_id)?;
        let channel_name = user.channel_name.clone();
        let user_name = user.name.clone();

        let mut next = self.clone();
        next.users.remove(session_id);

        let channel = next
            .channels
            .get_mut(&channel_name)
            .ok_or_else(|| DomainError::channel_not_found(&channel_name))?;
        let channel = Arc::make_mut(channel);
        channel.del_user(&user_name)?;

        if channel.is_empty() {
            next.channels.remove(&channel_name);
        }

        Ok(next)
    }

    /// 向频道追加一条消息，其余频道和用户保持不变
    pub fn add_message(&self, channel_name: &str, message: Message) -> DomainResult<Self> {
        if !self.channels.contains_key(channel_name) {
            return Err(DomainError::channel_not_found(channel_name));
        }

        let mut next = self.clone();
        if let Some(channel) = next.channels.get_mut(channel_name) {
            Arc::make_mut(channel).append_message(message);
        }

        Ok(next)
    }

    /// 校验会话是否是频道内该名字的当前持有者
    ///
    /// 同名用户以新会话重新加入后，旧会话不再拥有发言权。
    pub fn authorize_sender(
        &self,
        session_id: &SessionId,
        channel_name: &str,
    ) -> DomainResult<&User> {
        let user = self.get_user(session_id)?;
        if user.channel_name != channel_name {
            return Err(DomainError::access_denied(format!(
                "session {session_id} is not a member of channel {channel_name}"
            )));
        }

        let member = self.get_channel(channel_name)?.get_user(&user.name)?;
        if member.session_id != *session_id {
            return Err(DomainError::access_denied(format!(
                "session {session_id} does not own name {}",
                user.name
            )));
        }

        Ok(user)
    }

    /// 检查用户索引与频道成员一致、频道非空，返回第一个违反项的描述
    pub fn check_invariants(&self) -> Result<(), String> {
        for (session_id, user) in &self.users {
            if user.session_id != *session_id {
                return Err(format!(
                    "user indexed under {session_id} has session {}",
                    user.session_id
                ));
            }
            let channel = self
                .channels
                .get(&user.channel_name)
                .ok_or_else(|| {
                    format!(
                        "user {session_id} points at missing channel {}",
                        user.channel_name
                    )
                })?;
            match channel.get_user(&user.name) {
                Ok(member) if member.session_id == *session_id => {}
                _ => {
                    return Err(format!(
                        "channel {} does not list user {session_id}",
                        user.channel_name
                    ))
                }
            }
        }

        for (name, channel) in &self.channels {
            if channel.name() != name {
                return Err(format!(
                    "channel indexed under {name} is named {}",
                    channel.name()
                ));
            }
            if channel.is_empty() {
                return Err(format!("empty channel {name} was not removed"));
            }
            for member in channel.users() {
                if !self.users.contains_key(&member.session_id) {
                    return Err(format!(
                        "channel {name} lists unknown session {}",
                        member.session_id
                    ));
                }
            }
        }

        Ok(())
    }
}
