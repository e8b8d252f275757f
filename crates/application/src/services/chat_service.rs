use std::sync::Arc;

use domain::{Action, AppState, Channel, DomainError, SessionId, User, UserMessage};
use uuid::Uuid;

use crate::connections::{ConnectionRegistry, ConnectionSender};
use crate::error::StoreError;
use crate::store::Store;

const MAX_NAME_LEN: usize = 64;
const MAX_CONTENT_LEN: usize = 4096;

/// 传输层使用的聊天用例：校验输入、构造动作、派发
#[derive(Clone)]
pub struct ChatService {
    store: Store,
    registry: Arc<ConnectionRegistry>,
}

impl ChatService {
    pub fn new(store: Store, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// 分配一个新的会话 id；会话在加入频道之前不出现在状态中
    pub fn register_session(&self) -> SessionId {
        let session_id = SessionId::generate();
        tracing::debug!(session_id = %session_id, "已分配会话");
        session_id
    }

    pub async fn join(
        &self,
        session_id: &SessionId,
        name: &str,
        channel_name: &str,
    ) -> Result<User, StoreError> {
        let name = validate_identifier("name", name)?;
        let channel_name = validate_identifier("channel_name", channel_name)?;

        let state = self
            .store
            .dispatch(Action::add_user(session_id.clone(), name, channel_name))
            .await?;
        let user = state.get_user(session_id)?.clone();

        tracing::info!(
            session_id = %session_id,
            name,
            channel = channel_name,
            "用户加入频道"
        );
        Ok(user)
    }

    /// 离开频道；`channel_name` 给定时要求会话确实在该频道
    ///
    /// 频道检查在派发锁内对提交时的状态执行。
    pub async fn leave(
        &self,
        session_id: &SessionId,
        channel_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let action = Action::remove_user(session_id.clone());
        match channel_name {
            Some(channel_name) => {
                self.store
                    .dispatch_guarded(action, |state| {
                        ensure_member_of(state, session_id, channel_name)
                    })
                    .await?
            }
            None => self.store.dispatch(action).await?,
        };
        tracing::info!(session_id = %session_id, "用户离开频道");
        Ok(())
    }

    /// 以会话当前的成员身份向频道发言
    ///
    /// 发言人身份取自调用时的状态，提交前在派发锁内重新确认会话仍持有该身份，
    /// 会话已离开或名字已被他人占用时返回 `AccessDenied`，状态不变。
    pub async fn post_message(
        &self,
        session_id: &SessionId,
        channel_name: &str,
        content: &str,
    ) -> Result<UserMessage, StoreError> {
        let content = validate_content(content)?;

        let state = self.store.get_state().await;
        let sender = state.authorize_sender(session_id, channel_name)?;
        let message = UserMessage {
            sender_name: sender.name.clone(),
            sender_color_id: sender.color_id,
            content: content.to_string(),
        };

        self.store
            .dispatch_guarded(
                Action::add_message(channel_name, message.clone()),
                |state| {
                    let sender = state.authorize_sender(session_id, channel_name)?;
                    if sender.name != message.sender_name {
                        return Err(DomainError::access_denied(format!(
                            "session {session_id} no longer posts as {}",
                            message.sender_name
                        )));
                    }
                    Ok(())
                },
            )
            .await?;
        Ok(message)
    }

    /// 向会话当前所在的频道发言（实时连接上收到的消息走这里）
    pub async fn post_to_current_channel(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<UserMessage, StoreError> {
        let channel_name = self
            .store
            .get_state()
            .await
            .get_user(session_id)?
            .channel_name
            .clone();
        self.post_message(session_id, &channel_name, content).await
    }

    pub async fn channel(&self, channel_name: &str) -> Result<Channel, StoreError> {
        let state = self.store.get_state().await;
        Ok(state.get_channel(channel_name)?.clone())
    }

    pub async fn connect(&self, session_id: &SessionId, sender: ConnectionSender) -> Uuid {
        let connection_id = self.registry.register(session_id.clone(), sender).await;
        tracing::info!(session_id = %session_id, %connection_id, "连接已注册");
        connection_id
    }

    /// 连接断开：注销连接并让会话离开频道
    ///
    /// 会话已被新连接接管时什么都不做；会话从未加入频道时忽略 `UserNotFound`。
    pub async fn disconnect(
        &self,
        session_id: &SessionId,
        connection_id: Uuid,
    ) -> Result<(), StoreError> {
        if !self.registry.unregister(session_id, connection_id).await {
            tracing::debug!(session_id = %session_id, "连接已被新连接替换");
            return Ok(());
        }

        match self
            .store
            .dispatch(Action::remove_user(session_id.clone()))
            .await
        {
            Ok(_) => {
                tracing::info!(session_id = %session_id, "断开连接的会话已离开频道");
                Ok(())
            }
            Err(err) if err.is_user_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn ensure_member_of(
    state: &AppState,
    session_id: &SessionId,
    channel_name: &str,
) -> Result<(), DomainError> {
    let user = state.get_user(session_id)?;
    if user.channel_name != channel_name {
        return Err(DomainError::access_denied(format!(
            "session {session_id} is not a member of channel {channel_name}"
        )));
    }
    Ok(())
}

fn validate_identifier<'a>(field: &str, value: &'a str) -> Result<&'a str, DomainError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DomainError::invalid_argument(field, "must not be empty"));
    }
    if value.chars().count() > MAX_NAME_LEN {
        return Err(DomainError::invalid_argument(
            field,
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(value)
}

fn validate_content(content: &str) -> Result<&str, DomainError> {
    if content.trim().is_empty() {
        return Err(DomainError::invalid_argument("content", "must not be empty"));
    }
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(DomainError::invalid_argument(
            "content",
            format!("must be at most {MAX_CONTENT_LEN} characters"),
        ));
    }
    Ok(content)
}
