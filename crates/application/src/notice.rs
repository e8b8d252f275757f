//! 系统通知中间件：用户加入/离开频道后向该频道追加一条系统消息

use async_trait::async_trait;
use domain::{Action, SystemMessage};

use crate::error::StoreError;
use crate::middleware::{Commit, Middleware, Next};
use crate::store::Store;

pub struct SystemNoticeMiddleware;

impl SystemNoticeMiddleware {
    /// 根据派发结果生成通知：(频道, 消息)
    fn notice_for(action: &Action, commit: &Commit) -> Option<(String, SystemMessage)> {
        match action {
            Action::AddUser {
                name, channel_name, ..
            } => Some((channel_name.clone(), SystemMessage::user_joined(name))),
            Action::RemoveUser { session_id } => {
                // 离开的用户只存在于派发前的状态中
                let user = commit.previous.get_user(session_id).ok()?;
                Some((user.channel_name.clone(), SystemMessage::user_left(&user.name)))
            }
            Action::AddMessage { .. } => None,
        }
    }
}

#[async_trait]
impl Middleware for SystemNoticeMiddleware {
    async fn handle(
        &self,
        store: &Store,
        action: Action,
        next: Next<'_>,
    ) -> Result<Commit, StoreError> {
        let notice = match &action {
            Action::AddMessage { .. } => None,
            _ => Some(action.clone()),
        };
        let commit = next.run(action).await?;

        let Some(action) = notice else {
            return Ok(commit);
        };
        if commit.is_unchanged() {
            return Ok(commit);
        }
        let Some((channel_name, message)) = Self::notice_for(&action, &commit) else {
            return Ok(commit);
        };

        // 不能在持有派发锁时同步派发，交给后台任务排队执行
        let dispatcher = store.clone();
        store.tasks().spawn("system_notice", async move {
            if !dispatcher.get_state().await.has_channel(&channel_name) {
                tracing::debug!(channel = %channel_name, "频道已不存在，跳过系统通知");
                return Ok(());
            }
            match dispatcher
                .dispatch(Action::add_message(channel_name.clone(), message))
                .await
            {
                Ok(_) => Ok(()),
                // 最后一个用户离开后频道已被删除
                Err(err) if err.is_channel_not_found() => {
                    tracing::debug!(channel = %channel_name, "频道已不存在，跳过系统通知");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        });

        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{app_reducer, Message, SessionId};

    fn notice_store() -> Store {
        Store::builder(app_reducer)
            .middleware(SystemNoticeMiddleware)
            .build()
    }

    fn contents(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.content().to_string()).collect()
    }

    #[tokio::test]
    async fn join_and_leave_append_system_messages() {
        let store = notice_store();
        store
            .dispatch(Action::add_user(SessionId::new("A"), "bob", "x"))
            .await
            .unwrap();
        store
            .dispatch(Action::add_user(SessionId::new("B"), "carol", "x"))
            .await
            .unwrap();
        store
            .dispatch(Action::remove_user(SessionId::new("B")))
            .await
            .unwrap();
        store.tasks().settle().await;

        let state = store.get_state().await;
        let channel = state.get_channel("x").unwrap();
        assert_eq!(
            contents(channel.messages()),
            [
                "bob has joined the channel.",
                "carol has joined the channel.",
                "carol has left the channel."
            ]
        );
        assert!(channel
            .messages()
            .iter()
            .all(|m| matches!(m, Message::System(_))));
    }

    #[tokio::test]
    async fn last_user_leaving_drops_notice_silently() {
        let store = notice_store();
        store
            .dispatch(Action::add_user(SessionId::new("A"), "bob", "x"))
            .await
            .unwrap();
        store
            .dispatch(Action::remove_user(SessionId::new("A")))
            .await
            .unwrap();
        store.tasks().settle().await;

        let state = store.get_state().await;
        assert!(!state.has_channel("x"));
        assert!(state.users().next().is_none());
    }

    #[tokio::test]
    async fn rejected_join_produces_no_notice() {
        let store = notice_store();
        store
            .dispatch(Action::add_user(SessionId::new("A"), "bob", "x"))
            .await
            .unwrap();
        store
            .dispatch(Action::add_user(SessionId::new("B"), "bob", "x"))
            .await
            .unwrap_err();
        store.tasks().settle().await;

        let state = store.get_state().await;
        assert_eq!(state.get_channel("x").unwrap().messages().len(), 1);
    }
}
