//! 连接注册表与消息广播
//!
//! 每个会话至多一个实时连接。`Broadcaster` 作为 Store 订阅者，把新追加的频道消息
//! 推送给该频道所有在本进程有连接的成员，尽力而为，单个连接失败不影响其他连接。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{Action, AppState, Message, SessionId};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::store::{Subscriber, SubscriberError};

/// 推送给客户端的频道消息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    pub channel_name: String,
    #[serde(flatten)]
    pub message: Message,
}

pub type ConnectionSender = mpsc::UnboundedSender<ChannelMessage>;

struct Connection {
    id: Uuid,
    sender: ConnectionSender,
}

/// 一次推送的结果统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<SessionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册会话的连接，返回连接 id；同一会话的旧连接被替换
    pub async fn register(&self, session_id: SessionId, sender: ConnectionSender) -> Uuid {
        let id = Uuid::new_v4();
        let previous = self
            .connections
            .write()
            .await
            .insert(session_id.clone(), Connection { id, sender });
        if previous.is_some() {
            tracing::info!(session_id = %session_id, "替换了会话已有的连接");
        }
        id
    }

    /// 注销连接；只有连接 id 仍匹配时才移除，避免旧连接关闭时误删新连接
    pub async fn unregister(&self, session_id: &SessionId, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(session_id) {
            Some(connection) if connection.id == connection_id => {
                connections.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, session_id: &SessionId) -> bool {
        self.connections.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// 向一组会话推送消息，没有连接的会话直接跳过
    pub async fn send_to<'a>(
        &self,
        sessions: impl IntoIterator<Item = &'a SessionId>,
        message: &ChannelMessage,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut closed = Vec::new();

        {
            let connections = self.connections.read().await;
            for session_id in sessions {
                let Some(connection) = connections.get(session_id) else {
                    continue;
                };
                match connection.sender.send(message.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(_) => {
                        tracing::warn!(session_id = %session_id, "推送失败，连接已关闭");
                        report.failed += 1;
                        closed.push((session_id.clone(), connection.id));
                    }
                }
            }
        }

        for (session_id, connection_id) in closed {
            self.unregister(&session_id, connection_id).await;
        }
        report
    }
}

/// 把 AddMessage 派发结果推送到频道成员连接的订阅者
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Subscriber for Broadcaster {
    async fn on_dispatch(
        &self,
        action: &Action,
        state: Arc<AppState>,
    ) -> Result<(), SubscriberError> {
        let Action::AddMessage {
            channel_name,
            message,
        } = action
        else {
            return Ok(());
        };

        // 频道可能在消息之后已被删除
        let Ok(channel) = state.get_channel(channel_name) else {
            tracing::debug!(channel = %channel_name, "频道已不存在，无需广播");
            return Ok(());
        };

        let outbound = ChannelMessage {
            channel_name: channel_name.clone(),
            message: message.clone(),
        };
        let report = self
            .registry
            .send_to(channel.member_sessions(), &outbound)
            .await;
        tracing::debug!(
            channel = %channel_name,
            delivered = report.delivered,
            failed = report.failed,
            "频道消息已广播"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{app_reducer, SystemMessage, UserMessage};
    use serde_json::json;

    fn state_with(members: &[(&str, &str, &str)]) -> Arc<AppState> {
        let mut state = AppState::empty();
        for (session, name, channel) in members {
            state = state
                .add_user(&SessionId::new(*session), name, channel)
                .unwrap();
        }
        Arc::new(state)
    }

    #[tokio::test]
    async fn broadcast_reaches_only_channel_members() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (c_tx, mut c_rx) = mpsc::unbounded_channel();
        registry.register(SessionId::new("A"), a_tx).await;
        registry.register(SessionId::new("B"), b_tx).await;
        registry.register(SessionId::new("C"), c_tx).await;

        let state = state_with(&[("A", "alice", "x"), ("B", "bob", "x"), ("C", "carol", "y")]);
        let action = Action::add_message("x", SystemMessage::new("hello"));
        Broadcaster::new(registry)
            .on_dispatch(&action, state)
            .await
            .unwrap();

        assert_eq!(a_rx.try_recv().unwrap().message.content(), "hello");
        assert_eq!(b_rx.try_recv().unwrap().message.content(), "hello");
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_connection_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        registry.register(SessionId::new("A"), a_tx).await;
        registry.register(SessionId::new("B"), b_tx).await;
        drop(a_rx);

        let state = state_with(&[("A", "alice", "x"), ("B", "bob", "x")]);
        let message = ChannelMessage {
            channel_name: "x".into(),
            message: SystemMessage::new("hi").into(),
        };
        let channel = state.get_channel("x").unwrap();
        let report = registry.send_to(channel.member_sessions(), &message).await;

        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert!(b_rx.try_recv().is_ok());
        assert!(!registry.is_connected(&SessionId::new("A")).await);
    }

    #[tokio::test]
    async fn stale_unregister_keeps_new_connection() {
        let registry = ConnectionRegistry::new();
        let session = SessionId::new("A");
        let (first, _first_rx) = mpsc::unbounded_channel();
        let (second, _second_rx) = mpsc::unbounded_channel();

        let old = registry.register(session.clone(), first).await;
        let new = registry.register(session.clone(), second).await;

        assert!(!registry.unregister(&session, old).await);
        assert!(registry.is_connected(&session).await);
        assert!(registry.unregister(&session, new).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn broadcaster_ignores_other_actions() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(SessionId::new("A"), tx).await;

        let state = state_with(&[("A", "alice", "x")]);
        let action = Action::add_user(SessionId::new("B"), "bob", "x");
        Broadcaster::new(registry)
            .on_dispatch(&action, state)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcaster_follows_store_dispatches() {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = crate::store::Store::new(app_reducer);
        store
            .subscribe(Arc::new(Broadcaster::new(registry.clone())))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(SessionId::new("A"), tx).await;
        store
            .dispatch(Action::add_user(SessionId::new("A"), "alice", "x"))
            .await
            .unwrap();
        store
            .dispatch(Action::add_message(
                "x",
                UserMessage {
                    sender_name: "alice".into(),
                    sender_color_id: 3,
                    content: "hi".into(),
                },
            ))
            .await
            .unwrap();
        store.flush_subscribers().await;

        let pushed = rx.try_recv().unwrap();
        assert_eq!(
            serde_json::to_value(&pushed).unwrap(),
            json!({
                "channel_name": "x",
                "type": "user",
                "sender_name": "alice",
                "sender_color_id": 3,
                "content": "hi"
            })
        );
    }
}
