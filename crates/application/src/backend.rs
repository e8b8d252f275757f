//! 共享状态存储抽象
//!
//! 多个进程通过同一个后端同步 `AppState`：后端需要提供对序列化状态的原子
//! 比较并写入，以及把"状态已变更"通知推送给所有已绑定进程的发布订阅通道。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{Action, AppState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// 带版本号的状态快照，版本号单调递增，`0` 表示后端中还没有状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub state: Arc<AppState>,
}

/// 状态变更通知
///
/// `action` 为 `None` 时表示需要重新同步（后端初始化或订阅重连），接收方只需重新加载快照。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub origin: Uuid,
    pub version: u64,
    pub action: Option<Action>,
}

impl StateChange {
    pub fn resync() -> Self {
        Self {
            origin: Uuid::nil(),
            version: 0,
            action: None,
        }
    }
}

/// 状态变更通知流，接收端被丢弃时后端停止推送
pub type ChangeStream = mpsc::UnboundedReceiver<StateChange>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend connection failed: {0}")]
    Connection(String),
    #[error("backend subscription failed: {0}")]
    Subscribe(String),
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// 读取当前快照
    async fn load(&self) -> Result<Option<StateSnapshot>, BackendError>;

    /// 仅当后端版本等于 `expected_version` 时写入快照，并在同一原子操作中发布 `change`
    ///
    /// 返回 `false` 表示版本冲突，调用方需要重新加载后重试。
    async fn compare_and_set(
        &self,
        expected_version: u64,
        snapshot: &StateSnapshot,
        change: Option<&StateChange>,
    ) -> Result<bool, BackendError>;

    /// 订阅状态变更通知
    async fn subscribe(&self) -> Result<ChangeStream, BackendError>;
}

/// 内存实现的共享后端（用于测试，以及同一进程内多个 Store 共享状态）
pub mod memory {
    use super::*;
    use tokio::sync::{broadcast, Mutex};
    use tracing::debug;

    pub struct MemoryStateBackend {
        /// (版本, 序列化后的快照)
        slot: Mutex<(u64, Option<String>)>,
        changes: broadcast::Sender<String>,
    }

    impl Default for MemoryStateBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryStateBackend {
        pub fn new() -> Self {
            let (changes, _) = broadcast::channel(1024);
            Self {
                slot: Mutex::new((0, None)),
                changes,
            }
        }

        pub async fn version(&self) -> u64 {
            self.slot.lock().await.0
        }
    }

    #[async_trait]
    impl StateBackend for MemoryStateBackend {
        async fn load(&self) -> Result<Option<StateSnapshot>, BackendError> {
            let slot = self.slot.lock().await;
            match &slot.1 {
                Some(blob) => Ok(Some(serde_json::from_str(blob)?)),
                None => Ok(None),
            }
        }

        async fn compare_and_set(
            &self,
            expected_version: u64,
            snapshot: &StateSnapshot,
            change: Option<&StateChange>,
        ) -> Result<bool, BackendError> {
            let blob = serde_json::to_string(snapshot)?;
            let payload = change.map(serde_json::to_string).transpose()?;

            let mut slot = self.slot.lock().await;
            if slot.0 != expected_version {
                debug!(
                    expected = expected_version,
                    actual = slot.0,
                    "内存后端版本不匹配"
                );
                return Ok(false);
            }
            *slot = (snapshot.version, Some(blob));

            if let Some(payload) = payload {
                // 没有订阅者时发送失败是正常情况
                let _ = self.changes.send(payload);
            }
            Ok(true)
        }

        async fn subscribe(&self) -> Result<ChangeStream, BackendError> {
            let mut receiver = self.changes.subscribe();
            let (sender, stream) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => {
                            let change = match serde_json::from_str::<StateChange>(&payload) {
                                Ok(change) => change,
                                Err(err) => {
                                    tracing::warn!(error = %err, "丢弃无法解析的状态变更");
                                    continue;
                                }
                            };
                            if sender.send(change).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "内存后端订阅者落后，重新同步");
                            if sender.send(StateChange::resync()).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            Ok(stream)
        }
    }

}
