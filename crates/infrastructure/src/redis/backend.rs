//! Redis 状态后端实现

use std::time::Duration;

use application::{BackendError, ChangeStream, StateBackend, StateChange, StateSnapshot};
use async_trait::async_trait;
use config::RedisConfig;
use futures_util::stream::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::error::{RedisError, RedisResult};

/// KEYS[1] 快照, KEYS[2] 版本
/// ARGV[1] 期望版本, ARGV[2] 新版本, ARGV[3] 快照, ARGV[4] 变更通知（可为空）, ARGV[5] 通知频道
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[2]) or '0')
if current ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3])
redis.call('SET', KEYS[2], ARGV[2])
if ARGV[4] ~= '' then
    redis.call('PUBLISH', ARGV[5], ARGV[4])
end
return 1
"#;

/// 同一前缀下的键与频道名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    pub state: String,
    pub version: String,
    pub changes: String,
}

impl RedisKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            state: format!("{prefix}:state"),
            version: format!("{prefix}:version"),
            changes: format!("{prefix}:changes"),
        }
    }
}

/// 第 `retry_count` 次重连前的等待时间，指数增长并封顶
pub fn reconnect_delay(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(16));
    base.saturating_mul(factor).min(max)
}

pub struct RedisStateBackend {
    client: Client,
    connection: ConnectionManager,
    keys: RedisKeys,
    script: Script,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl RedisStateBackend {
    /// 连接 Redis 并创建后端
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("连接 Redis 失败: {}", e),
            })?;

        info!(prefix = %config.key_prefix, "Redis 状态后端已连接");

        Ok(Self {
            client,
            connection,
            keys: RedisKeys::new(&config.key_prefix),
            script: Script::new(COMPARE_AND_SET_SCRIPT),
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            max_reconnect_interval: Duration::from_millis(config.max_reconnect_interval_ms),
        })
    }

    /// 健康检查
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// 删除共享状态（用于测试和运维清理）
    pub async fn clear(&self) -> RedisResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(&[self.keys.state.as_str(), self.keys.version.as_str()])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StateBackend for RedisStateBackend {
    async fn load(&self) -> Result<Option<StateSnapshot>, BackendError> {
        let mut conn = self.connection.clone();
        let blob: Option<String> = conn
            .get(&self.keys.state)
            .await
            .map_err(RedisError::from)?;

        match blob {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
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
        let payload = change
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_default();

        let mut conn = self.connection.clone();
        let applied: i64 = self
            .script
            .key(&self.keys.state)
            .key(&self.keys.version)
            .arg(expected_version)
            .arg(snapshot.version)
            .arg(blob)
            .arg(payload)
            .arg(&self.keys.changes)
            .invoke_async(&mut conn)
            .await
            .map_err(RedisError::from)?;

        if applied == 0 {
            debug!(expected = expected_version, "Redis 状态版本冲突");
        }
        Ok(applied == 1)
    }

    async fn subscribe(&self) -> Result<ChangeStream, BackendError> {
        // 首次订阅同步完成，调用方随后加载快照时不会错过通知
        let pubsub = open_pubsub(&self.client, &self.keys.changes).await?;
        let (sender, stream) = mpsc::unbounded_channel();

        tokio::spawn(listen_loop(
            self.client.clone(),
            self.keys.changes.clone(),
            pubsub,
            sender,
            self.reconnect_interval,
            self.max_reconnect_interval,
        ));

        info!(channel = %self.keys.changes, "已订阅 Redis 状态变更频道");
        Ok(stream)
    }
}

async fn open_pubsub(client: &Client, channel: &str) -> RedisResult<PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| RedisError::ConnectionError {
            message: format!("获取 PubSub 连接失败: {}", e),
        })?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| RedisError::SubscribeError {
            message: format!("订阅频道 {} 失败: {}", channel, e),
        })?;
    Ok(pubsub)
}

/// 转发变更通知，断线后指数退避重连；接收端关闭时退出
async fn listen_loop(
    client: Client,
    channel: String,
    mut pubsub: PubSub,
    sender: mpsc::UnboundedSender<StateChange>,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
) {
    let mut retry_count: u32 = 0;

    loop {
        if !forward_changes(&mut pubsub, &sender).await {
            break;
        }
        warn!(channel = %channel, "Redis 变更订阅断开，准备重连");

        pubsub = loop {
            let delay = reconnect_delay(reconnect_interval, max_reconnect_interval, retry_count);
            tokio::select! {
                _ = sender.closed() => {
                    info!("Redis 变更监听已停止");
                    return;
                }
                _ = sleep(delay) => {}
            }

            match open_pubsub(&client, &channel).await {
                Ok(pubsub) => break pubsub,
                Err(e) => {
                    retry_count = retry_count.saturating_add(1);
                    error!(retry_count, "Redis 重连失败: {}", e);
                }
            }
        };
        retry_count = 0;
        info!(channel = %channel, "Redis 变更订阅已恢复");

        // 断线期间可能错过通知
        if sender.send(StateChange::resync()).is_err() {
            break;
        }
    }

    info!("Redis 变更监听已停止");
}

/// 返回 `false` 表示接收端已关闭，`true` 表示连接断开
async fn forward_changes(pubsub: &mut PubSub, sender: &mpsc::UnboundedSender<StateChange>) -> bool {
    let mut messages = pubsub.on_message();
    loop {
        tokio::select! {
            _ = sender.closed() => return false,
            message = messages.next() => {
                let Some(message) = message else {
                    return true;
                };
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("获取消息负载失败: {}", e);
                        continue;
                    }
                };
                match serde_json::from_str::<StateChange>(&payload) {
                    Ok(change) => {
                        if sender.send(change).is_err() {
                            return false;
                        }
                    }
                    Err(e) => warn!("忽略无法解析的状态变更: {}", e),
                }
            }
        }
    }
}
