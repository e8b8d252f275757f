use std::sync::Arc;

use application::{ChannelMessage, ChatService};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::SessionId;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ApiError;

/// 客户端通过连接发送的消息
#[derive(Debug, Deserialize)]
struct ClientFrame {
    content: String,
}

/// 发送给客户端的错误通知
#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'a str,
    message: &'a str,
}

/// WebSocket 连接
///
/// 连接建立时在注册表中登记会话，之后：
/// - 把会话所在频道的新消息以 JSON 文本帧推送给客户端
/// - 把客户端发来的 `{"content": "..."}` 作为发言投递到会话当前频道
/// - 断开时注销连接，并让会话离开频道
pub struct WebSocketConnection {
    socket: WebSocket,
    service: Arc<ChatService>,
    session_id: SessionId,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, service: Arc<ChatService>, session_id: SessionId) -> Self {
        Self {
            socket,
            service,
            session_id,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            service,
            session_id,
        } = self;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ChannelMessage>();
        let connection_id = service.connect(&session_id, outbound_tx).await;
        tracing::info!(session_id = %session_id, "WebSocket 连接已建立");

        let (mut sender, mut incoming) = socket.split();

        // 创建 mpsc channel 来解耦对 sender 的访问
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => cmd.into_frame(),
                    outbound = outbound_rx.recv() => match outbound {
                        Some(message) => match serde_json::to_string(&message) {
                            Ok(json) => WsMessage::Text(json.into()),
                            Err(err) => {
                                tracing::warn!(error = %err, "序列化推送消息失败");
                                continue;
                            }
                        },
                        // 注册表中的连接被替换或移除
                        None => break,
                    },
                };
                if sender.send(frame).await.is_err() {
                    tracing::warn!("发送 WebSocket 帧失败");
                    break;
                }
            }
            tracing::info!("WebSocket发送任务结束");
        });

        // 接收任务：处理来自WebSocket客户端的消息
        let mut recv_task = {
            let service = service.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = incoming.next().await {
                    if Self::handle_incoming(message, &cmd_tx, &service, &session_id)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                tracing::info!("WebSocket接收任务结束");
            })
        };

        // 等待任意一个任务完成（连接断开）
        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        if let Err(err) = service.disconnect(&session_id, connection_id).await {
            tracing::error!(
                error = %err,
                session_id = %session_id,
                "断开连接后清理会话失败"
            );
        }
        tracing::info!(session_id = %session_id, "WebSocket连接已断开");
    }

    /// 处理来自客户端的消息，返回 `Err` 表示应结束连接
    async fn handle_incoming(
        message: WsMessage,
        cmd_tx: &mpsc::Sender<WsCommand>,
        service: &ChatService,
        session_id: &SessionId,
    ) -> Result<(), ()> {
        match message {
            WsMessage::Close(_) => {
                tracing::info!("WebSocket收到关闭消息");
                return Err(());
            }
            WsMessage::Ping(data) => {
                tracing::debug!("收到ping消息，发送pong回应");
                if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                    return Err(());
                }
            }
            WsMessage::Pong(_) => {
                tracing::debug!("收到pong消息");
            }
            WsMessage::Text(text) => {
                let result = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => service
                        .post_to_current_channel(session_id, &frame.content)
                        .await
                        .map(|_| ())
                        .map_err(ApiError::from),
                    Err(err) => Err(ApiError::bad_request(format!("invalid frame: {err}"))),
                };
                if let Err(err) = result {
                    let body = err.body();
                    let frame = ErrorFrame {
                        kind: "error",
                        code: body.code,
                        message: &body.message,
                    };
                    if let Ok(json) = serde_json::to_string(&frame) {
                        if cmd_tx.send(WsCommand::SendText(json)).await.is_err() {
                            return Err(());
                        }
                    }
                }
            }
            WsMessage::Binary(_) => {
                tracing::debug!("忽略二进制消息");
            }
        }
        Ok(())
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}

impl WsCommand {
    fn into_frame(self) -> WsMessage {
        match self {
            WsCommand::SendText(text) => WsMessage::Text(text.into()),
            WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
        }
    }
}
