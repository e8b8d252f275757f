mod support;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};

use support::build_app;

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server(router: axum::Router) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    (addr, shutdown_tx)
}

async fn new_session(client: &Client, base: &str) -> String {
    let body: Value = client
        .post(format!("{base}/api/v1/session"))
        .send()
        .await
        .expect("register session")
        .json()
        .await
        .expect("session json");
    body["session_id"].as_str().unwrap().to_string()
}

async fn join(client: &Client, base: &str, session: &str, channel: &str, name: &str) {
    let response = client
        .post(format!("{base}/api/v1/channels/{channel}/users/{name}"))
        .header("x-session-id", session)
        .send()
        .await
        .expect("join");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
}

/// 读取下一个文本帧，跳过其他帧
async fn next_json(ws: &mut ClientSocket) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("ws frame timed out")
            .expect("ws closed")
            .expect("ws error");
        if let TungsteniteMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("ws json");
        }
    }
}

/// 等待直到收到指定内容的消息
async fn expect_content(ws: &mut ClientSocket, content: &str) -> Value {
    loop {
        let value = next_json(ws).await;
        if value["content"] == content {
            return value;
        }
    }
}

#[tokio::test]
async fn websocket_broadcast_flow() {
    let (router, _service) = build_app().await;
    let (addr, shutdown) = spawn_server(router).await;
    let base = format!("http://{addr}");
    let client = Client::new();

    let alice = new_session(&client, &base).await;
    let bob = new_session(&client, &base).await;
    let carol = new_session(&client, &base).await;

    let (mut alice_ws, _) = connect_async(format!("ws://{addr}/api/v1/ws?session_id={alice}"))
        .await
        .expect("ws connect");
    let (mut carol_ws, _) = connect_async(format!("ws://{addr}/api/v1/ws?session_id={carol}"))
        .await
        .expect("ws connect");
    // 等待连接在服务端完成注册
    sleep(Duration::from_millis(100)).await;

    join(&client, &base, &alice, "general", "alice").await;
    join(&client, &base, &bob, "general", "bob").await;
    join(&client, &base, &carol, "random", "carol").await;

    expect_content(&mut alice_ws, "bob has joined the channel.").await;

    client
        .post(format!("{base}/api/v1/channels/general/messages"))
        .header("x-session-id", &bob)
        .json(&json!({"content": "hello"}))
        .send()
        .await
        .expect("post message");

    let pushed = expect_content(&mut alice_ws, "hello").await;
    assert_eq!(pushed["type"], "user");
    assert_eq!(pushed["channel_name"], "general");
    assert_eq!(pushed["sender_name"], "bob");

    // 其他频道的成员只收到自己频道的消息
    let own = next_json(&mut carol_ws).await;
    assert_eq!(own["channel_name"], "random");
    assert!(timeout(Duration::from_millis(200), carol_ws.next())
        .await
        .is_err());

    let _ = shutdown.send(());
}

#[tokio::test]
async fn websocket_posts_and_disconnect_leaves_channel() {
    let (router, service) = build_app().await;
    let (addr, shutdown) = spawn_server(router).await;
    let base = format!("http://{addr}");
    let client = Client::new();

    let alice = new_session(&client, &base).await;
    let bob = new_session(&client, &base).await;

    let (mut alice_ws, _) = connect_async(format!("ws://{addr}/api/v1/ws?session_id={alice}"))
        .await
        .expect("ws connect");
    let (mut bob_ws, _) = connect_async(format!("ws://{addr}/api/v1/ws?session_id={bob}"))
        .await
        .expect("ws connect");
    sleep(Duration::from_millis(100)).await;
    join(&client, &base, &alice, "general", "alice").await;
    join(&client, &base, &bob, "general", "bob").await;

    bob_ws
        .send(TungsteniteMessage::Text(
            json!({"content": "from socket"}).to_string().into(),
        ))
        .await
        .expect("ws send");
    let pushed = expect_content(&mut alice_ws, "from socket").await;
    assert_eq!(pushed["sender_name"], "bob");

    // 无法解析的帧返回错误通知，连接保持
    bob_ws
        .send(TungsteniteMessage::Text("not json".into()))
        .await
        .expect("ws send");
    loop {
        let value = next_json(&mut bob_ws).await;
        if value["type"] == "error" {
            assert_eq!(value["code"], "BAD_REQUEST");
            break;
        }
    }

    bob_ws.close(None).await.expect("ws close");
    expect_content(&mut alice_ws, "bob has left the channel.").await;

    let channel = service.channel("general").await.unwrap();
    assert_eq!(channel.user_count(), 1);

    let _ = shutdown.send(());
}
