//! 主应用程序入口
//!
//! 加载配置，组装状态派发链路，启动 Axum Web API 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{
    Broadcaster, ChatService, ConnectionRegistry, LoggingMiddleware, Store,
    SystemNoticeMiddleware,
};
use config::AppConfig;
use domain::app_reducer;
use infrastructure::RedisStateBackend;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(config = %config.sanitized(), "配置加载完成");

    let registry = Arc::new(ConnectionRegistry::new());
    let store = Store::builder(app_reducer)
        .middleware(LoggingMiddleware)
        .middleware(SystemNoticeMiddleware)
        .max_commit_retries(config.store.max_commit_retries)
        .build();
    store
        .subscribe(Arc::new(Broadcaster::new(registry.clone())))
        .await;

    if config.store.redis_enabled {
        let backend = RedisStateBackend::connect(&config.redis)
            .await
            .context("连接 Redis 失败")?;
        backend.ping().await.context("Redis 健康检查失败")?;
        store
            .bind(Arc::new(backend))
            .await
            .context("绑定共享状态失败")?;
        tracing::info!(prefix = %config.redis.key_prefix, "已绑定 Redis 共享状态");
    } else {
        tracing::info!("未启用 Redis，状态仅在本进程内维护");
    }

    let chat_service = Arc::new(ChatService::new(store.clone(), registry));
    let app = router(AppState::new(chat_service), &config.server.cors_origins);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听 {addr} 失败"))?;

    tracing::info!("聊天服务器启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.shutdown().await;
    tracing::info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始优雅关闭");
}
