use std::sync::Arc;

use application::{
    Broadcaster, ChatService, ConnectionRegistry, LoggingMiddleware, Store,
    SystemNoticeMiddleware,
};
use axum::Router;
use domain::app_reducer;
use web_api::{router, AppState};

/// 内存版本的完整服务：系统通知中间件 + 连接广播
pub async fn build_app() -> (Router, Arc<ChatService>) {
    let registry = Arc::new(ConnectionRegistry::new());
    let store = Store::builder(app_reducer)
        .middleware(LoggingMiddleware)
        .middleware(SystemNoticeMiddleware)
        .build();
    store
        .subscribe(Arc::new(Broadcaster::new(registry.clone())))
        .await;

    let chat_service = Arc::new(ChatService::new(store, registry));
    let router = router(AppState::new(chat_service.clone()), &["*".to_string()]);
    (router, chat_service)
}

#[allow(dead_code)]
pub async fn build_router() -> Router {
    build_app().await.0
}
