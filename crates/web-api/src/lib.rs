//! Web API 层。
//!
//! 提供 Axum 路由，将 HTTP / WebSocket 请求委托给应用层的聊天用例。

mod error;
mod routes;
mod state;
mod ws_connection;

pub use error::{ApiError, ErrorBody};
pub use routes::{cors_layer, router, CurrentSession, SESSION_HEADER};
pub use state::AppState;
