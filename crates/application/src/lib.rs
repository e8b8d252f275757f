//! 应用层实现。
//!
//! 围绕领域 reducer 的状态派发引擎：串行派发、中间件链、订阅者通知、
//! 跨进程共享状态同步，以及面向传输层的聊天用例和连接广播。

pub mod backend;
pub mod connections;
pub mod error;
pub mod middleware;
pub mod notice;
pub mod services;
pub mod store;
pub mod task;

pub use backend::{
    memory::MemoryStateBackend, BackendError, ChangeStream, StateBackend, StateChange,
    StateSnapshot,
};
pub use connections::{
    Broadcaster, ChannelMessage, ConnectionRegistry, ConnectionSender, DeliveryReport,
};
pub use error::StoreError;
pub use middleware::{Commit, DispatchGuard, LoggingMiddleware, Middleware, Next};
pub use notice::SystemNoticeMiddleware;
pub use services::ChatService;
pub use store::{FnSubscriber, Store, StoreBuilder, Subscriber, SubscriberError};
pub use task::TaskSupervisor;
