//! Redis 共享状态后端
//!
//! 状态快照与版本号存放在普通键中，通过 Lua 脚本原子地比较版本、写入并发布变更通知；
//! 各进程订阅变更频道，断线后自动重连并请求重新同步。

pub mod backend;
pub mod error;

pub use backend::*;
pub use error::*;
