//! 频道聊天系统核心领域模型
//!
//! 包含用户、频道、消息等不可变值类型，封闭的动作集合，以及唯一定义状态转换的 reducer。

pub mod action;
pub mod entities;
pub mod errors;
pub mod reducer;
pub mod value_objects;

// 重新导出常用类型
pub use action::Action;
pub use entities::*;
pub use errors::*;
pub use reducer::{app_reducer, Reducer};
pub use value_objects::*;
