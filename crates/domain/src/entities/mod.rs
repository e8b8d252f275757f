//! 领域实体
//!
//! 不可变值类型：用户、频道、消息以及整体应用状态。

pub mod app_state;
pub mod channel;
pub mod message;
pub mod user;

pub use app_state::AppState;
pub use channel::Channel;
pub use message::{Message, SystemMessage, UserMessage};
pub use user::User;
