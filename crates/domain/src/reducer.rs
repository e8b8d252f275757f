//! 应用 reducer
//!
//! 纯函数 `(state, action) -> state'`，是动作如何改变状态的唯一定义。

use crate::action::Action;
use crate::entities::AppState;
use crate::errors::DomainResult;

/// reducer 函数签名
pub type Reducer = fn(&AppState, &Action) -> DomainResult<AppState>;

pub fn app_reducer(state: &AppState, action: &Action) -> DomainResult<AppState> {
    match action {
        Action::AddUser {
            session_id,
            name,
            channel_name,
        } => state.add_user(session_id, name, channel_name),
        Action::RemoveUser { session_id } => state.remove_user(session_id),
        Action::AddMessage {
            channel_name,
            message,
        } => state.add_message(channel_name, message.clone()),
    }
}
