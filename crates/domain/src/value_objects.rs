use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 会话唯一标识。
///
/// 由传输层签发的不透明字符串，每个已连接客户端唯一，同时也是用户的身份。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// 生成一个新的随机会话标识
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 用户显示颜色编号，取值范围 `0..255`。
pub type ColorId = u8;

/// 由会话标识推导颜色编号（FNV-1a）。
///
/// 颜色只在创建用户时计算一次；reducer 必须是确定性的，所以这里不使用随机数。
pub fn color_id_for(session_id: &SessionId) -> ColorId {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in session_id.as_str().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash % 255) as ColorId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_id_is_stable_for_same_session() {
        let session = SessionId::new("abc");
        assert_eq!(color_id_for(&session), color_id_for(&session.clone()));
    }

    #[test]
    fn color_id_stays_in_range() {
        for _ in 0..64 {
            assert!(color_id_for(&SessionId::generate()) < 255);
        }
    }

    #[test]
    fn session_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&SessionId::new("s-1")).unwrap();
        assert_eq!(json, "\"s-1\"");
    }
}
