//! 基础设施层实现。
//!
//! 提供应用层 `StateBackend` 接口的 Redis 适配器。

pub mod redis;

pub use crate::redis::{RedisError, RedisKeys, RedisResult, RedisStateBackend};
