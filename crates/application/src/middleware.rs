//! 派发中间件链
//!
//! 每个中间件包裹 `next`：可以在调用前检查动作、调用后检查结果状态、
//! 不调用 `next` 直接短路，或通过 `TaskSupervisor` 派发额外动作。
//! 在中间件内同步递归调用 `Store::dispatch` 会在单写者锁上死锁。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{Action, AppState, DomainResult};

use crate::error::StoreError;
use crate::store::Store;

/// 一次派发的结果：派发前后的状态
#[derive(Debug, Clone)]
pub struct Commit {
    pub previous: Arc<AppState>,
    pub state: Arc<AppState>,
    pub version: u64,
}

impl Commit {
    /// 中间件短路时返回的"未改变"结果
    pub fn unchanged(state: Arc<AppState>, version: u64) -> Self {
        Self {
            previous: state.clone(),
            state,
            version,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        Arc::ptr_eq(&self.previous, &self.state)
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        store: &Store,
        action: Action,
        next: Next<'_>,
    ) -> Result<Commit, StoreError>;
}

/// 提交前的前置条件检查
///
/// 在派发锁内对 reducer 即将使用的同一个状态执行，版本冲突重试时重新执行。
pub type DispatchGuard<'g> = dyn Fn(&AppState) -> DomainResult<()> + Send + Sync + 'g;

/// 链中剩余的部分，最内层是 reducer 提交
pub struct Next<'a> {
    store: &'a Store,
    chain: &'a [Arc<dyn Middleware>],
    guard: Option<&'a DispatchGuard<'a>>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        store: &'a Store,
        chain: &'a [Arc<dyn Middleware>],
        guard: Option<&'a DispatchGuard<'a>>,
    ) -> Self {
        Self {
            store,
            chain,
            guard,
        }
    }

    pub async fn run(self, action: Action) -> Result<Commit, StoreError> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next::new(self.store, rest, self.guard);
                middleware.handle(self.store, action, next).await
            }
            None => self.store.commit(action, self.guard).await,
        }
    }
}

/// 记录每次派发的动作类型和结果
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        _store: &Store,
        action: Action,
        next: Next<'_>,
    ) -> Result<Commit, StoreError> {
        let kind = action.kind();
        let result = next.run(action).await;
        match &result {
            Ok(commit) => tracing::debug!(action = kind, version = commit.version, "动作已提交"),
            Err(err) => tracing::debug!(action = kind, error = %err, "动作被拒绝"),
        }
        result
    }
}
