//! 状态派发引擎
//!
//! `Store` 持有当前 `AppState`，所有修改都通过 `dispatch` 串行执行：
//! 中间件链 → reducer → 写入共享后端（已绑定时） → 安装新状态 → 通知订阅者。
//!
//! 已绑定后端时使用版本号做乐观并发控制：写入冲突说明其他进程先提交了，
//! 重新加载后端状态并对新状态重跑 reducer，因此跨进程竞争同一前置条件时只有一方成功。

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use domain::{Action, AppState, DomainResult, Reducer};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{ChangeStream, StateBackend, StateChange, StateSnapshot};
use crate::error::StoreError;
use crate::middleware::{Commit, DispatchGuard, Middleware, Next};
use crate::task::TaskSupervisor;

/// 版本冲突时的默认最大重试次数
pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 16;

pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// 状态订阅者，每次成功派发后按订阅顺序调用
///
/// 调用发生在独立的通知任务中，订阅者的错误或 panic 只记录日志，不影响派发。
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_dispatch(&self, action: &Action, state: Arc<AppState>)
        -> Result<(), SubscriberError>;
}

/// 把同步闭包包装成订阅者
pub struct FnSubscriber<F>(pub F);

#[async_trait]
impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&Action, &AppState) + Send + Sync,
{
    async fn on_dispatch(
        &self,
        action: &Action,
        state: Arc<AppState>,
    ) -> Result<(), SubscriberError> {
        (self.0)(action, &state);
        Ok(())
    }
}

type SubscriberList = Arc<Vec<Arc<dyn Subscriber>>>;

enum NotifierCommand {
    Notify {
        action: Action,
        state: Arc<AppState>,
        subscribers: SubscriberList,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct Current {
    version: u64,
    state: Arc<AppState>,
}

struct Binding {
    backend: Arc<dyn StateBackend>,
    listener: JoinHandle<()>,
}

struct StoreInner {
    id: Uuid,
    reducer: Reducer,
    middleware: Vec<Arc<dyn Middleware>>,
    current: RwLock<Current>,
    dispatch_lock: Mutex<()>,
    subscribers: RwLock<SubscriberList>,
    notifier: mpsc::UnboundedSender<NotifierCommand>,
    binding: Mutex<Option<Binding>>,
    tasks: TaskSupervisor,
    max_commit_retries: u32,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.get_mut().take() {
            binding.listener.abort();
        }
    }
}

pub struct StoreBuilder {
    reducer: Reducer,
    initial_state: AppState,
    middleware: Vec<Arc<dyn Middleware>>,
    max_commit_retries: u32,
}

impl StoreBuilder {
    pub fn initial_state(mut self, state: AppState) -> Self {
        self.initial_state = state;
        self
    }

    /// 追加一个中间件，先添加的位于链的外层
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn max_commit_retries(mut self, retries: u32) -> Self {
        self.max_commit_retries = retries;
        self
    }

    /// 创建 Store，需要在 tokio 运行时中调用（会启动通知任务）
    pub fn build(self) -> Store {
        let (notifier, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_notifier(receiver));

        let inner = StoreInner {
            id: Uuid::new_v4(),
            reducer: self.reducer,
            middleware: self.middleware,
            current: RwLock::new(Current {
                version: 0,
                state: Arc::new(self.initial_state),
            }),
            dispatch_lock: Mutex::new(()),
            subscribers: RwLock::new(Arc::new(Vec::new())),
            notifier,
            binding: Mutex::new(None),
            tasks: TaskSupervisor::new(),
            max_commit_retries: self.max_commit_retries,
        };

        Store {
            inner: Arc::new(inner),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(reducer: Reducer) -> Self {
        Self::builder(reducer).build()
    }

    pub fn builder(reducer: Reducer) -> StoreBuilder {
        StoreBuilder {
            reducer,
            initial_state: AppState::empty(),
            middleware: Vec::new(),
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
        }
    }

    /// 本进程 Store 实例的标识，用于识别自己发布的变更通知
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn tasks(&self) -> &TaskSupervisor {
        &self.inner.tasks
    }

    /// 当前状态快照；只在替换引用的瞬间与派发互斥
    pub async fn get_state(&self) -> Arc<AppState> {
        self.inner.current.read().await.state.clone()
    }

    pub async fn version(&self) -> u64 {
        self.inner.current.read().await.version
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let mut subscribers = self.inner.subscribers.write().await;
        let mut next = subscribers.as_ref().clone();
        next.push(subscriber);
        *subscribers = Arc::new(next);
    }

    /// 派发一个动作并返回新状态
    ///
    /// 同一进程内的派发严格串行，按调用顺序执行。reducer 失败时状态不变，
    /// 领域错误原样返回给调用方。
    pub async fn dispatch(&self, action: Action) -> Result<Arc<AppState>, StoreError> {
        self.dispatch_with(action, None).await
    }

    /// 带前置条件的派发
    ///
    /// `guard` 在派发锁内对 reducer 即将使用的状态执行，跨进程冲突重试时对新状态重新执行。
    /// 检查失败与 reducer 失败一样：状态不变，错误原样返回。
    pub async fn dispatch_guarded<G>(
        &self,
        action: Action,
        guard: G,
    ) -> Result<Arc<AppState>, StoreError>
    where
        G: Fn(&AppState) -> DomainResult<()> + Send + Sync,
    {
        self.dispatch_with(action, Some(&guard)).await
    }

    async fn dispatch_with(
        &self,
        action: Action,
        guard: Option<&DispatchGuard<'_>>,
    ) -> Result<Arc<AppState>, StoreError> {
        let _lock = self.inner.dispatch_lock.lock().await;
        let commit = Next::new(self, &self.inner.middleware, guard)
            .run(action)
            .await?;
        Ok(commit.state)
    }

    /// 派发线路格式的动作
    pub async fn dispatch_json(&self, payload: &str) -> Result<Arc<AppState>, StoreError> {
        let action = Action::from_json(payload).map_err(|err| {
            if err.is_fatal() {
                tracing::error!(error = %err, "收到 reducer 动作集合之外的动作");
            }
            StoreError::from(err)
        })?;
        self.dispatch(action).await
    }

    /// 中间件链最内层：执行 reducer 并提交
    pub(crate) async fn commit(
        &self,
        action: Action,
        guard: Option<&DispatchGuard<'_>>,
    ) -> Result<Commit, StoreError> {
        let backend = self.backend().await;
        let mut attempts = 0u32;

        loop {
            let current = self.current().await;
            let reduced = match guard {
                Some(guard) => guard(current.state.as_ref()),
                None => Ok(()),
            }
            .and_then(|()| (self.inner.reducer)(&current.state, &action));

            let state = match reduced {
                Ok(state) => Arc::new(state),
                Err(err) => {
                    // 本地状态可能落后于其他进程，先确认后再判定失败
                    if let Some(backend) = backend.as_deref() {
                        if attempts < self.inner.max_commit_retries
                            && self.adopt_if_stale(backend, current.version).await?
                        {
                            attempts += 1;
                            continue;
                        }
                    }
                    return Err(err.into());
                }
            };
            let version = current.version + 1;

            if let Some(backend) = backend.as_deref() {
                let snapshot = StateSnapshot {
                    version,
                    state: state.clone(),
                };
                let change = StateChange {
                    origin: self.inner.id,
                    version,
                    action: Some(action.clone()),
                };

                if !backend
                    .compare_and_set(current.version, &snapshot, Some(&change))
                    .await?
                {
                    attempts += 1;
                    if attempts > self.inner.max_commit_retries {
                        tracing::warn!(
                            attempts,
                            action = action.kind(),
                            "版本冲突重试次数耗尽，放弃提交"
                        );
                        return Err(StoreError::Conflict { attempts });
                    }
                    tracing::debug!(attempts, "状态版本冲突，重新加载共享状态");
                    self.adopt(backend).await?;
                    continue;
                }
            }

            self.install(version, state.clone()).await;
            self.notify(action, state.clone()).await;

            return Ok(Commit {
                previous: current.state,
                state,
                version,
            });
        }
    }

    /// 绑定共享后端，开始跨进程同步
    ///
    /// 后端已有状态时采用后端状态；后端为空时把本地状态写入作为初始值。
    pub async fn bind(&self, backend: Arc<dyn StateBackend>) -> Result<(), StoreError> {
        let _dispatch = self.inner.dispatch_lock.lock().await;
        let mut binding = self.inner.binding.lock().await;
        if binding.is_some() {
            return Err(StoreError::AlreadyBound);
        }

        // 先订阅再加载，避免错过两者之间的变更
        let changes = backend.subscribe().await?;

        match backend.load().await? {
            Some(snapshot) => {
                tracing::info!(version = snapshot.version, "采用共享后端中的状态");
                self.replace(snapshot.version, snapshot.state).await;
            }
            None => {
                let current = self.current().await;
                if current.version > 0 {
                    let snapshot = StateSnapshot {
                        version: current.version,
                        state: current.state.clone(),
                    };
                    let change = StateChange {
                        origin: self.inner.id,
                        version: current.version,
                        action: None,
                    };
                    if !backend.compare_and_set(0, &snapshot, Some(&change)).await? {
                        self.adopt(backend.as_ref()).await?;
                    }
                }
            }
        }

        let listener = tokio::spawn(listen(
            Arc::downgrade(&self.inner),
            backend.clone(),
            changes,
        ));
        *binding = Some(Binding { backend, listener });

        tracing::info!(store_id = %self.inner.id, "Store 已绑定共享后端");
        Ok(())
    }

    /// 解除绑定，之后的派发只在本进程生效
    pub async fn unbind(&self) -> Result<(), StoreError> {
        let _dispatch = self.inner.dispatch_lock.lock().await;
        let binding = self
            .inner
            .binding
            .lock()
            .await
            .take()
            .ok_or(StoreError::NotBound)?;
        binding.listener.abort();

        tracing::info!(store_id = %self.inner.id, "Store 已解除共享后端绑定");
        Ok(())
    }

    pub async fn is_bound(&self) -> bool {
        self.inner.binding.lock().await.is_some()
    }

    /// 等待此前已排队的订阅者通知全部处理完
    pub async fn flush_subscribers(&self) {
        let (sender, receiver) = oneshot::channel();
        if self.inner.notifier.send(NotifierCommand::Flush(sender)).is_ok() {
            let _ = receiver.await;
        }
    }

    /// 关闭：等待后台任务结束、解除绑定、处理完剩余通知
    pub async fn shutdown(&self) {
        self.inner.tasks.shutdown().await;
        if self.is_bound().await {
            if let Err(err) = self.unbind().await {
                tracing::warn!(error = %err, "关闭时解除绑定失败");
            }
        }
        self.flush_subscribers().await;
    }

    async fn current(&self) -> Current {
        self.inner.current.read().await.clone()
    }

    async fn backend(&self) -> Option<Arc<dyn StateBackend>> {
        self.inner
            .binding
            .lock()
            .await
            .as_ref()
            .map(|binding| binding.backend.clone())
    }

    /// 只安装比当前更新的版本
    async fn install(&self, version: u64, state: Arc<AppState>) -> bool {
        let mut current = self.inner.current.write().await;
        if version <= current.version {
            return false;
        }
        *current = Current { version, state };
        true
    }

    /// 无条件替换为给定版本（后端是权威来源）
    async fn replace(&self, version: u64, state: Arc<AppState>) {
        *self.inner.current.write().await = Current { version, state };
    }

    async fn adopt(&self, backend: &dyn StateBackend) -> Result<(), StoreError> {
        match backend.load().await? {
            Some(snapshot) => self.replace(snapshot.version, snapshot.state).await,
            None => self.replace(0, Arc::new(AppState::empty())).await,
        }
        Ok(())
    }

    async fn adopt_if_stale(
        &self,
        backend: &dyn StateBackend,
        local_version: u64,
    ) -> Result<bool, StoreError> {
        match backend.load().await? {
            Some(snapshot) if snapshot.version != local_version => {
                self.replace(snapshot.version, snapshot.state).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_remote(
        &self,
        backend: &dyn StateBackend,
        change: StateChange,
    ) -> Result<(), StoreError> {
        if let Some(snapshot) = backend.load().await? {
            let version = snapshot.version;
            if self.install(version, snapshot.state).await {
                tracing::debug!(version, "已安装远端状态");
            }
        }

        // 其他进程的派发也要通知本进程的订阅者，本地连接只能由本进程推送
        if let Some(action) = change.action {
            let state = self.get_state().await;
            self.notify(action, state).await;
        }
        Ok(())
    }

    async fn notify(&self, action: Action, state: Arc<AppState>) {
        let subscribers = self.inner.subscribers.read().await.clone();
        if subscribers.is_empty() {
            return;
        }

        let command = NotifierCommand::Notify {
            action,
            state,
            subscribers,
        };
        if self.inner.notifier.send(command).is_err() {
            tracing::warn!("订阅者通知任务已停止");
        }
    }
}

async fn listen(
    store: Weak<StoreInner>,
    backend: Arc<dyn StateBackend>,
    mut changes: ChangeStream,
) {
    while let Some(change) = changes.recv().await {
        let Some(inner) = store.upgrade() else {
            break;
        };
        if change.origin == inner.id {
            continue;
        }

        let store = Store { inner };
        if let Err(err) = store.apply_remote(backend.as_ref(), change).await {
            tracing::warn!(error = %err, "应用远端状态变更失败");
        }
    }
    tracing::debug!("状态变更监听已停止");
}

async fn run_notifier(mut receiver: mpsc::UnboundedReceiver<NotifierCommand>) {
    while let Some(command) = receiver.recv().await {
        match command {
            NotifierCommand::Notify {
                action,
                state,
                subscribers,
            } => {
                for subscriber in subscribers.iter() {
                    let delivery = subscriber.on_dispatch(&action, state.clone());
                    match AssertUnwindSafe(delivery).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(action = action.kind(), error = %err, "订阅者处理失败")
                        }
                        Err(_) => tracing::error!(action = action.kind(), "订阅者发生 panic"),
                    }
                }
            }
            NotifierCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
