//! 后台任务监管
//!
//! 中间件派发的次级动作等"发出即不管"的任务都在这里登记：失败只记录日志，
//! 关闭时等待所有任务结束，不会有悄悄泄漏的任务。

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
    closed: Arc<AtomicBool>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动一个受监管的后台任务；关闭后提交的任务直接丢弃
    pub fn spawn<F, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.is_closed() {
            tracing::warn!(task = name, "后台任务监管已关闭，丢弃任务");
            return;
        }
        self.tracker.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => tracing::debug!(task = name, "后台任务完成"),
                Ok(Err(err)) => tracing::warn!(task = name, error = %err, "后台任务失败"),
                Err(_) => tracing::error!(task = name, "后台任务发生 panic"),
            }
        });
    }

    /// 正在运行的任务数量
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 等待当前所有任务（包括它们派生的任务）结束，之后仍可继续提交新任务
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// 停止接收新任务并等待现有任务结束
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("后台任务已全部结束");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn settle_waits_for_nested_tasks() {
        let supervisor = TaskSupervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner = supervisor.clone();
        let inner_counter = counter.clone();
        supervisor.spawn("outer", async move {
            inner.spawn("inner", async move {
                tokio::task::yield_now().await;
                inner_counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            });
            Ok::<_, String>(())
        });

        supervisor.settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn failing_and_panicking_tasks_are_contained() {
        let supervisor = TaskSupervisor::new();
        supervisor.spawn("fails", async { Err::<(), _>("boom") });
        supervisor.spawn("panics", async {
            if true {
                panic!("task panic");
            }
            Ok::<_, String>(())
        });

        supervisor.settle().await;

        // 仍然可以继续提交任务
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        supervisor.spawn("after", async move {
            flag.store(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        supervisor.settle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tasks_submitted_after_shutdown_are_dropped() {
        let supervisor = TaskSupervisor::new();
        supervisor.shutdown().await;
        assert!(supervisor.is_closed());

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        supervisor.spawn("late", async move {
            flag.store(1, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        supervisor.settle().await;

        assert!(supervisor.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
