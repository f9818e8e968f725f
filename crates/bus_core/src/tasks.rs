//! Supervised task registry: every long-lived task `start_server` spawns
//! (RPC consumers, event listeners, the schema monitor, scheduled jobs) is
//! registered here under a `TaskKind` tag so the shutdown sweep can cancel
//! by kind, and so an unexpected task exit can be escalated uniformly
//! instead of silently vanishing.

use std::sync::{Arc, RwLock};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    RpcConsumer,
    EventListener,
    SchemaMonitor,
    Background,
}

struct Entry {
    kind: TaskKind,
    handle: JoinHandle<()>,
}

/// `shutdown` is the single `Notify` every spawned task races against; tasks
/// that ignore it (a handler stuck mid-await) are not forcibly killed;
/// cooperative shutdown only cancels at await points the task itself yields.
#[derive(Default)]
pub struct TaskRegistry {
    entries: RwLock<Vec<Entry>>,
    shutdown: Arc<Notify>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn register(&self, kind: TaskKind, handle: JoinHandle<()>) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Entry { kind, handle });
    }

    pub fn count(&self, kind: TaskKind) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every task's shutdown race, then wait for all of them to finish.
    /// A task that never observes the signal (stuck outside an await point)
    /// blocks this call; callers on a deadline should wrap it in a timeout.
    pub async fn shutdown_and_join(&self) {
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.entries.write().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).map(|e| e.handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_and_join_drains_and_awaits_every_task() {
        let registry = TaskRegistry::new();
        let shutdown = registry.shutdown_signal();
        let shutdown_for_task = shutdown.clone();
        registry.register(
            TaskKind::Background,
            tokio::spawn(async move {
                shutdown_for_task.notified().await;
            }),
        );
        assert_eq!(registry.count(TaskKind::Background), 1);

        registry.shutdown_and_join().await;
        assert!(registry.is_empty());
    }
}
