//! Manages the lifecycle of the long-running tasks of `listen`.
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Keeps named `JoinHandle`s so shutdown can wait for every task.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, handle));
    }

    /// Returns a clone of the shutdown receiver.
    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn task_count(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Waits for all managed tasks to complete. Returns the names of tasks
    /// that panicked.
    pub async fn shutdown(self) -> Vec<&'static str> {
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect::<Vec<_>>();
        info!(tasks = handles.len(), "Waiting for tasks to complete");

        let (names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        let mut panicked = Vec::new();
        for (task_name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name, "Task finished"),
                Err(e) => {
                    error!(task_name, error = %e, "Task panicked");
                    panicked.push(task_name);
                }
            }
        }

        if panicked.is_empty() {
            info!("All tasks shut down gracefully.");
        }
        panicked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks_and_reports_panics() {
        let (_tx, rx) = watch::channel(false);
        let manager = TaskManager::new(rx);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        manager.spawn("finishes", async move {
            let _ = done_tx.send(());
        });
        manager.spawn("panics", async { panic!("boom") });
        assert_eq!(manager.task_count(), 2);

        let panicked = manager.clone().shutdown().await;
        assert_eq!(panicked, vec!["panics"]);
        assert!(done_rx.await.is_ok());
        assert_eq!(manager.task_count(), 0);
    }

    #[tokio::test]
    async fn test_tasks_observe_shutdown_signal() {
        let (tx, rx) = watch::channel(false);
        let manager = TaskManager::new(rx);
        let mut task_rx = manager.get_shutdown_rx();
        manager.spawn("waits", async move {
            let _ = task_rx.changed().await;
        });

        tx.send(true).unwrap();
        assert!(manager.shutdown().await.is_empty());
    }
}
