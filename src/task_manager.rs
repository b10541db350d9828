//! Manages the lifecycle of all spawned tasks in the application.
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A centralized manager for all spawned tasks.
///
/// Spawns named tasks, hands out the root cancellation token and, on
/// shutdown, awaits every task it spawned.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
    cancel: CancellationToken,
}

impl TaskManager {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            cancel,
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task_name = name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles.lock().push((name, handle));
    }

    /// The root token; cancelling it asks every task to stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Waits for all managed tasks to complete.
    pub async fn shutdown(self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        info!(
            "TaskManager shutting down. Waiting for {} tasks to complete...",
            handles.len()
        );

        let task_names: Vec<&'static str> = handles.iter().map(|(name, _)| *name).collect();
        debug!(tasks = ?task_names, "Awaiting all tasks.");

        let results = join_all(handles.into_iter().map(|(_, handle)| handle)).await;

        let mut panicked = Vec::new();
        for (task_name, result) in task_names.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name, "Task shut down gracefully."),
                Err(e) => {
                    error!(task_name, error = %e, "Task panicked during shutdown.");
                    panicked.push(task_name);
                }
            }
        }

        if panicked.is_empty() {
            info!("All tasks shut down gracefully.");
        } else {
            error!(tasks = ?panicked, "{} tasks panicked during shutdown", panicked.len());
        }
    }
}
