use std::future::Future;

use anyhow::{Result, anyhow};
use log::{error, info};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs named long-lived tasks until the first one ends.
///
/// When any task returns (or panics) the shared token is cancelled so the
/// rest wind down. Tasks are never restarted.
pub struct TaskManager {
    tasks: JoinSet<(String, Result<()>)>,
    cancel: CancellationToken,
}

impl TaskManager {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        info!("Starting task {}", name);
        let name = name.to_string();
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Wait for every task. Returns the first failure.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!("Task {} finished", name);
                    None
                }
                Ok((name, Err(e))) => {
                    error!("Task {} failed: {:#}", name, e);
                    Some(e.context(format!("task {name} failed")))
                }
                Err(e) => {
                    error!("Task panicked: {}", e);
                    Some(anyhow!("task panicked: {e}"))
                }
            };

            self.cancel.cancel();
            if first_error.is_none() {
                first_error = failure;
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
