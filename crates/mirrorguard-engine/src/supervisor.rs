/*
[INPUT]:  Long-running engine futures and a process-wide shutdown signal
[OUTPUT]: Supervised tokio tasks joined with a bounded shutdown deadline
[POS]:    Execution layer - task supervision around the monitoring loop
[UPDATE]: When changing shutdown guarantees or supervision semantics
*/

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

static PANIC_HOOK_ONCE: Once = Once::new();

fn ensure_panic_hook_installed() {
    PANIC_HOOK_ONCE.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!("panic in supervised task: {info}");
            previous(info);
        }));
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRuntimeStatus {
    Running,
    Finished,
}

#[derive(Debug)]
struct ManagedTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervises the engine's long-running tasks. Each task gets a child
/// cancellation token; shutdown cancels everything and joins with a
/// deadline so a wedged task cannot hang the process exit.
#[derive(Debug, Default)]
pub struct Supervisor {
    tasks: HashMap<String, ManagedTask>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        ensure_panic_hook_installed();
        Self {
            tasks: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a named task. The closure receives a child token that fires
    /// on process shutdown or a targeted stop.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(task(token.clone()));
        tracing::info!(task = %name, "task spawned");
        self.tasks.insert(
            name,
            ManagedTask {
                shutdown: token,
                handle,
            },
        );
    }

    /// Names of every task currently under supervision.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn runtime_status(&self, name: &str) -> Option<TaskRuntimeStatus> {
        self.tasks.get(name).map(|task| {
            if task.handle.is_finished() {
                TaskRuntimeStatus::Finished
            } else {
                TaskRuntimeStatus::Running
            }
        })
    }

    /// Stop one task and wait for it within the shutdown deadline.
    pub async fn stop_task(&mut self, name: &str) -> Result<()> {
        let Some(task) = self.tasks.remove(name) else {
            return Err(anyhow!("no task named {name}"));
        };
        task.shutdown.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_err)) => Err(anyhow!("task {name} panicked: {join_err}")),
            Err(_) => Err(anyhow!("task {name} did not stop within deadline")),
        }
    }

    /// Cancel every task and join them all, bounded by the deadline.
    pub async fn shutdown_and_wait(&mut self) -> Result<()> {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;

        let mut failures = Vec::new();
        for (name, task) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, task.handle).await {
                Ok(Ok(())) => tracing::info!(task = %name, "task stopped"),
                Ok(Err(join_err)) => {
                    tracing::error!(task = %name, error = %join_err, "task panicked");
                    failures.push(name);
                }
                Err(_) => {
                    tracing::error!(task = %name, "task did not stop within deadline");
                    failures.push(name);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("tasks failed to stop cleanly: {failures:?}"))
        }
    }
}
