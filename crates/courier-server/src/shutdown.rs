//! Ordered shutdown of the daemon's long-running tasks.
//!
//! Every tracked task shares one `CancellationToken` and one deadline. Tasks
//! still running at the deadline are aborted so a wedged transport call
//! cannot hold the process open.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courier_settings::ServerSettings;

struct TrackedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

enum TaskExit {
    Finished,
    Panicked(String),
    Aborted,
}

/// Which tracked tasks stopped on their own and which had to be cut off.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: Vec<&'static str>,
    pub panicked: Vec<&'static str>,
    pub aborted: Vec<&'static str>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.panicked.is_empty() && self.aborted.is_empty()
    }
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    timeout: Duration,
    tasks: Vec<TrackedTask>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
            tasks: Vec::new(),
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(Duration::from_secs(settings.shutdown_timeout_secs))
    }

    /// Token to hand to the server and the reconciler.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push(TrackedTask { name, handle });
    }

    /// Track a group of tasks under one name, e.g. the reconciler cadences.
    pub fn track_all(&mut self, name: &'static str, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        for handle in handles {
            self.track(name, handle);
        }
    }

    /// Cancel the token and wait for every task until the shared deadline.
    pub async fn shutdown(self) -> ShutdownReport {
        self.token.cancel();
        let deadline = Instant::now() + self.timeout;
        info!(
            tasks = self.tasks.len(),
            timeout_secs = self.timeout.as_secs(),
            "stopping courier tasks"
        );

        let waits = self.tasks.into_iter().map(|TrackedTask { name, mut handle }| async move {
            let exit = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => TaskExit::Finished,
                Ok(Err(e)) => TaskExit::Panicked(e.to_string()),
                Err(_) => {
                    handle.abort();
                    TaskExit::Aborted
                }
            };
            (name, exit)
        });

        let mut report = ShutdownReport::default();
        for (name, exit) in futures::future::join_all(waits).await {
            match exit {
                TaskExit::Finished => report.finished.push(name),
                TaskExit::Panicked(reason) => {
                    error!(task = name, error = %reason, "task failed during shutdown");
                    report.panicked.push(name);
                }
                TaskExit::Aborted => {
                    warn!(task = name, "task still running at shutdown deadline, aborted");
                    report.aborted.push(name);
                }
            }
        }
        report
    }
}
