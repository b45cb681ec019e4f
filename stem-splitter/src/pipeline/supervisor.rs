//! Supervision of per-job pipeline tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// Owns every dispatched pipeline task.
///
/// At most one task runs per job id; the task set is drained (or aborted) on
/// shutdown.
pub struct PipelineSupervisor {
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    live: Arc<DashMap<String, AbortHandle>>,
}

/// Removes a job from the live map when its task ends, however it ends.
struct LiveGuard {
    job_id: String,
    live: Arc<DashMap<String, AbortHandle>>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.remove(&self.job_id);
    }
}

impl Default for PipelineSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineSupervisor {
    pub fn new() -> Self {
        Self {
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
            live: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the pipeline task for `job_id`.
    ///
    /// Fails if the job already has a live task or the supervisor is shut down.
    pub fn spawn<F>(&self, job_id: &str, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return Err(Error::Pipeline(
                "Pipeline supervisor is shut down".to_string(),
            ));
        };

        // Reap finished tasks so the set does not grow without bound.
        while let Some(finished) = join_set.try_join_next() {
            if let Err(e) = finished
                && e.is_panic()
            {
                error!(error = %e, "Pipeline task panicked");
            }
        }

        match self.live.entry(job_id.to_string()) {
            Entry::Occupied(_) => Err(Error::Pipeline(format!(
                "Job {job_id} already has a running pipeline"
            ))),
            Entry::Vacant(slot) => {
                let guard = LiveGuard {
                    job_id: job_id.to_string(),
                    live: self.live.clone(),
                };
                let handle = join_set.spawn(async move {
                    let _guard = guard;
                    task.await;
                });
                slot.insert(handle);
                debug!(job_id = %job_id, "Pipeline dispatched");
                Ok(())
            }
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.live.contains_key(job_id)
    }

    /// Number of live pipeline tasks.
    pub fn running(&self) -> usize {
        self.live.len()
    }

    /// Wait up to `timeout` for every task, then abort the rest.
    ///
    /// Returns the number of aborted tasks. Later calls to [`spawn`](Self::spawn)
    /// fail.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return 0;
        };

        info!(running = join_set.len(), "Waiting for pipeline tasks");
        let drained = tokio::time::timeout(timeout, async {
            while let Some(finished) = join_set.join_next().await {
                if let Err(e) = finished
                    && e.is_panic()
                {
                    error!(error = %e, "Pipeline task panicked");
                }
            }
        })
        .await;

        let aborted = if drained.is_err() {
            let remaining = join_set.len();
            warn!(remaining, "Shutdown timeout reached, aborting pipeline tasks");
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
            remaining
        } else {
            0
        };

        self.live.clear();
        info!("Pipeline supervisor stopped");
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_refuses_duplicate_job_ids() {
        let supervisor = PipelineSupervisor::new();
        let (tx, rx) = oneshot::channel::<()>();

        supervisor
            .spawn("job-1", async move {
                let _ = rx.await;
            })
            .unwrap();
        assert!(supervisor.is_running("job-1"));
        assert!(supervisor.spawn("job-1", async {}).is_err());

        tx.send(()).unwrap();
        supervisor.shutdown(Duration::from_secs(5)).await;
        assert!(!supervisor.is_running("job-1"));
    }

    #[tokio::test]
    async fn test_finished_task_frees_its_id() {
        let supervisor = PipelineSupervisor::new();
        let (tx, rx) = oneshot::channel::<()>();
        supervisor
            .spawn("job-1", async move {
                let _ = tx.send(());
            })
            .unwrap();
        rx.await.unwrap();

        for _ in 0..100 {
            if !supervisor.is_running("job-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(supervisor.spawn("job-1", async {}).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_timeout() {
        let supervisor = PipelineSupervisor::new();
        supervisor
            .spawn("stuck", std::future::pending::<()>())
            .unwrap();
        supervisor.spawn("quick", async {}).unwrap();

        let aborted = supervisor.shutdown(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
        assert_eq!(supervisor.running(), 0);
        assert!(supervisor.spawn("late", async {}).is_err());
    }
}
