// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Supervised registry of background deployment work, keyed by deployment id.
//!
//! Build, deploy and teardown jobs for one deployment run strictly one after
//! another: a newly spawned job awaits the previous handle before starting.
//! Handles stay owned here until the job finishes, so nothing is dropped
//! mid-flight and shutdown can cancel and drain everything in one place.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::deployment::DeploymentId;

struct Job {
    handle: JoinHandle<()>,
    /// Shared by every job queued in one chain; cancelling it drops them all.
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct DeploymentWorkers {
    tasks: Mutex<HashMap<DeploymentId, Job>>,
    shutdown: CancellationToken,
}

impl DeploymentWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); long jobs may watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Queues `job` behind any job already running for `deployment_id`.
    pub fn spawn<F>(&self, deployment_id: DeploymentId, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            warn!(deployment_id = %deployment_id, "Worker registry shut down, job dropped");
            return;
        }

        let mut tasks = self.tasks.lock();
        let previous = tasks.remove(&deployment_id);
        let cancel = previous
            .as_ref()
            .map(|p| p.cancel.clone())
            .filter(|token| !token.is_cancelled())
            .unwrap_or_else(|| self.shutdown.child_token());
        let token = cancel.clone();
        let id = deployment_id.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.handle.await;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(deployment_id = %id, "Deployment job cancelled");
                }
                _ = job => {}
            }
        });
        tasks.insert(deployment_id, Job { handle, cancel });
    }

    /// Cancels the job chain of `deployment_id` and waits for it to unwind.
    /// Returns whether a chain was still running. Must not be called from a
    /// job of the same chain.
    pub async fn cancel(&self, deployment_id: &DeploymentId) -> bool {
        let job = self.tasks.lock().remove(deployment_id);
        match job {
            Some(job) => {
                let running = !job.handle.is_finished();
                job.cancel.cancel();
                let _ = job.handle.await;
                if running {
                    debug!(deployment_id = %deployment_id, "In-flight deployment job cancelled");
                }
                running
            }
            None => false,
        }
    }

    pub fn is_busy(&self, deployment_id: &DeploymentId) -> bool {
        self.tasks
            .lock()
            .get(deployment_id)
            .map(|job| !job.handle.is_finished())
            .unwrap_or(false)
    }

    /// Drops handles of finished jobs. Returns how many are still running.
    pub fn prune(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, job| !job.handle.is_finished());
        tasks.len()
    }

    /// Waits for the current job chain of `deployment_id`, if any.
    pub async fn wait(&self, deployment_id: &DeploymentId) {
        let job = self.tasks.lock().remove(deployment_id);
        if let Some(job) = job {
            let _ = job.handle.await;
        }
    }

    /// Cancels every job and waits for the tasks to unwind.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().drain().map(|(_, job)| job.handle).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
