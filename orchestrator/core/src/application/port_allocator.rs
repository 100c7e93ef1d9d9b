// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! External port allocation for networked deployments.
//!
//! Reading "ports in use" and persisting the chosen port must happen inside one
//! critical section, otherwise two concurrent hirings can both see a port as
//! free. [`PortAllocator::reserve`] hands out a [`PortLease`] that keeps the
//! allocator locked until the caller has saved the deployment and dropped it.
//! The store's uniqueness constraint on live ports backs this up across
//! processes.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::domain::error::OrchestrationError;
use crate::domain::node_config::PortRange;
use crate::domain::repository::DeploymentRepository;

pub struct PortAllocator {
    range: PortRange,
    deployments: Arc<dyn DeploymentRepository>,
    lock: Mutex<()>,
}

/// A port chosen under the allocator lock. Persist it, then drop the lease.
pub struct PortLease<'a> {
    port: u16,
    _guard: MutexGuard<'a, ()>,
}

impl PortLease<'_> {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl PortAllocator {
    pub fn new(range: PortRange, deployments: Arc<dyn DeploymentRepository>) -> Self {
        Self {
            range,
            deployments,
            lock: Mutex::new(()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Picks the lowest free port, or `preferred` when it is in range and free.
    pub async fn reserve(
        &self,
        preferred: Option<u16>,
    ) -> Result<PortLease<'_>, OrchestrationError> {
        let guard = self.lock.lock().await;
        let used: HashSet<u16> = self.deployments.ports_in_use().await?.into_iter().collect();

        let port = preferred
            .filter(|port| self.range.contains(*port) && !used.contains(port))
            .or_else(|| self.range.iter().find(|port| !used.contains(port)))
            .ok_or_else(|| {
                OrchestrationError::ResourceExhausted(format!(
                    "No free external port in range {}-{} ({} in use)",
                    self.range.start,
                    self.range.end,
                    used.len()
                ))
            })?;

        debug!(port, preferred = ?preferred, "Reserved external port");
        Ok(PortLease { port, _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{AgentId, ExecutionModel};
    use crate::domain::deployment::{Deployment, DeploymentStatus};
    use crate::domain::hiring::{HiringId, UserId};
    use crate::infrastructure::repositories::InMemoryDeploymentRepository;

    fn networked(hiring: i64, port: u16) -> Deployment {
        Deployment::new(
            HiringId(hiring),
            UserId(1),
            AgentId::new("srv"),
            ExecutionModel::AcpServer,
            Some(8080),
            Some(port),
        )
    }

    #[tokio::test]
    async fn test_skips_live_ports_and_reuses_terminal_ones() {
        let repo = Arc::new(InMemoryDeploymentRepository::new());
        repo.save(&networked(1, 20000)).await.unwrap();
        let mut stopped = networked(2, 20001);
        stopped.status = DeploymentStatus::Stopped;
        repo.save(&stopped).await.unwrap();

        let allocator = PortAllocator::new(PortRange { start: 20000, end: 20002 }, repo);
        let lease = allocator.reserve(None).await.unwrap();
        assert_eq!(lease.port(), 20001);
    }

    #[tokio::test]
    async fn test_preferred_port_kept_when_free() {
        let repo = Arc::new(InMemoryDeploymentRepository::new());
        repo.save(&networked(1, 20000)).await.unwrap();
        let allocator = PortAllocator::new(PortRange { start: 20000, end: 20010 }, repo);

        assert_eq!(allocator.reserve(Some(20005)).await.unwrap().port(), 20005);
        assert_eq!(allocator.reserve(Some(20000)).await.unwrap().port(), 20001);
        assert_eq!(allocator.reserve(Some(80)).await.unwrap().port(), 20001);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let repo = Arc::new(InMemoryDeploymentRepository::new());
        repo.save(&networked(1, 20000)).await.unwrap();
        let allocator = PortAllocator::new(PortRange { start: 20000, end: 20000 }, repo);

        let err = allocator.reserve(None).await.err().unwrap();
        assert!(matches!(err, OrchestrationError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_collide() {
        let repo: Arc<dyn DeploymentRepository> = Arc::new(InMemoryDeploymentRepository::new());
        let allocator = Arc::new(PortAllocator::new(PortRange { start: 21000, end: 21050 }, repo.clone()));

        let tasks: Vec<_> = (1..=20)
            .map(|hiring| {
                let allocator = allocator.clone();
                let repo = repo.clone();
                tokio::spawn(async move {
                    let lease = allocator.reserve(None).await.unwrap();
                    repo.save(&networked(hiring, lease.port())).await.unwrap();
                    lease.port()
                })
            })
            .collect();

        let mut ports = HashSet::new();
        for task in tasks {
            assert!(ports.insert(task.await.unwrap()));
        }
        assert_eq!(ports.len(), 20);
    }
}
