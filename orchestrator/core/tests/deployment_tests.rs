// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;

use aghub_orchestrator_core::domain::agent::ExecutionModel;
use aghub_orchestrator_core::domain::deployment::DeploymentStatus;
use aghub_orchestrator_core::domain::endpoint::HealthProbe;
use aghub_orchestrator_core::domain::error::OrchestrationError;
use aghub_orchestrator_core::domain::events::DeploymentEvent;
use aghub_orchestrator_core::domain::hiring::{HiringStatus, UserId};
use aghub_orchestrator_core::domain::node_config::PortRange;
use aghub_orchestrator_core::infrastructure::event_bus::DomainEvent;

use common::{test_spec, Harness};

#[tokio::test]
async fn test_function_deployment_reaches_running() {
    let harness = Harness::new();
    harness.seed_agent("ABC123", ExecutionModel::Function, 9).await;

    let (created, deployment) = harness.hire_running(1, "ABC123").await;

    let id = deployment.id.as_str();
    assert!(id.starts_with("func-user-1-agent-ABC123-hire-1-"), "unexpected id {}", id);
    let suffix = id.rsplit('-').next().unwrap();
    assert_eq!(suffix.len(), 8);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

    assert_eq!(created.hiring.status, HiringStatus::Active);
    assert!(deployment.external_port.is_none());
    assert!(deployment.container_id.is_some());
    assert!(deployment.started_at.is_some());

    let container = harness.runtime.container(&deployment.container_name).unwrap();
    assert!(container.running);
    assert!(container.spec.port.is_none());
    assert!(container
        .spec
        .env
        .contains(&("AGHUB_HIRING_ID".to_string(), "1".to_string())));
    assert!(!container.spec.env.iter().any(|(k, _)| k == "PORT"));

    let builds = harness.runtime.builds.lock();
    assert_eq!(builds.len(), 1);
    assert!(builds[0].1.contains("Dockerfile"));
    assert!(builds[0].1.contains("main.py"));
}

#[tokio::test]
async fn test_deployment_walks_the_build_states_in_order() {
    let harness = Harness::new();
    harness.seed_agent("walker", ExecutionModel::Function, 1).await;
    let mut events = harness.orchestrator.event_bus.subscribe();

    let (_, deployment) = harness.hire_running(1, "walker").await;

    let mut seen = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if let DomainEvent::Deployment(DeploymentEvent::DeploymentStatusChanged {
            deployment_id,
            from,
            to,
            ..
        }) = event
        {
            assert_eq!(deployment_id, deployment.id);
            seen.push((from, to));
        }
    }
    assert_eq!(
        seen,
        vec![
            (DeploymentStatus::Pending, DeploymentStatus::Building),
            (DeploymentStatus::Building, DeploymentStatus::Deploying),
            (DeploymentStatus::Deploying, DeploymentStatus::Running),
        ]
    );
}

#[tokio::test]
async fn test_networked_deployments_get_distinct_ports() {
    let harness = Harness::new();
    harness.seed_agent("chatty", ExecutionModel::AcpServer, 1).await;

    let mut ports = HashSet::new();
    for user in 1..=4 {
        let (_, deployment) = harness.hire_running(user, "chatty").await;
        let port = deployment.external_port.expect("networked deployments publish a port");
        assert!((21000..=21009).contains(&port));
        assert!(ports.insert(port), "port {} handed out twice", port);

        let container = harness.runtime.container(&deployment.container_name).unwrap();
        let mapping = container.spec.port.unwrap();
        assert_eq!(mapping.external, port);
        assert_eq!(mapping.internal, 8080);
        assert!(container.spec.env.contains(&("PORT".to_string(), "8080".to_string())));
        assert_eq!(
            harness.orchestrator.deployments.endpoint_url(&deployment),
            Some(format!("http://127.0.0.1:{}", port))
        );
    }
}

#[tokio::test]
async fn test_exhausted_port_range_cancels_the_hiring() {
    let mut spec = test_spec();
    spec.runtime.external_port_range = PortRange { start: 21000, end: 21001 };
    let harness = Harness::with_spec(spec);
    harness.seed_agent("chatty", ExecutionModel::AcpServer, 1).await;

    harness.hire_running(5, "chatty").await;
    harness.hire_running(5, "chatty").await;

    let err = harness
        .orchestrator
        .hirings
        .create_hiring(
            &aghub_orchestrator_core::domain::identity::Caller::user(5),
            aghub_orchestrator_core::domain::hiring::NewHiring::new(
                UserId(5),
                aghub_orchestrator_core::domain::agent::AgentId::new("chatty"),
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::ResourceExhausted(_)));

    let hirings = harness.orchestrator.hirings.list_hirings(UserId(5)).await.unwrap();
    assert_eq!(hirings.len(), 3);
    let statuses: Vec<_> = hirings.iter().map(|h| h.status).collect();
    assert_eq!(statuses.iter().filter(|s| **s == HiringStatus::Cancelled).count(), 1);
}

#[tokio::test]
async fn test_stop_removes_the_container() {
    let harness = Harness::new();
    harness.seed_agent("stopper", ExecutionModel::Function, 1).await;
    let (_, deployment) = harness.hire_running(1, "stopper").await;

    let teardown = harness
        .orchestrator
        .deployments
        .stop_deployment(&deployment.id, None)
        .await
        .unwrap();
    assert!(teardown.fully_cleaned);
    assert_eq!(teardown.deployment.status, DeploymentStatus::Stopped);
    assert!(teardown.deployment.stopped_at.is_some());

    let status = harness.orchestrator.deployments.get_status(&deployment.id).await.unwrap();
    assert_eq!(status.status, DeploymentStatus::Stopped);
    assert!(harness.runtime.container(&deployment.container_name).is_none());
}

#[tokio::test]
async fn test_stop_reports_incomplete_cleanup_when_container_lingers() {
    let harness = Harness::new();
    harness.seed_agent("sticky", ExecutionModel::Function, 1).await;
    let (_, deployment) = harness.hire_running(1, "sticky").await;
    harness.runtime.keep_removed_containers();

    let teardown = harness
        .orchestrator
        .deployments
        .stop_deployment(&deployment.id, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(!teardown.fully_cleaned);
    assert_eq!(teardown.deployment.status, DeploymentStatus::Stopped);
}

#[tokio::test]
async fn test_stop_refused_by_runtime_keeps_status() {
    let harness = Harness::new();
    harness.seed_agent("stubborn", ExecutionModel::Function, 1).await;
    let (_, deployment) = harness.hire_running(1, "stubborn").await;
    harness.runtime.fail_stop_matching("hire_1-");

    let err = harness
        .orchestrator
        .deployments
        .stop_deployment(&deployment.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::RuntimeFailure(_)));

    let current = harness.orchestrator.deployments.get(&deployment.id).await.unwrap();
    assert_eq!(current.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn test_exited_container_is_reconciled_to_crashed() {
    let harness = Harness::new();
    harness.seed_agent("fragile", ExecutionModel::Function, 1).await;
    let (_, deployment) = harness.hire_running(1, "fragile").await;

    harness.runtime.crash(&deployment.container_name, 137);
    let status = harness.orchestrator.deployments.get_status(&deployment.id).await.unwrap();

    assert_eq!(status.status, DeploymentStatus::Crashed);
    assert!(status.error_message.unwrap().contains("137"));
    assert!(!status.logs.is_empty());
}

#[tokio::test]
async fn test_vanished_container_is_reconciled_to_crashed() {
    let harness = Harness::new();
    harness.seed_agent("ghost", ExecutionModel::Function, 1).await;
    let (_, deployment) = harness.hire_running(1, "ghost").await;

    harness.runtime.vanish(&deployment.container_name);
    let status = harness.orchestrator.deployments.get_status(&deployment.id).await.unwrap();
    assert_eq!(status.status, DeploymentStatus::Crashed);
}

#[tokio::test]
async fn test_build_failure_marks_failed_with_logs() {
    let harness = Harness::new();
    harness.seed_agent("broken", ExecutionModel::Function, 1).await;
    harness.runtime.fail_builds("pip install failed");

    let created = harness.hire(1, "broken").await;
    let deployment = harness
        .orchestrator
        .deployments
        .wait_for_deployment(&created.deployment.id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.error_message.unwrap().contains("pip install failed"));
    assert!(deployment.logs.iter().any(|l| l.contains("pip install failed")));
    assert!(harness.runtime.container(&deployment.container_name).is_none());
}

#[tokio::test]
async fn test_stop_during_build_wins_over_the_build() {
    let harness = Harness::new();
    harness.seed_agent("hasty", ExecutionModel::AcpServer, 1).await;
    harness.runtime.delay_builds(Duration::from_millis(300));

    let created = harness.hire(1, "hasty").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let teardown = harness
        .orchestrator
        .deployments
        .stop_deployment(&created.deployment.id, None)
        .await
        .unwrap();
    assert_eq!(teardown.deployment.status, DeploymentStatus::Stopped);
    assert!(!harness.orchestrator.deployments.workers().is_busy(&created.deployment.id));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = harness
        .orchestrator
        .deployments
        .get_status(&created.deployment.id)
        .await
        .unwrap();
    assert_eq!(status.status, DeploymentStatus::Stopped);
    assert!(!harness.runtime.is_running(&created.deployment.container_name));
    assert!(harness.runtime.container(&created.deployment.container_name).is_none());
}

#[tokio::test]
async fn test_cancel_during_build_leaves_nothing_running() {
    let harness = Harness::new();
    harness.seed_agent("fickle", ExecutionModel::Function, 1).await;
    harness.runtime.delay_builds(Duration::from_millis(300));

    let created = harness.hire(1, "fickle").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness
        .orchestrator
        .deployments
        .cancel_deployment(&created.deployment.id, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let current = harness
        .orchestrator
        .deployments
        .get(&created.deployment.id)
        .await
        .unwrap();
    assert_eq!(current.status, DeploymentStatus::Cancelled);
    assert!(current.container_id.is_none());
    assert!(harness.runtime.container(&created.deployment.container_name).is_none());
}

#[tokio::test]
async fn test_restart_brings_a_stopped_deployment_back() {
    let harness = Harness::new();
    harness.seed_agent("phoenix", ExecutionModel::AcpServer, 1).await;
    let (_, deployment) = harness.hire_running(1, "phoenix").await;

    let restarted = harness
        .orchestrator
        .deployments
        .restart_deployment(&deployment.id)
        .await
        .unwrap();
    assert_eq!(restarted.status, DeploymentStatus::Running);
    assert_eq!(restarted.id, deployment.id);
    assert_eq!(restarted.external_port, deployment.external_port);
    assert!(harness.runtime.is_running(&deployment.container_name));
}

#[tokio::test]
async fn test_cancel_removes_the_image() {
    let harness = Harness::new();
    harness.seed_agent("done", ExecutionModel::Function, 1).await;
    let (_, deployment) = harness.hire_running(1, "done").await;
    assert!(harness.runtime.images.lock().contains(&deployment.image_name));

    let teardown = harness
        .orchestrator
        .deployments
        .cancel_deployment(&deployment.id, None)
        .await
        .unwrap();
    assert_eq!(teardown.deployment.status, DeploymentStatus::Cancelled);
    assert!(!harness.runtime.images.lock().contains(&deployment.image_name));
}

#[tokio::test]
async fn test_health_only_changes_on_explicit_answers() {
    let harness = Harness::new();
    harness.seed_agent("pulse", ExecutionModel::AcpServer, 1).await;
    let (_, deployment) = harness.hire_running(1, "pulse").await;
    let manager = &harness.orchestrator.deployments;

    assert_eq!(manager.health_check(&deployment.id).await.unwrap(), Some(true));
    assert!(manager.get(&deployment.id).await.unwrap().is_healthy);

    harness.endpoint.set_health(HealthProbe::Unreachable("connection refused".to_string()));
    assert_eq!(manager.health_check(&deployment.id).await.unwrap(), None);
    assert!(manager.get(&deployment.id).await.unwrap().is_healthy);

    harness.endpoint.set_health(HealthProbe::Unhealthy { status: 503 });
    let status = manager.get_status(&deployment.id).await.unwrap();
    assert_eq!(status.status, DeploymentStatus::Running);
    assert!(!status.is_healthy);
    assert_eq!(status.health_check_failures, 1);
}

#[tokio::test]
async fn test_list_deployments_filters_by_user_and_status() {
    let harness = Harness::new();
    harness.seed_agent("lister", ExecutionModel::Function, 1).await;
    let (_, first) = harness.hire_running(1, "lister").await;
    harness.hire_running(2, "lister").await;
    harness
        .orchestrator
        .deployments
        .stop_deployment(&first.id, None)
        .await
        .unwrap();

    let manager = &harness.orchestrator.deployments;
    assert_eq!(manager.list_deployments(Some(UserId(1)), None).await.unwrap().len(), 1);
    assert_eq!(manager.list_deployments(None, None).await.unwrap().len(), 2);
    let running = manager
        .list_deployments(None, Some(DeploymentStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].user_id, UserId(2));
    assert!(manager
        .list_deployments(Some(UserId(1)), Some(DeploymentStatus::Running))
        .await
        .unwrap()
        .is_empty());
}
