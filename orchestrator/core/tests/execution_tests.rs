// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use serde_json::json;
use std::time::Duration;

use aghub_orchestrator_core::domain::agent::{AgentIoSchema, ExecutionModel};
use aghub_orchestrator_core::domain::deployment::DeploymentStatus;
use aghub_orchestrator_core::domain::error::OrchestrationError;
use aghub_orchestrator_core::domain::execution::{ExecutionStatus, ExecutionType};
use aghub_orchestrator_core::domain::hiring::{HiringStatus, UserId};
use aghub_orchestrator_core::domain::identity::Caller;
use aghub_orchestrator_core::domain::runtime::ExecOutput;
use aghub_orchestrator_core::infrastructure::build_context::FUNCTION_RUNNER_PATH;

use common::{ChatReply, Harness};

#[tokio::test]
async fn test_function_execution_completes_with_runner_output() {
    let harness = Harness::new();
    harness.seed_agent("adder", ExecutionModel::Function, 1).await;
    let (created, deployment) = harness.hire_running(1, "adder").await;
    let service = &harness.orchestrator.executions;

    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.execution_type, ExecutionType::Run);

    let result = service.execute(execution.id).await.unwrap();
    assert_eq!(result.execution.status, ExecutionStatus::Completed);
    assert_eq!(result.execution.output, Some(json!({"echo": {"x": 1}})));
    assert!(result.execution.duration_ms.is_some());
    assert!(result.execution.completed_at.is_some());
    assert_eq!(result.usage.execution_id, execution.id);
    assert_eq!(result.usage.operation_count, 0);

    let execs = harness.runtime.execs.lock();
    assert_eq!(execs.len(), 1);
    let (container, cmd) = &execs[0];
    assert_eq!(container, &deployment.container_name);
    assert_eq!(cmd[0], "python");
    assert_eq!(cmd[1], FUNCTION_RUNNER_PATH);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&cmd[2]).unwrap(), json!({"x": 1}));
    let context: serde_json::Value = serde_json::from_str(&cmd[3]).unwrap();
    assert_eq!(context["execution_type"], "run");
    assert_eq!(context["hiring_id"], created.hiring.id.0);
}

#[tokio::test]
async fn test_background_execution_is_observable_through_wait() {
    let harness = Harness::new();
    harness.seed_agent("bg", ExecutionModel::Function, 1).await;
    let (created, _) = harness.hire_running(1, "bg").await;
    let service = &harness.orchestrator.executions;

    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"x": 2}))
        .await
        .unwrap();
    let started = service.run_execution(execution.id).await.unwrap();
    assert_eq!(started.status, ExecutionStatus::Running);

    let finished = service
        .wait_for_execution(execution.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert!(finished.usage.is_some());
    assert_eq!(service.in_flight_count(), 0);
}

#[tokio::test]
async fn test_execution_without_deployment_fails() {
    let harness = Harness::new();
    harness.seed_agent("nobuild", ExecutionModel::Function, 1).await;
    harness.runtime.fail_builds("syntax error");
    let created = harness.hire(1, "nobuild").await;
    let deployment = harness
        .orchestrator
        .deployments
        .wait_for_deployment(&created.deployment.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);

    let service = &harness.orchestrator.executions;
    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap();
    let result = service.execute(execution.id).await.unwrap();

    assert_eq!(result.execution.status, ExecutionStatus::Failed);
    assert_eq!(
        result.execution.error_message.as_deref(),
        Some(format!("no deployment found for hiring {}", created.hiring.id).as_str())
    );
    assert!(harness.runtime.execs.lock().is_empty());
}

#[tokio::test]
async fn test_non_zero_exit_fails_with_logs() {
    let harness = Harness::new();
    harness.seed_agent("crashy", ExecutionModel::Function, 1).await;
    let (created, _) = harness.hire_running(1, "crashy").await;
    harness.runtime.reply_to_exec(ExecOutput {
        exit_code: 1,
        stdout: "partial".to_string(),
        stderr: "ZeroDivisionError: division by zero".to_string(),
    });

    let service = &harness.orchestrator.executions;
    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap();
    let result = service.execute(execution.id).await.unwrap();

    assert_eq!(result.execution.status, ExecutionStatus::Failed);
    assert!(result.execution.error_message.unwrap().contains("exited with code 1"));
    assert!(result.execution.logs.iter().any(|l| l.contains("ZeroDivisionError")));
}

#[tokio::test]
async fn test_scalar_output_is_wrapped_and_reported_usage_recorded() {
    let harness = Harness::new();
    harness.seed_agent("meter", ExecutionModel::Function, 1).await;
    let (created, _) = harness.hire_running(1, "meter").await;
    harness.runtime.reply_to_exec(ExecOutput {
        exit_code: 0,
        stdout: "__AGHUB_RESULT__{\"answer\": 42, \"usage\": {\"input_tokens\": 10, \"output_tokens\": 5, \"cost\": 0.02}}".to_string(),
        stderr: String::new(),
    });

    let service = &harness.orchestrator.executions;
    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap();
    let result = service.execute(execution.id).await.unwrap();

    assert_eq!(result.execution.status, ExecutionStatus::Completed);
    assert_eq!(result.usage.input_tokens, 10);
    assert_eq!(result.usage.output_tokens, 5);
    assert_eq!(result.usage.operation_count, 1);
    assert!((result.usage.total_cost - 0.02).abs() < 1e-9);

    harness.runtime.reply_to_exec(ExecOutput {
        exit_code: 0,
        stdout: "just text".to_string(),
        stderr: String::new(),
    });
    let second = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap();
    let output = service.execute(second.id).await.unwrap().execution.output.unwrap();
    assert_eq!(output["output"], "just text");
    assert_eq!(output["status"], "success");
    assert!(output["execution_time"].is_number());
}

#[tokio::test]
async fn test_acp_execution_goes_through_chat() {
    let harness = Harness::new();
    harness.seed_agent("talker", ExecutionModel::AcpServer, 1).await;
    let (created, deployment) = harness.hire_running(1, "talker").await;
    let service = &harness.orchestrator.executions;

    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"message": "hello"}))
        .await
        .unwrap();
    let result = service.execute(execution.id).await.unwrap();

    assert_eq!(result.execution.status, ExecutionStatus::Completed);
    assert_eq!(result.execution.output, Some(json!({"response": "echo: hello"})));

    let requests = harness.endpoint.requests.lock();
    let (url, request) = &requests[0];
    assert_eq!(url, &format!("http://127.0.0.1:{}", deployment.external_port.unwrap()));
    assert_eq!(request.message, "hello");
    assert_eq!(request.session_id, format!("hiring-{}", created.hiring.id));
    assert_eq!(request.context["execution_type"], "run");
}

#[tokio::test]
async fn test_persistent_initialize_and_run_share_the_hiring_session() {
    let harness = Harness::new();
    harness.seed_agent("keeper", ExecutionModel::Persistent, 1).await;
    let (created, deployment) = harness.hire_running(1, "keeper").await;
    let service = &harness.orchestrator.executions;

    let init = service
        .create_execution(&Caller::user(1), created.hiring.id, "initialize", json!({"workspace": "docs"}))
        .await
        .unwrap();
    let result = service.execute(init.id).await.unwrap();
    assert_eq!(result.execution.status, ExecutionStatus::Completed);
    assert_eq!(result.execution.execution_type, ExecutionType::Initialize);

    harness.endpoint.set_reply(ChatReply::Json(json!({"response": "indexed", "status": "success"})));
    let run = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"message": "summarise"}))
        .await
        .unwrap();
    let result = service.execute(run.id).await.unwrap();
    assert_eq!(result.execution.status, ExecutionStatus::Completed);
    assert_eq!(result.execution.output.unwrap()["response"], "indexed");

    // Persistent agents never go through the function runner.
    assert!(harness.runtime.execs.lock().is_empty());
    let requests = harness.endpoint.requests.lock();
    assert_eq!(requests.len(), 2);
    let base_url = format!("http://127.0.0.1:{}", deployment.external_port.unwrap());
    let (url, first) = &requests[0];
    assert_eq!(url, &base_url);
    assert_eq!(first.context["execution_type"], "initialize");
    assert_eq!(first.context["input"], json!({"workspace": "docs"}));
    assert_eq!(first.message, r#"{"workspace":"docs"}"#);
    let (_, second) = &requests[1];
    assert_eq!(second.context["execution_type"], "run");
    assert_eq!(second.message, "summarise");
    assert_eq!(first.session_id, second.session_id);
    assert_eq!(second.session_id, format!("hiring-{}", created.hiring.id));
}

#[tokio::test]
async fn test_chat_timeout_and_error_statuses() {
    let harness = Harness::new();
    harness.seed_agent("slow", ExecutionModel::Persistent, 1).await;
    let (created, _) = harness.hire_running(1, "slow").await;
    let service = &harness.orchestrator.executions;

    harness.endpoint.set_reply(ChatReply::Timeout);
    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"message": "hi"}))
        .await
        .unwrap();
    let result = service.execute(execution.id).await.unwrap();
    assert_eq!(result.execution.status, ExecutionStatus::Timeout);

    harness.endpoint.set_reply(ChatReply::Status(500));
    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"message": "hi"}))
        .await
        .unwrap();
    let result = service.execute(execution.id).await.unwrap();
    assert_eq!(result.execution.status, ExecutionStatus::Failed);
    assert!(result.execution.error_message.unwrap().contains("500"));
}

#[tokio::test]
async fn test_cancel_pending_execution() {
    let harness = Harness::new();
    harness.seed_agent("idle", ExecutionModel::Function, 1).await;
    let (created, _) = harness.hire_running(1, "idle").await;
    let service = &harness.orchestrator.executions;

    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap();
    let cancelled = service.cancel_execution(&Caller::user(1), execution.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    // Already terminal: returned unchanged, and it can no longer start.
    let again = service.cancel_execution(&Caller::user(1), execution.id).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Cancelled);
    assert!(service.execute(execution.id).await.is_err());
    assert!(harness.runtime.execs.lock().is_empty());
}

#[tokio::test]
async fn test_cancel_running_execution_drops_the_result() {
    let harness = Harness::new();
    harness.seed_agent("sleepy", ExecutionModel::Function, 1).await;
    let (created, _) = harness.hire_running(1, "sleepy").await;
    harness.runtime.delay_exec(Duration::from_millis(500));
    let service = &harness.orchestrator.executions;

    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap();
    service.run_execution(execution.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled = service.cancel_execution(&Caller::user(1), execution.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(700)).await;
    let stored = service.get_execution(&Caller::user(1), execution.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert!(stored.output.is_none());
}

#[tokio::test]
async fn test_suspended_hiring_accepts_only_cleanup() {
    let harness = Harness::new();
    harness.seed_agent("paused", ExecutionModel::Function, 1).await;
    let (created, _) = harness.hire_running(1, "paused").await;
    harness
        .orchestrator
        .hirings
        .update_hiring_status(&Caller::user(1), created.hiring.id, HiringStatus::Suspended, None)
        .await
        .unwrap();
    let service = &harness.orchestrator.executions;

    let err = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation(_)));

    let cleanup = service
        .create_execution(&Caller::user(1), created.hiring.id, "cleanup", json!({}))
        .await
        .unwrap();
    assert_eq!(cleanup.execution_type, ExecutionType::Cleanup);
}

#[tokio::test]
async fn test_create_execution_checks() {
    let harness = Harness::new();
    let mut agent = harness.seed_agent("strict", ExecutionModel::Function, 1).await;
    agent.io_schema = AgentIoSchema {
        input: Some(json!({
            "type": "object",
            "required": ["x"],
            "properties": {"x": {"type": "number"}}
        })),
        output: None,
    };
    harness.orchestrator.repositories.agents.save(&agent).await.unwrap();
    let (created, _) = harness.hire_running(1, "strict").await;
    let service = &harness.orchestrator.executions;

    let err = service
        .create_execution(&Caller::user(1), created.hiring.id, "explode", json!({"x": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation(_)));

    let err = service
        .create_execution(&Caller::user(2), created.hiring.id, "run", json!({"x": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Unauthorized(_)));

    let err = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"x": "one"}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation(_)));

    let err = service
        .create_execution(
            &Caller::user(1),
            aghub_orchestrator_core::domain::hiring::HiringId(999),
            "run",
            json!({"x": 1}),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    assert!(service.list_executions(created.hiring.id).await.unwrap().is_empty());

    let accepted = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({"x": 3}))
        .await
        .unwrap();
    assert_eq!(accepted.user_id, UserId(1));
}

#[tokio::test]
async fn test_other_users_cannot_read_executions() {
    let harness = Harness::new();
    harness.seed_agent("private", ExecutionModel::Function, 1).await;
    let (created, _) = harness.hire_running(1, "private").await;
    let service = &harness.orchestrator.executions;
    let execution = service
        .create_execution(&Caller::user(1), created.hiring.id, "run", json!({}))
        .await
        .unwrap();

    let err = service.get_execution(&Caller::user(2), execution.id).await.unwrap_err();
    assert!(err.is_not_found());
    let err = service.cancel_execution(&Caller::user(2), execution.id).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::Unauthorized(_)));
}
