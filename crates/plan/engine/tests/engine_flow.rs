//! End-to-end flows through the engine with synchronous behaviors.

mod common;

use common::*;
use plan_engine::level::PrefixedLevel;
use plan_engine::EngineError;
use plan_types::{
    AdviserObtainment, ExecutionMode, ExecutionStatus, ExecutionUser, FacilitatorObtainment,
    NodeExecutionStatus, Plan, PlanError, RefObject, RefType,
};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Single node and chains
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_sync_node_succeeds() {
    let h = harness(registries());
    let plan = Plan::new("only").with_node(sync_node("only", "succeed")).unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert!(execution.end_ts.is_some());

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, NodeExecutionStatus::Succeeded);
    assert_eq!(record.mode, Some(ExecutionMode::Sync));
    assert!(record.previous_id.is_none());
    assert!(record.next_id.is_none());
    assert!(record.end_ts.is_some());
    assert_eq!(record.ambiance.current_runtime_id(), Some(&record.id));
    assert_eq!(
        h.store.status_history(&record.id),
        vec![
            NodeExecutionStatus::Queued,
            NodeExecutionStatus::Running,
            NodeExecutionStatus::Succeeded
        ]
    );
}

#[tokio::test]
async fn two_node_chain_links_both_ways() {
    let h = harness(registries());
    let plan = Plan::new("a")
        .with_node(sync_node("a", "succeed").with_adviser(on_success("b")))
        .unwrap()
        .with_node(sync_node("b", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records.len(), 2);
    let a = records_for(&records, "a")[0];
    let b = records_for(&records, "b")[0];

    assert_eq!(a.next_id.as_ref(), Some(&b.id));
    assert_eq!(b.previous_id.as_ref(), Some(&a.id));
    assert!(a.previous_id.is_none());
    assert!(b.next_id.is_none());

    // The continuation replaces the level rather than nesting under it
    assert_eq!(a.ambiance.depth(), 1);
    assert_eq!(b.ambiance.depth(), 1);

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn plan_finishes_only_after_last_node() {
    let mut registries = registries();
    let external = Arc::new(External::default());
    registries.register_state("external", external.clone()).unwrap();
    let h = harness(registries);

    let plan = Plan::new("a")
        .with_node(sync_node("a", "succeed").with_adviser(on_success("b")))
        .unwrap()
        .with_node(
            node("b", "external", "ASYNC").with_parameters(serde_json::json!({"tasks": ["deploy-1"]})),
        )
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let running = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(running.status, ExecutionStatus::Running);

    h.engine
        .broker()
        .done_with("deploy-1", plan_types::ResponseData::payload(serde_json::json!("ok")));
    h.engine.wait_idle().await;

    let done = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(done.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn chain_with_retries_walks_back_to_one_root() {
    let mut registries = registries();
    registries.register_state("flaky", Arc::new(Flaky::new(2))).unwrap();
    let h = harness(registries);

    let plan = Plan::new("build")
        .with_node(sync_node("build", "succeed").with_adviser(on_success("test")))
        .unwrap()
        .with_node(
            sync_node("test", "flaky")
                .with_adviser(
                    AdviserObtainment::new("RETRY")
                        .with_parameters(serde_json::json!({"retry_count": 3, "wait_intervals": [0]})),
                )
                .with_adviser(on_success("ship")),
        )
        .unwrap()
        .with_node(sync_node("ship", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records.len(), 5);

    let attempts = records_for(&records, "test");
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].status, NodeExecutionStatus::Failed);
    assert_eq!(attempts[1].status, NodeExecutionStatus::Failed);
    assert_eq!(attempts[2].status, NodeExecutionStatus::Succeeded);
    assert_eq!(attempts[2].retry_ids, vec![attempts[0].id.clone(), attempts[1].id.clone()]);
    assert_eq!(attempts[0].node.id, attempts[2].node.id);
    assert_ne!(attempts[0].id, attempts[2].id);

    let ship = records_for(&records, "ship")[0];
    let chain = chain_back(&records, &ship.id);
    assert_eq!(chain.len(), 5);
    assert_eq!(records.iter().filter(|r| r.previous_id.is_none()).count(), 1);

    // next pointers are the exact reverse of the previous pointers
    for pair in chain.windows(2) {
        let earlier = records.iter().find(|r| r.id == pair[0]).unwrap();
        assert_eq!(earlier.next_id.as_ref(), Some(&pair[1]));
    }

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_node_without_advisers_fails_plan() {
    let h = harness(registries());
    let plan = Plan::new("a")
        .with_node(sync_node("a", "fail").with_parameters(serde_json::json!({"reason": "exit 2"})))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records[0].status, NodeExecutionStatus::Failed);
    assert_eq!(records[0].failure_info.as_deref(), Some("exit 2"));

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn on_fail_routes_to_rollback() {
    let h = harness(registries());
    let plan = Plan::new("deploy")
        .with_node(
            sync_node("deploy", "fail")
                .with_adviser(on_success("verify"))
                .with_adviser(on_fail("rollback")),
        )
        .unwrap()
        .with_node(sync_node("verify", "succeed"))
        .unwrap()
        .with_node(sync_node("rollback", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records_for(&records, "verify").is_empty());
    assert_eq!(records_for(&records, "rollback")[0].status, NodeExecutionStatus::Succeeded);

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn fail_adviser_fails_branch_with_reason() {
    let h = harness(registries());
    let plan = Plan::new("a")
        .with_node(
            sync_node("a", "fail").with_adviser(
                AdviserObtainment::new("FAIL").with_parameters(serde_json::json!({"reason": "gate closed"})),
            ),
        )
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn retries_exhausted_fail_plan() {
    let mut registries = registries();
    let flaky = Arc::new(Flaky::new(10));
    registries.register_state("flaky", flaky.clone()).unwrap();
    let h = harness(registries);

    let plan = Plan::new("a")
        .with_node(sync_node("a", "flaky").with_adviser(
            AdviserObtainment::new("RETRY").with_parameters(serde_json::json!({"retry_count": 2})),
        ))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    assert_eq!(flaky.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn missing_starting_node_persists_nothing() {
    let h = harness(registries());
    let plan = Plan::new("ghost").with_node(sync_node("a", "succeed")).unwrap();

    let result = h.engine.start_execution(plan, ExecutionUser::system()).await;
    assert!(matches!(
        result,
        Err(EngineError::Plan(PlanError::NoStartingNode(_)))
    ));
    assert_eq!(h.store.plan_execution_count(), 0);
    assert_eq!(h.store.node_execution_count(), 0);
}

#[tokio::test]
async fn no_facilitator_response_fails_without_invoking() {
    let mut registries = registries();
    let silent = Arc::new(Counting::new(None));
    registries.register_facilitator("SILENT", silent.clone()).unwrap();
    let flaky = Arc::new(Flaky::new(0));
    registries.register_state("counted", flaky.clone()).unwrap();
    let h = harness(registries);

    let plan = Plan::new("a")
        .with_node(
            plan_types::ExecutionNode::new("a", "a", "counted")
                .with_facilitator(FacilitatorObtainment::new("SILENT")),
        )
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    assert_eq!(silent.calls(), 1);
    assert_eq!(flaky.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records[0].status, NodeExecutionStatus::Failed);
    let info = records[0].failure_info.clone().unwrap();
    assert!(info.contains("No facilitator responded"), "{}", info);
    assert!(info.contains("SILENT"), "{}", info);

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn first_responding_facilitator_wins() {
    let mut registries = registries();
    let first = Arc::new(Counting::new(None));
    let second = Arc::new(Counting::new(Some(ExecutionMode::Sync)));
    let third = Arc::new(Counting::new(Some(ExecutionMode::Async)));
    registries.register_facilitator("FIRST", first.clone()).unwrap();
    registries.register_facilitator("SECOND", second.clone()).unwrap();
    registries.register_facilitator("THIRD", third.clone()).unwrap();
    let h = harness(registries);

    let plan = Plan::new("a")
        .with_node(
            plan_types::ExecutionNode::new("a", "a", "succeed")
                .with_facilitator(FacilitatorObtainment::new("FIRST"))
                .with_facilitator(FacilitatorObtainment::new("SECOND"))
                .with_facilitator(FacilitatorObtainment::new("THIRD")),
        )
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
    assert_eq!(third.calls(), 0);

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records[0].mode, Some(ExecutionMode::Sync));
    assert_eq!(records[0].status, NodeExecutionStatus::Succeeded);
}

#[tokio::test]
async fn unknown_state_type_fails_node() {
    let h = harness(registries());
    let plan = Plan::new("a").with_node(sync_node("a", "no-such-state")).unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records[0].status, NodeExecutionStatus::Failed);
    assert!(records[0].failure_info.as_deref().unwrap().contains("no-such-state"));
}

#[tokio::test]
async fn panicking_state_fails_node_and_plan() {
    let h = harness(registries());
    let plan = Plan::new("a").with_node(sync_node("a", "panic")).unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records[0].status, NodeExecutionStatus::Failed);
    assert!(records[0].failure_info.as_deref().unwrap().contains("state blew up"));

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn next_step_to_unknown_node_fails_plan() {
    let h = harness(registries());
    let plan = Plan::new("a")
        .with_node(sync_node("a", "succeed").with_adviser(on_success("nowhere")))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, NodeExecutionStatus::Succeeded);
    let info = records[0].failure_info.as_deref().unwrap();
    assert!(info.starts_with("transition failed"), "{}", info);
    assert!(info.contains("nowhere"), "{}", info);

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

// ---------------------------------------------------------------------------
// Inputs, outcomes and levels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outcomes_feed_later_inputs() {
    let mut registries = registries();
    registries.register_state("needs-input", Arc::new(NeedsInput)).unwrap();
    let h = harness(registries);

    let plan = Plan::new("build")
        .with_node(
            sync_node("build", "succeed")
                .with_parameters(serde_json::json!({"outcome": {"artifact": "app:1.2"}}))
                .with_adviser(on_success("deploy")),
        )
        .unwrap()
        .with_node(
            sync_node("deploy", "needs-input")
                .with_parameters(serde_json::json!({"input": "image"}))
                .with_ref_object(RefObject::outcome("image", "artifact")),
        )
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    let build = records_for(&records, "build")[0];
    let deploy = records_for(&records, "deploy")[0];
    assert_eq!(build.outcomes["artifact"], "app:1.2");
    assert_eq!(deploy.status, NodeExecutionStatus::Succeeded);
    assert_eq!(deploy.outcomes["seen"], "app:1.2");
}

#[tokio::test]
async fn unresolved_input_fails_node() {
    let mut registries = registries();
    registries.register_state("needs-input", Arc::new(NeedsInput)).unwrap();
    let h = harness(registries);

    let plan = Plan::new("deploy")
        .with_node(
            sync_node("deploy", "needs-input")
                .with_parameters(serde_json::json!({"input": "image"}))
                .with_ref_object(RefObject::outcome("image", "never-published")),
        )
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records[0].status, NodeExecutionStatus::Failed);
    assert_eq!(records[0].failure_info.as_deref(), Some("Missing input: image"));
}

#[tokio::test]
async fn setup_abstractions_reach_every_hop() {
    let h = harness(registries());
    let plan = Plan::new("a")
        .with_setup_abstraction("account", "acme")
        .with_node(sync_node("a", "succeed").with_adviser(on_success("b")))
        .unwrap()
        .with_node(sync_node("b", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    for record in h.engine.node_executions(&execution.id).await.unwrap() {
        assert_eq!(record.ambiance.setup_abstraction("account"), Some("acme"));
        assert_eq!(record.ambiance.plan_execution_id(), &execution.id);
    }
}

#[tokio::test]
async fn level_type_shapes_ambiance_level() {
    let mut registries = registries();
    registries
        .register_level("STAGE", Arc::new(PrefixedLevel::new("stage")))
        .unwrap();
    let h = harness(registries);

    let plan = Plan::new("a")
        .with_node(sync_node("a", "succeed").with_identifier("deploy-prod").with_level("STAGE"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    let level = records[0].ambiance.current_level().unwrap();
    assert_eq!(level.identifier, "stage:deploy-prod");
    assert_eq!(level.level_type.as_ref().map(|l| l.0.as_str()), Some("STAGE"));
}

#[tokio::test]
async fn unknown_level_type_fails_start() {
    let h = harness(registries());
    let plan = Plan::new("a")
        .with_node(sync_node("a", "succeed").with_level("MISSING"))
        .unwrap();

    let result = h.engine.start_execution(plan, ExecutionUser::system()).await;
    assert!(matches!(
        result,
        Err(EngineError::UnknownType { kind: "level", .. })
    ));
}

#[tokio::test]
async fn inputs_resolve_once_per_hop() {
    let mut registries = registries();
    let counted = Arc::new(CountingResolver::default());
    registries.register_resolver("COUNTED", counted.clone()).unwrap();
    registries.register_state("needs-input", Arc::new(NeedsInput)).unwrap();
    let h = harness(registries);

    let plan = Plan::new("greet")
        .with_node(
            sync_node("greet", "needs-input")
                .with_parameters(serde_json::json!({"input": "who"}))
                .with_ref_object(RefObject::new("who", "alice", RefType::new("COUNTED"))),
        )
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let record = &h.engine.node_executions(&execution.id).await.unwrap()[0];
    assert_eq!(record.status, NodeExecutionStatus::Succeeded);
    assert_eq!(record.outcomes["seen"], "alice");
    assert_eq!(counted.resolves.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Parameter expressions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parameter_expressions_resolve_before_invocation() {
    let mut registries = registries();
    registries.register_state("echo", Arc::new(EchoParameters)).unwrap();
    let h = harness(registries);

    let declared = serde_json::json!({
        "image": "<+outcome.artifact>",
        "target": "<+input.env>-<+setup.account>",
        "replicas": "<+input.replicas>"
    });
    let plan = Plan::new("build")
        .with_setup_abstraction("account", "acme")
        .with_node(
            sync_node("build", "succeed")
                .with_parameters(serde_json::json!({"outcome": {"artifact": "app:1.2"}}))
                .with_adviser(on_success("deploy")),
        )
        .unwrap()
        .with_node(sync_node("deploy", "echo").with_parameters(declared.clone()))
        .unwrap();

    let inputs = BTreeMap::from([
        ("env".to_string(), serde_json::json!("prod")),
        ("replicas".to_string(), serde_json::json!(3)),
    ]);
    let execution = h
        .engine
        .start_execution_with_inputs(plan, ExecutionUser::system(), inputs.clone())
        .await
        .unwrap();
    h.engine.wait_idle().await;

    let expected = serde_json::json!({"image": "app:1.2", "target": "prod-acme", "replicas": 3});
    let records = h.engine.node_executions(&execution.id).await.unwrap();
    let deploy = records_for(&records, "deploy")[0];
    assert_eq!(deploy.status, NodeExecutionStatus::Succeeded);
    assert_eq!(deploy.resolved_state_parameters.as_ref(), Some(&expected));
    assert_eq!(deploy.state_parameters(), &expected);
    assert_eq!(deploy.node.state_parameters, declared);
    assert_eq!(deploy.outcomes["replicas"], 3);
    assert_eq!(deploy.outcomes["target"], "prod-acme");

    // Nodes without expressions keep their declared parameters
    assert!(records_for(&records, "build")[0].resolved_state_parameters.is_none());

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.inputs, inputs);
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn unresolved_expression_fails_node_before_invocation() {
    let mut registries = registries();
    registries.register_state("echo", Arc::new(EchoParameters)).unwrap();
    let h = harness(registries);

    let plan = Plan::new("deploy")
        .with_node(sync_node("deploy", "echo").with_parameters(serde_json::json!({"image": "<+outcome.missing>"})))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let record = &h.engine.node_executions(&execution.id).await.unwrap()[0];
    assert_eq!(record.status, NodeExecutionStatus::Failed);
    assert!(record.outcomes.is_empty());
    assert!(record.mode.is_none());
    let info = record.failure_info.as_deref().unwrap();
    assert!(info.contains("<+outcome.missing>"), "{}", info);
    assert_eq!(
        h.store.status_history(&record.id),
        vec![NodeExecutionStatus::Queued, NodeExecutionStatus::Failed]
    );

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

// ---------------------------------------------------------------------------
// Outcome lifetime
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finished_plans_release_their_outcomes() {
    let (registries, outcomes) = registries_with_outcomes();
    let h = harness(registries);

    for i in 0..5 {
        let last = if i % 2 == 0 { "succeed" } else { "fail" };
        let plan = Plan::new("build")
            .with_node(
                sync_node("build", "succeed")
                    .with_parameters(serde_json::json!({"outcome": {"artifact": i, "digest": "sha"}}))
                    .with_adviser(on_success("check")),
            )
            .unwrap()
            .with_node(sync_node("check", last))
            .unwrap();
        let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
        h.engine.wait_idle().await;

        let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
        assert!(execution.is_terminal());
    }

    assert!(outcomes.is_empty(), "{} outcomes left", outcomes.len());
}
