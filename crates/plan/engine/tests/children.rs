//! CHILD and CHILDREN execution: branches that report to a parent.

mod common;

use common::*;
use plan_types::{ExecutionStatus, ExecutionUser, NodeExecutionStatus, Plan};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn with_parent(parent: Arc<Parent>) -> Harness {
    let mut registries = registries();
    registries.register_state("parent", parent).unwrap();
    harness(registries)
}

#[tokio::test]
async fn child_branch_notifies_parent() {
    let parent = Arc::new(Parent::default());
    let h = with_parent(parent.clone());

    let plan = Plan::new("p")
        .with_node(node("p", "parent", "CHILD").with_parameters(serde_json::json!({"child": "c"})))
        .unwrap()
        .with_node(sync_node("c", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    let p = records_for(&records, "p")[0];
    let c = records_for(&records, "c")[0];

    assert_eq!(c.parent_id.as_ref(), Some(&p.id));
    assert!(c.notify_id.as_deref().unwrap().starts_with("notify-"));
    assert!(c.previous_id.is_none());
    assert!(p.next_id.is_none());
    assert_eq!(c.ambiance.depth(), p.ambiance.depth() + 1);
    assert_eq!(c.ambiance.levels()[0], p.ambiance.levels()[0]);

    assert_eq!(parent.resumed.load(Ordering::SeqCst), 1);
    assert_eq!(p.status, NodeExecutionStatus::Succeeded);
    assert_eq!(p.mode, Some(plan_types::ExecutionMode::Child));

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn child_branch_never_finishes_plan() {
    // The child succeeds but the parent reports failure: the plan status
    // must come from the parent alone.
    let parent = Arc::new(Parent {
        fail_anyway: true,
        ..Parent::default()
    });
    let h = with_parent(parent.clone());

    let plan = Plan::new("p")
        .with_node(node("p", "parent", "CHILD").with_parameters(serde_json::json!({"child": "c"})))
        .unwrap()
        .with_node(sync_node("c", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records_for(&records, "c")[0].status, NodeExecutionStatus::Succeeded);
    assert_eq!(records_for(&records, "p")[0].status, NodeExecutionStatus::Failed);
    assert_eq!(parent.resumed.load(Ordering::SeqCst), 1);

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn children_all_succeed() {
    let parent = Arc::new(Parent::default());
    let h = with_parent(parent.clone());

    let plan = Plan::new("p")
        .with_node(
            node("p", "parent", "CHILDREN")
                .with_parameters(serde_json::json!({"children": ["c1", "c2", "c3"]}))
                .with_adviser(on_success("after")),
        )
        .unwrap()
        .with_node(sync_node("c1", "succeed"))
        .unwrap()
        .with_node(sync_node("c2", "succeed"))
        .unwrap()
        .with_node(sync_node("c3", "succeed"))
        .unwrap()
        .with_node(sync_node("after", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records.len(), 5);
    let p = records_for(&records, "p")[0];

    let children: Vec<_> = records.iter().filter(|r| r.parent_id.as_ref() == Some(&p.id)).collect();
    assert_eq!(children.len(), 3);
    let mut notify_ids: Vec<_> = children.iter().map(|c| c.notify_id.clone().unwrap()).collect();
    notify_ids.sort();
    notify_ids.dedup();
    assert_eq!(notify_ids.len(), 3);

    assert_eq!(parent.resumed.load(Ordering::SeqCst), 1);
    let after = records_for(&records, "after")[0];
    assert_eq!(after.previous_id.as_ref(), Some(&p.id));
    assert!(after.parent_id.is_none());

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn one_failed_child_fails_parent() {
    let parent = Arc::new(Parent::default());
    let h = with_parent(parent.clone());

    let plan = Plan::new("p")
        .with_node(node("p", "parent", "CHILDREN").with_parameters(serde_json::json!({"children": ["ok", "bad"]})))
        .unwrap()
        .with_node(sync_node("ok", "succeed"))
        .unwrap()
        .with_node(sync_node("bad", "fail"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    let p = records_for(&records, "p")[0];
    assert_eq!(p.status, NodeExecutionStatus::Failed);
    assert_eq!(p.failure_info.as_deref(), Some("a child branch failed"));
    assert_eq!(parent.resumed.load(Ordering::SeqCst), 1);

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn chain_inside_child_branch_keeps_linkage() {
    let parent = Arc::new(Parent::default());
    let h = with_parent(parent.clone());

    let plan = Plan::new("p")
        .with_node(node("p", "parent", "CHILD").with_parameters(serde_json::json!({"child": "c1"})))
        .unwrap()
        .with_node(sync_node("c1", "succeed").with_adviser(on_success("c2")))
        .unwrap()
        .with_node(sync_node("c2", "succeed"))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    let p = records_for(&records, "p")[0];
    let c1 = records_for(&records, "c1")[0];
    let c2 = records_for(&records, "c2")[0];

    assert_eq!(c1.next_id.as_ref(), Some(&c2.id));
    assert_eq!(c2.previous_id.as_ref(), Some(&c1.id));
    assert_eq!(c2.parent_id.as_ref(), Some(&p.id));
    assert_eq!(c2.notify_id, c1.notify_id);
    assert_eq!(c2.ambiance.depth(), c1.ambiance.depth());

    // The parent resumes only when the whole branch has ended
    assert_eq!(parent.resumed.load(Ordering::SeqCst), 1);
    assert!(p.end_ts.unwrap() >= c2.end_ts.unwrap());

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn unknown_child_node_fails_parent() {
    let parent = Arc::new(Parent::default());
    let h = with_parent(parent.clone());

    let plan = Plan::new("p")
        .with_node(node("p", "parent", "CHILD").with_parameters(serde_json::json!({"child": "missing"})))
        .unwrap();

    let execution = h.engine.start_execution(plan, ExecutionUser::system()).await.unwrap();
    h.engine.wait_idle().await;

    let records = h.engine.node_executions(&execution.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, NodeExecutionStatus::Failed);
    assert_eq!(parent.resumed.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.broker().pending_waits(), 0);

    let execution = h.engine.plan_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
}
