//! Quantified invariants over the fabric's state
//!
//! Property tests for the graph analyses over random DAGs, plus
//! state-machine invariants checked after realistic operation sequences
//! and the persistence round-trip.

use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use taskfabric::graph::DependencyGraph;
use taskfabric::store::{MemoryStore, NoopStore, StateStore};
use taskfabric::*;
use uuid::Uuid;

struct OkExecutor;

#[async_trait]
impl TaskExecutor for OkExecutor {
    async fn execute(
        &self,
        _task: &Task,
        _agent: &Agent,
        _ctx: &ExecutionContext,
    ) -> FabricResult<TaskResult> {
        Ok(TaskResult::ok(1))
    }
}

/// Build a random DAG: node indices are ordered, and every edge points
/// from a lower to a higher index, so the graph is acyclic by
/// construction.
fn arb_dag() -> impl Strategy<Value = (Vec<u64>, Vec<(usize, usize)>)> {
    (2usize..24).prop_flat_map(|n| {
        let efforts = proptest::collection::vec(1u64..10_000, n);
        let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|pairs| {
            pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| if a < b { (a, b) } else { (b, a) })
                .collect::<Vec<_>>()
        });
        (efforts, edges)
    })
}

fn build_graph(efforts: &[u64], edges: &[(usize, usize)]) -> (DependencyGraph, Vec<TaskId>) {
    let mut ids: Vec<TaskId> = (0..efforts.len()).map(|_| Uuid::new_v4()).collect();
    ids.sort();
    let mut graph = DependencyGraph::new();
    for (id, effort) in ids.iter().zip(efforts) {
        graph.add_node(*id, *effort);
    }
    for (from, to) in edges {
        // Duplicate edges are rejected; that is fine for the property.
        let _ = graph.add_dependency(ids[*to], ids[*from], EdgeStrength::Hard);
    }
    (graph, ids)
}

proptest! {
    #[test]
    fn topological_sort_is_a_linear_extension((efforts, edges) in arb_dag()) {
        let (graph, _ids) = build_graph(&efforts, &edges);
        let order = graph.topological_sort().unwrap();
        prop_assert_eq!(order.len(), graph.node_count());
        let pos: HashMap<TaskId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for edge in graph.edges() {
            prop_assert!(pos[&edge.from] < pos[&edge.to]);
        }
    }

    #[test]
    fn critical_path_identities_hold((efforts, edges) in arb_dag()) {
        let (graph, _ids) = build_graph(&efforts, &edges);
        let analysis = graph.critical_path().unwrap();

        // Project duration equals the max early finish.
        let max_ef = analysis
            .schedule
            .values()
            .map(|s| s.early_finish_ms)
            .max()
            .unwrap_or(0);
        prop_assert_eq!(analysis.project_duration_ms, max_ef);

        // Every critical node has ES == LS; every node satisfies ES <= LS.
        for (id, sched) in &analysis.schedule {
            prop_assert!(sched.early_start_ms <= sched.late_start_ms);
            if analysis.critical_nodes.contains(id) {
                prop_assert_eq!(sched.early_start_ms, sched.late_start_ms);
            } else {
                prop_assert!(sched.slack_ms > 0);
            }
        }
        // At least one node is critical in a non-empty graph.
        prop_assert!(!analysis.critical_nodes.is_empty());
    }

    #[test]
    fn parallel_groups_respect_levels((efforts, edges) in arb_dag()) {
        let (graph, _ids) = build_graph(&efforts, &edges);
        let groups = graph.parallel_groups().unwrap();

        let mut level: HashMap<TaskId, usize> = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            for id in group {
                level.insert(*id, i);
            }
        }
        // Everything is placed, and every hard edge crosses levels upward.
        prop_assert_eq!(level.len(), graph.node_count());
        for edge in graph.edges() {
            prop_assert!(level[&edge.from] < level[&edge.to]);
        }
        // No group may contain two hard-ordered tasks.
        for group in &groups {
            let members: HashSet<&TaskId> = group.iter().collect();
            for id in group {
                for dependent in graph.transitive_dependents(id) {
                    prop_assert!(!members.contains(&dependent));
                }
            }
        }
    }
}

async fn assert_assignment_invariants(fabric: &TaskFabric) {
    let tasks = fabric.scheduler().list_tasks().await;
    let agents = fabric.registry().list().await;
    let agent_index: HashMap<&str, &Agent> =
        agents.iter().map(|a| (a.id.as_str(), a)).collect();

    for task in &tasks {
        if matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            let agent_id = task
                .assigned_agent
                .as_deref()
                .unwrap_or_else(|| panic!("task {} holds no agent", task.id));
            let agent = agent_index[agent_id];
            assert!(
                agent.current_tasks.contains(&task.id),
                "agent {agent_id} does not track task {}",
                task.id
            );
        } else {
            assert!(task.assigned_agent.is_none(), "task {} leaks an agent", task.id);
        }
    }
    for agent in &agents {
        assert!(agent.current_tasks.len() <= agent.max_concurrent_tasks);
        for task_id in &agent.current_tasks {
            let task = tasks.iter().find(|t| t.id == *task_id).unwrap();
            assert_eq!(task.assigned_agent.as_deref(), Some(agent.id.as_str()));
        }
    }
}

#[tokio::test]
async fn assignment_invariants_hold_through_a_lifecycle() {
    let fabric = TaskFabric::new(
        FabricConfig::default(),
        Arc::new(OkExecutor),
        Arc::new(NoopStore),
    )
    .unwrap();
    fabric
        .register_agent(RegisterAgentRequest {
            id: "a1".to_string(),
            capabilities: Vec::new(),
            max_concurrent_tasks: Some(2),
        })
        .await
        .unwrap();

    let a = fabric
        .create_task(CreateTaskRequest {
            title: "a".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let b = fabric
        .create_task(CreateTaskRequest {
            title: "b".to_string(),
            dependencies: vec![a],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_assignment_invariants(&fabric).await;

    // Claim and start A by hand.
    let scheduler = fabric.scheduler();
    let registry = fabric.registry();
    let claimed = scheduler
        .claim_task(&a, &"a1".to_string())
        .await
        .unwrap();
    registry.assign_task(&"a1".to_string(), claimed.id).await.unwrap();
    assert_assignment_invariants(&fabric).await;

    scheduler.mark_started(&a).await.unwrap();
    assert_assignment_invariants(&fabric).await;

    // B is gated by the hard edge the whole time A is unfinished.
    assert!(scheduler.get_next_task(None).await.is_none());
    let b_task = fabric.get_task(&b).await.unwrap();
    assert_eq!(b_task.status, TaskStatus::Queued);

    scheduler
        .update_task_result(&a, &TaskResult::ok(5))
        .await
        .unwrap();
    registry
        .record_completion(&"a1".to_string(), &a, true, 5)
        .await
        .unwrap();
    assert_assignment_invariants(&fabric).await;

    // Now B is the selection head.
    assert_eq!(scheduler.get_next_task(None).await.unwrap().id, b);
}

#[tokio::test]
async fn snapshot_restore_round_trips_identically() {
    let store = Arc::new(MemoryStore::new());
    let fabric = TaskFabric::new(
        FabricConfig::default(),
        Arc::new(OkExecutor),
        store.clone(),
    )
    .unwrap();

    fabric
        .register_agent(RegisterAgentRequest {
            id: "a1".to_string(),
            capabilities: vec!["rust".to_string()],
            max_concurrent_tasks: Some(2),
        })
        .await
        .unwrap();
    let a = fabric
        .create_task(CreateTaskRequest {
            title: "a".to_string(),
            estimated_effort_ms: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    fabric
        .create_task(CreateTaskRequest {
            title: "b".to_string(),
            estimated_effort_ms: 20,
            dependencies: vec![a],
            ..Default::default()
        })
        .await
        .unwrap();
    for _ in 0..5 {
        fabric.balancer().record_failure(&"a1".to_string()).await;
    }
    fabric.write_snapshot().await.unwrap();

    // A post-snapshot change lands in the write-ahead log.
    fabric
        .register_agent(RegisterAgentRequest {
            id: "a2".to_string(),
            capabilities: vec!["go".to_string()],
            max_concurrent_tasks: Some(1),
        })
        .await
        .unwrap();

    let restored = TaskFabric::restore(
        FabricConfig::default(),
        Arc::new(OkExecutor),
        store.clone(),
    )
    .await
    .unwrap();

    // Tasks, agents, edges and breakers all match.
    let mut original_tasks = fabric.scheduler().list_tasks().await;
    let mut restored_tasks = restored.scheduler().list_tasks().await;
    original_tasks.sort_by_key(|t| t.id);
    restored_tasks.sort_by_key(|t| t.id);
    assert_eq!(
        serde_json::to_value(&original_tasks).unwrap(),
        serde_json::to_value(&restored_tasks).unwrap()
    );

    let mut original_agents = fabric.registry().list().await;
    let mut restored_agents = restored.registry().list().await;
    original_agents.sort_by(|x, y| x.id.cmp(&y.id));
    restored_agents.sort_by(|x, y| x.id.cmp(&y.id));
    assert_eq!(
        serde_json::to_value(&original_agents).unwrap(),
        serde_json::to_value(&restored_agents).unwrap()
    );

    let original_graph = fabric.scheduler().graph_snapshot().await;
    let restored_graph = restored.scheduler().graph_snapshot().await;
    let sort_edges = |graph: &DependencyGraph| {
        let mut edges = graph.edges();
        edges.sort_by_key(|e| (e.from, e.to));
        edges
    };
    assert_eq!(sort_edges(&original_graph), sort_edges(&restored_graph));

    let breaker = restored
        .balancer()
        .breaker(&"a1".to_string())
        .await
        .unwrap();
    assert_eq!(breaker.state, BreakerState::Open);
    assert_eq!(breaker.consecutive_failures, 5);

    // The restored scheduler behaves identically: A before B.
    assert_eq!(restored.scheduler().get_next_task(None).await.unwrap().id, a);
}

#[tokio::test]
async fn unblocked_dependents_strictly_decrease_on_completion() {
    let config = FabricConfig {
        scheduler: SchedulerConfig {
            cascade_policy: CascadePolicy::UnblockAsBlocked,
            ..Default::default()
        },
        ..Default::default()
    };
    let fabric = TaskFabric::new(config, Arc::new(OkExecutor), Arc::new(NoopStore)).unwrap();

    let a = fabric
        .create_task(CreateTaskRequest {
            title: "a".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let helper = fabric
        .create_task(CreateTaskRequest {
            title: "helper".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut dependents = Vec::new();
    for i in 0..3 {
        let id = fabric
            .create_task(CreateTaskRequest {
                title: format!("dep-{i}"),
                dependencies: vec![a, helper],
                ..Default::default()
            })
            .await
            .unwrap();
        dependents.push(id);
    }
    // Cancelling the helper parks all dependents as Blocked.
    fabric.cancel(&helper, "superseded").await.unwrap();
    let blocked_before = fabric.get_system_status().await;
    assert_eq!(
        blocked_before.tasks.by_status.get("blocked").copied().unwrap_or(0),
        3
    );

    // Completing A re-queues them.
    let scheduler = fabric.scheduler();
    scheduler.claim_task(&a, &"a1".to_string()).await.unwrap();
    scheduler.mark_started(&a).await.unwrap();
    scheduler
        .update_task_result(&a, &TaskResult::ok(1))
        .await
        .unwrap();

    let after = fabric.get_system_status().await;
    assert_eq!(after.tasks.by_status.get("blocked").copied().unwrap_or(0), 0);
    for id in dependents {
        assert_eq!(
            fabric.get_task(&id).await.unwrap().status,
            TaskStatus::Queued
        );
    }
}

#[tokio::test]
async fn wal_records_survive_serde() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let mut task = Task::new("t", TaskCategory::Security, Priority::Critical, now);
    task.metadata.insert(
        "trace".to_string(),
        MetadataValue::List(vec![
            MetadataValue::String("span-1".to_string()),
            MetadataValue::Number(7.5),
        ]),
    );
    store
        .append(WalRecord::TaskUpserted {
            task: Box::new(task.clone()),
        })
        .await
        .unwrap();
    let (_, log) = store.load().await.unwrap().unwrap();
    match &log[0] {
        WalRecord::TaskUpserted { task: loaded } => {
            assert_eq!(loaded.id, task.id);
            assert_eq!(loaded.metadata, task.metadata);
        }
        other => panic!("unexpected record {other:?}"),
    }
}
