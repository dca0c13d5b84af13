//! File gateway provisioning against the simulated control plane

use gateflow_cloud::{
    ActionType, CloudError, Executor, ExecutorConfig, OutputProjector, SimulatedProvider,
    StateSnapshot, plan,
};
use gateflow_core::{
    FILE_GATEWAY, FlowError, ResourceDescriptor, ResourceGraph, ResourceKind, Topology,
    VariableSources, build_topology, builtin_variables, resolve_variables,
};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn topology(cidr: &str) -> Topology {
    let file = [
        ("region", "eu-west-1"),
        ("vpc_id", "vpc-0abc"),
        ("subnet_id", "subnet-0abc"),
        ("subnet_cidr", cidr),
        ("bucket_name", "uploads"),
        ("gateway_ami", "ami-0123"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), json!(v)))
    .collect();
    let sources = VariableSources {
        file,
        ..Default::default()
    };
    let vars = resolve_variables(&builtin_variables(FILE_GATEWAY).unwrap(), &sources).unwrap();
    build_topology(FILE_GATEWAY, &vars).unwrap()
}

async fn apply(
    provider: &Arc<SimulatedProvider>,
    graph: &ResourceGraph,
    state: StateSnapshot,
) -> StateSnapshot {
    let plan = plan(graph, &state, provider.as_ref()).unwrap();
    let outcome = Executor::new(provider.clone(), ExecutorConfig::default())
        .apply(graph, &plan, state, CancellationToken::new())
        .await;
    assert!(outcome.result.is_success(), "{:?}", outcome.result.failed);
    outcome.state
}

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle() {
    let provider = Arc::new(SimulatedProvider::new());
    let topology = topology("10.0.0.0/8");
    let graph = ResourceGraph::build(topology.resources.clone()).unwrap();

    let state = apply(&provider, &graph, StateSnapshot::new()).await;
    assert_eq!(state.resources.len(), 15);
    assert_eq!(provider.calls().create, 15);

    let projector = OutputProjector::new(&topology.outputs, &state);
    let ip = projector.get_string("gateway_ip").unwrap();
    assert_eq!(
        projector.get_string("mount_command").unwrap(),
        format!("sudo mount -t nfs -o nolock,hard {}:/uploads [MountPath]", ip)
    );

    // 変更なしの再適用は変更系の呼び出しをしない
    let mutating = provider.calls().mutating();
    let state = apply(&provider, &graph, state).await;
    assert_eq!(provider.calls().mutating(), mutating);

    let outcome = Executor::new(provider.clone(), ExecutorConfig::default())
        .destroy(state, CancellationToken::new())
        .await;
    assert!(outcome.result.is_success());
    assert!(outcome.state.is_empty());
    assert_eq!(provider.resource_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_create_order_respects_dependencies() {
    let provider = Arc::new(SimulatedProvider::new());
    let graph = ResourceGraph::build(topology("10.0.0.0/8").resources).unwrap();
    apply(&provider, &graph, StateSnapshot::new()).await;

    let created: Vec<String> = provider
        .log()
        .iter()
        .filter_map(|l| l.strip_prefix("create:").map(str::to_string))
        .collect();
    let pos = |name: &str| created.iter().position(|n| n == name).unwrap();
    for name in graph.topological_order() {
        for dep in graph.dependencies_of(name) {
            assert!(pos(&dep) < pos(name), "{dep} must be created before {name}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_client_range_change_updates_in_place() {
    let provider = Arc::new(SimulatedProvider::new());
    let graph = ResourceGraph::build(topology("10.0.0.0/8").resources).unwrap();
    let state = apply(&provider, &graph, StateSnapshot::new()).await;
    let share_id = state.get("file_share").unwrap().id.clone();

    let changed = ResourceGraph::build(topology("172.16.0.0/12").resources).unwrap();
    let plan = plan(&changed, &state, provider.as_ref()).unwrap();
    let updates: Vec<&str> = plan
        .actions_by_type(ActionType::Update)
        .iter()
        .map(|a| a.resource.as_str())
        .collect();
    assert_eq!(updates, vec!["gateway_sg", "file_share"]);
    assert!(plan.actions_by_type(ActionType::Replace).is_empty());

    let state = apply(&provider, &changed, state).await;
    assert_eq!(state.get("file_share").unwrap().id, share_id);
    assert_eq!(
        state.get("file_share").unwrap().attributes["client_list"],
        json!(["172.16.0.0/12"])
    );
}

#[tokio::test(start_paused = true)]
async fn test_cycle_fails_before_provider_calls() {
    let provider = Arc::new(SimulatedProvider::new());
    let result = ResourceGraph::build(vec![
        ResourceDescriptor::new("a", ResourceKind::NotificationTopic).depends_on("b"),
        ResourceDescriptor::new("b", ResourceKind::NotificationTopic).depends_on("a"),
    ]);

    match result {
        Err(FlowError::CircularDependency { edges }) => assert!(!edges.is_empty()),
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(provider.calls().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_is_not_retried() {
    let provider = Arc::new(SimulatedProvider::new());
    provider.reject("bucket_role", "EntityAlreadyExists");
    let graph = ResourceGraph::build(topology("10.0.0.0/8").resources).unwrap();
    let plan = plan(&graph, &StateSnapshot::new(), provider.as_ref()).unwrap();

    let outcome = Executor::new(provider.clone(), ExecutorConfig::default())
        .apply(&graph, &plan, StateSnapshot::new(), CancellationToken::new())
        .await;

    // bucket_role に依存するものは着手しない
    assert!(outcome.result.skipped.contains(&"bucket_access".to_string()));
    assert!(outcome.result.skipped.contains(&"file_share".to_string()));
    assert!(outcome.state.get("gateway").is_some());
    assert!(matches!(
        outcome.into_result(),
        Err(CloudError::PartialApply { failed, .. })
            if failed.len() == 1 && failed[0].1.contains("EntityAlreadyExists")
    ));
}
