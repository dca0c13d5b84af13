//! State reconciler
//!
//! Diffs the desired resource graph against the recorded snapshot and
//! produces a [`Plan`]. Planning never calls the provider's control plane;
//! only the local update rules from [`ResourceProvider::schema`] are used.

use crate::action::{Action, ActionType, AttributeChange, Plan, ReplaceStrategy};
use crate::error::Result;
use crate::provider::{ResourceProvider, ResourceSchema};
use crate::state::{ResourceState, StateSnapshot};
use gateflow_core::{
    DependencyMap, Reference, ResourceDescriptor, ResourceGraph, reverse_topological_sort,
    topological_sort,
};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Compute the actions that bring the recorded state to the desired graph
#[tracing::instrument(skip_all, fields(resources = graph.len(), recorded = snapshot.resources.len()))]
pub fn plan(
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    provider: &dyn ResourceProvider,
) -> Result<Plan> {
    let order = topological_sort(graph.dependency_map())?;

    // 1. Resources that changed on their own, judged against recorded values only
    let recorded_lookup = |r: &Reference| snapshot.value(&r.resource, &r.attribute);
    let mut direct = BTreeSet::new();
    for name in &order {
        let Some(descriptor) = graph.get(name) else {
            continue;
        };
        let changed = match snapshot.get(name) {
            None => true,
            Some(recorded) => {
                recorded.is_tainted()
                    || recorded.kind != descriptor.kind
                    || !diff_attributes(descriptor, recorded, &recorded_lookup).is_empty()
            }
        };
        if changed {
            direct.insert(name.clone());
        }
    }

    // 2. Partial re-planning: only the affected subgraph is re-evaluated
    let mut affected = graph.affected_subgraph(&direct);
    debug!(
        direct = direct.len(),
        affected = affected.len(),
        "Computed affected subgraph"
    );

    let mut unknown: BTreeSet<String> = BTreeSet::new();
    let mut actions = Vec::with_capacity(order.len());

    for name in &order {
        let Some(descriptor) = graph.get(name) else {
            continue;
        };
        if !affected.contains(name) {
            actions.push(Action::new(
                name,
                descriptor.kind,
                ActionType::NoOp,
                "unchanged",
            ));
            continue;
        }

        let schema = provider.schema(descriptor.kind);
        let action = {
            let lookup = |r: &Reference| {
                if unknown.contains(&r.resource) {
                    None
                } else {
                    snapshot.value(&r.resource, &r.attribute)
                }
            };
            evaluate(descriptor, snapshot.get(name), &schema, &lookup)
        };

        if matches!(action.action_type, ActionType::Create | ActionType::Replace) {
            unknown.insert(name.clone());
        }
        actions.push(action);
    }

    // 3. Recorded resources that are no longer desired, dependents first
    let removed: BTreeSet<&String> = snapshot
        .resources
        .keys()
        .filter(|name| !graph.contains(name))
        .collect();
    if !removed.is_empty() {
        for name in reverse_topological_sort(&snapshot.dependency_map())? {
            if removed.contains(&name)
                && let Some(recorded) = snapshot.get(&name)
            {
                actions.push(Action::new(
                    &name,
                    recorded.kind,
                    ActionType::Delete,
                    format!("delete {} (no longer declared)", recorded.kind),
                ));
            }
        }
    }

    let deposed = snapshot
        .resources
        .iter()
        .flat_map(|(name, state)| {
            state
                .deposed
                .iter()
                .map(move |copy| (name.clone(), copy.id.clone()))
        })
        .collect();

    // 4. Whatever hangs off a delete-before-create replacement goes first
    let pre_deletes = vacate(graph, snapshot, &mut actions)?;
    if !pre_deletes.is_empty() {
        debug!(order = ?pre_deletes, "Deleting before the forward phase");
        affected.extend(pre_deletes.iter().filter(|n| graph.contains(n)).cloned());
    }

    let plan = Plan::new(actions, affected, deposed).with_pre_deletes(pre_deletes);
    info!(summary = %plan.summary(), "Plan computed");
    Ok(plan)
}

/// Decide the action for one affected resource
fn evaluate<F>(
    descriptor: &ResourceDescriptor,
    recorded: Option<&ResourceState>,
    schema: &ResourceSchema,
    lookup: &F,
) -> Action
where
    F: Fn(&Reference) -> Option<Value>,
{
    let name = &descriptor.name;
    let kind = descriptor.kind;

    let Some(recorded) = recorded else {
        let changes = descriptor
            .attributes
            .iter()
            .map(|(key, expr)| AttributeChange {
                attribute: key.clone(),
                before: None,
                after: expr.try_resolve(lookup).ok(),
            })
            .collect();
        return Action::new(name, kind, ActionType::Create, format!("create {}", kind))
            .with_changes(changes);
    };

    let replace = |reason: String, changes: Vec<AttributeChange>| {
        Action::new(name, kind, ActionType::Replace, reason)
            .with_strategy(replace_strategy(schema))
            .with_changes(changes)
    };

    if recorded.kind != kind {
        return replace(
            format!("replace: kind changed from {} to {}", recorded.kind, kind),
            Vec::new(),
        );
    }

    let changes = diff_attributes(descriptor, recorded, lookup);
    if recorded.is_tainted() {
        return replace("replace: previous create did not complete".to_string(), changes);
    }
    if changes.is_empty() {
        return Action::new(name, kind, ActionType::NoOp, "unchanged");
    }

    let fixed: Vec<&str> = changes
        .iter()
        .filter(|c| !schema.can_update(&c.attribute))
        .map(|c| c.attribute.as_str())
        .collect();

    if fixed.is_empty() {
        let names: Vec<&str> = changes.iter().map(|c| c.attribute.as_str()).collect();
        Action::new(
            name,
            kind,
            ActionType::Update,
            format!("update {}", names.join(", ")),
        )
        .with_changes(changes)
    } else {
        let reason = format!("replace: {} cannot be updated in place", fixed.join(", "));
        replace(reason, changes)
    }
}

/// Close delete-before-create replacements over their recorded dependents
///
/// A resource cannot be deleted while something still depends on it, so
/// every such dependent is replaced the same way (or, if it is no longer
/// declared, deleted early). Returns the deletion order, dependents first.
fn vacate(
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    actions: &mut [Action],
) -> Result<Vec<String>> {
    let mut vacated: BTreeSet<String> = actions
        .iter()
        .filter(|a| a.strategy == Some(ReplaceStrategy::DeleteBeforeCreate))
        .map(|a| a.resource.clone())
        .collect();
    if vacated.is_empty() {
        return Ok(Vec::new());
    }

    let depends_on = |name: &str| {
        let mut deps = if graph.contains(name) {
            graph.dependencies_of(name)
        } else {
            BTreeSet::new()
        };
        if let Some(recorded) = snapshot.get(name) {
            deps.extend(recorded.dependencies.iter().cloned());
        }
        deps
    };

    loop {
        let mut grew = false;
        for action in actions.iter_mut() {
            if vacated.contains(&action.resource) || snapshot.get(&action.resource).is_none() {
                continue;
            }
            let Some(parent) = depends_on(&action.resource)
                .into_iter()
                .find(|d| vacated.contains(d))
            else {
                continue;
            };
            if action.action_type != ActionType::Delete {
                action.action_type = ActionType::Replace;
                action.strategy = Some(ReplaceStrategy::DeleteBeforeCreate);
                action.description =
                    format!("replace: {} is deleted before it is re-created", parent);
            }
            vacated.insert(action.resource.clone());
            grew = true;
        }
        if !grew {
            break;
        }
    }

    let within: DependencyMap = vacated
        .iter()
        .map(|name| {
            let deps = depends_on(name)
                .into_iter()
                .filter(|d| d != name && vacated.contains(d))
                .collect();
            (name.clone(), deps)
        })
        .collect();
    Ok(reverse_topological_sort(&within)?)
}

fn replace_strategy(schema: &ResourceSchema) -> ReplaceStrategy {
    if schema.exclusive_identity {
        ReplaceStrategy::DeleteBeforeCreate
    } else {
        ReplaceStrategy::CreateBeforeDestroy
    }
}

/// Attribute differences between desired and recorded values
///
/// An attribute whose value is only known after apply always counts as changed.
fn diff_attributes<F>(
    descriptor: &ResourceDescriptor,
    recorded: &ResourceState,
    lookup: &F,
) -> Vec<AttributeChange>
where
    F: Fn(&Reference) -> Option<Value>,
{
    let mut changes = Vec::new();
    for (key, expr) in &descriptor.attributes {
        let after = expr.try_resolve(lookup).ok();
        let before = recorded.attributes.get(key).cloned();
        if after.is_none() || after != before {
            changes.push(AttributeChange {
                attribute: key.clone(),
                before,
                after,
            });
        }
    }
    for (key, before) in &recorded.attributes {
        if !descriptor.attributes.contains_key(key) {
            changes.push(AttributeChange {
                attribute: key.clone(),
                before: Some(before.clone()),
                after: Some(Value::Null),
            });
        }
    }
    changes
}
