//! Action types for resource reconciliation

use gateflow_core::ResourceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Represents a planned action for a logical resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Logical resource name
    pub resource: String,

    pub kind: ResourceKind,

    /// Type of action to perform
    pub action_type: ActionType,

    /// Ordering of a replacement; `None` for every other action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ReplaceStrategy>,

    /// Attribute-level changes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,

    /// Description of the action
    pub description: String,
}

impl Action {
    pub fn new(
        resource: impl Into<String>,
        kind: ResourceKind,
        action_type: ActionType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            kind,
            action_type,
            strategy: None,
            changes: Vec::new(),
            description: description.into(),
        }
    }

    pub fn with_changes(mut self, changes: Vec<AttributeChange>) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Names of the changed attributes
    pub fn changed_attributes(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.attribute.clone()).collect()
    }

    /// Whether the action runs in the forward (dependency) order
    pub fn is_forward(&self) -> bool {
        matches!(
            self.action_type,
            ActionType::Create | ActionType::Update | ActionType::Replace
        )
    }
}

/// Type of action to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    Create,
    /// Update an existing resource in place
    Update,
    /// Create a new copy and delete the old one
    Replace,
    /// Delete a resource
    Delete,
    /// No changes needed
    NoOp,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Replace => write!(f, "replace"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::NoOp => write!(f, "no-op"),
        }
    }
}

/// Ordering of a replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Create the new copy, repoint dependents, then delete the old copy
    CreateBeforeDestroy,
    /// Delete the old copy first; used when two copies cannot coexist
    DeleteBeforeCreate,
}

impl std::fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplaceStrategy::CreateBeforeDestroy => write!(f, "create-before-destroy"),
            ReplaceStrategy::DeleteBeforeCreate => write!(f, "delete-before-create"),
        }
    }
}

/// A single attribute difference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub attribute: String,
    /// Recorded value, `None` if the attribute is new
    pub before: Option<Value>,
    /// Desired value, `None` if it is only known after apply
    pub after: Option<Value>,
}

impl std::fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Value>, missing: &str| match v {
            Some(v) => v.to_string(),
            None => missing.to_string(),
        };
        write!(
            f,
            "{}: {} -> {}",
            self.attribute,
            show(&self.before, "(none)"),
            show(&self.after, "(known after apply)")
        )
    }
}

/// Result of applying actions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Successfully applied actions
    pub succeeded: Vec<ActionResult>,

    /// Failed actions
    pub failed: Vec<ActionResult>,

    /// Resources not attempted because a dependency failed or the run was cancelled
    pub skipped: Vec<String>,

    /// Resources deleted again by rollback after cancellation
    pub rolled_back: Vec<String>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl ApplyResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn add_success(&mut self, resource: String, action: ActionType, message: String) {
        self.succeeded.push(ActionResult {
            resource,
            action,
            message,
            error: None,
        });
    }

    pub fn add_failure(&mut self, resource: String, action: ActionType, error: String) {
        self.failed.push(ActionResult {
            resource,
            action,
            message: String::new(),
            error: Some(error),
        });
    }

    pub fn add_skipped(&mut self, resource: String) {
        if !self.skipped.contains(&resource) {
            self.skipped.push(resource);
        }
    }
}

/// Result of a single action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Logical resource name
    pub resource: String,

    pub action: ActionType,

    /// Success message
    pub message: String,

    /// Error message if failed
    pub error: Option<String>,
}

/// Plan containing all actions to be applied
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Forward actions in dependency order, followed by deletions
    pub actions: Vec<Action>,

    /// Resources that were re-evaluated: changed ones plus their dependents
    pub affected: BTreeSet<String>,

    /// Old copies (`name`, `id`) still waiting for deletion
    #[serde(default)]
    pub deposed: Vec<(String, String)>,

    /// Recorded resources deleted before anything is created, dependents first
    ///
    /// Holds every delete-before-create replacement together with whatever
    /// still depends on it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_deletes: Vec<String>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(
        actions: Vec<Action>,
        affected: BTreeSet<String>,
        deposed: Vec<(String, String)>,
    ) -> Self {
        let has_changes =
            !deposed.is_empty() || actions.iter().any(|a| a.action_type != ActionType::NoOp);
        Self {
            actions,
            affected,
            deposed,
            pre_deletes: Vec::new(),
            has_changes,
        }
    }

    pub fn with_pre_deletes(mut self, names: Vec<String>) -> Self {
        self.pre_deletes = names;
        self
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn action(&self, resource: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.resource == resource)
    }

    /// Get actions by type
    pub fn actions_by_type(&self, action_type: ActionType) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.actions_by_type(ActionType::Create).len(),
            update: self.actions_by_type(ActionType::Update).len(),
            replace: self.actions_by_type(ActionType::Replace).len(),
            delete: self.actions_by_type(ActionType::Delete).len() + self.deposed.len(),
            no_change: self.actions_by_type(ActionType::NoOp).len(),
        }
    }
}

/// Summary of planned actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_change
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_summary() {
        let plan = Plan::new(
            vec![
                Action::new("a", ResourceKind::Role, ActionType::Create, "create"),
                Action::new("b", ResourceKind::RolePolicy, ActionType::NoOp, ""),
                Action::new("c", ResourceKind::Gateway, ActionType::Replace, "replace")
                    .with_strategy(ReplaceStrategy::CreateBeforeDestroy),
            ],
            BTreeSet::new(),
            vec![("d".to_string(), "sg-old".to_string())],
        );

        assert!(plan.has_changes);
        let summary = plan.summary();
        assert_eq!(summary.create, 1);
        assert_eq!(summary.replace, 1);
        assert_eq!(summary.delete, 1);
        assert_eq!(
            summary.to_string(),
            "1 to create, 0 to update, 1 to replace, 1 to delete, 1 unchanged"
        );
    }

    #[test]
    fn test_noop_plan_has_no_changes() {
        let plan = Plan::new(
            vec![Action::new("a", ResourceKind::Role, ActionType::NoOp, "")],
            BTreeSet::new(),
            Vec::new(),
        );
        assert!(!plan.has_changes);
    }

    #[test]
    fn test_attribute_change_display() {
        let change = AttributeChange {
            attribute: "gateway_arn".to_string(),
            before: Some(json!("arn:old")),
            after: None,
        };
        assert_eq!(
            change.to_string(),
            "gateway_arn: \"arn:old\" -> (known after apply)"
        );
    }
}
