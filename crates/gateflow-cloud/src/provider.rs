//! Provider contract
//!
//! One operation per resource kind: create, read, update, delete and poll.
//! Providers only map attributes onto control-plane calls. Ordering, retries
//! and readiness waiting live in the executor.

use crate::error::Result;
use async_trait::async_trait;
use gateflow_core::ResourceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Cloud provider abstraction trait
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Returns the provider name (e.g., "aws", "simulated")
    fn name(&self) -> &str;

    /// Returns the provider display name for UI
    fn display_name(&self) -> &str;

    /// Check if the provider is properly configured and authenticated
    async fn check_auth(&self) -> Result<AuthStatus>;

    /// Update and replacement rules for a resource kind
    fn schema(&self, kind: ResourceKind) -> ResourceSchema {
        ResourceSchema::default_for(kind)
    }

    /// Create a resource. Retrying with the same client token must not
    /// create a second copy.
    async fn create(&self, request: &ResourceRequest) -> Result<ProviderResource>;

    /// Read the current state. `None` when the resource no longer exists.
    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Option<ProviderResource>>;

    /// Update the listed attributes in place
    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> Result<ProviderResource>;

    /// Delete a resource. Deleting an absent resource succeeds.
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()>;

    /// Poll asynchronous readiness
    async fn poll(&self, kind: ResourceKind, id: &str) -> Result<Readiness>;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/user information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a readiness poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Readiness {
    Ready,
    /// Still converging; carries the provider's status text
    Pending(String),
    /// Terminal failure
    Failed(String),
}

/// Fully resolved input for a create or update call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Logical name
    pub name: String,
    pub kind: ResourceKind,
    pub attributes: BTreeMap<String, Value>,
    /// Idempotency token, stable across retries within one apply run
    pub client_token: String,
}

impl ResourceRequest {
    pub fn new(
        name: impl Into<String>,
        kind: ResourceKind,
        attributes: BTreeMap<String, Value>,
        client_token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            attributes,
            client_token: client_token.into(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Get an attribute as a string
    pub fn str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Get an attribute as a list of strings
    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.attributes.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

/// What the provider reports for a materialized resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Provider-assigned identity
    pub id: String,
    /// Computed attributes (IP, ARN, DNS name, ...)
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl ProviderResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// Update and replacement rules for a resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    pub kind: ResourceKind,
    /// Attributes that can change without replacing the resource
    pub updatable: BTreeSet<String>,
    /// Two live copies cannot coexist, so replacement deletes first
    pub exclusive_identity: bool,
    /// Readiness is asynchronous and must be polled after create/update
    pub await_ready: bool,
}

impl ResourceSchema {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            updatable: BTreeSet::new(),
            exclusive_identity: false,
            await_ready: false,
        }
    }

    pub fn updatable(mut self, attributes: &[&str]) -> Self {
        self.updatable
            .extend(attributes.iter().map(|a| a.to_string()));
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive_identity = true;
        self
    }

    pub fn awaits_ready(mut self) -> Self {
        self.await_ready = true;
        self
    }

    pub fn can_update(&self, attribute: &str) -> bool {
        self.updatable.contains(attribute)
    }

    /// Rules shared by every provider that manages these kinds
    pub fn default_for(kind: ResourceKind) -> Self {
        let schema = Self::new(kind);
        match kind {
            ResourceKind::ComputeInstance => schema
                .updatable(&["name", "security_group_ids"])
                .awaits_ready(),
            ResourceKind::BlockVolume => schema
                .updatable(&["name", "size", "volume_type"])
                .awaits_ready(),
            ResourceKind::VolumeAttachment => schema,
            ResourceKind::SecurityGroup => schema.updatable(&["ingress"]),
            ResourceKind::NetworkEndpoint => schema
                .updatable(&["security_group_ids", "subnet_ids", "private_dns"])
                .awaits_ready(),
            ResourceKind::Role => schema.updatable(&["assume_service"]).exclusive(),
            ResourceKind::RolePolicy => schema.updatable(&["actions", "resources"]).exclusive(),
            ResourceKind::Gateway => schema.updatable(&["name", "timezone"]).awaits_ready(),
            ResourceKind::GatewayCache => schema.exclusive(),
            ResourceKind::FileShare => schema
                .updatable(&["client_list", "storage_class", "squash"])
                .awaits_ready(),
            ResourceKind::BucketNotification => schema.updatable(&["eventbridge"]).exclusive(),
            ResourceKind::EventRule => schema.updatable(&["event_pattern"]).exclusive(),
            ResourceKind::EventTarget => schema.updatable(&["target_arn"]).exclusive(),
            ResourceKind::NotificationTopic => schema,
            ResourceKind::TopicPolicy => schema
                .updatable(&["allow_service", "source_arn"])
                .exclusive(),
        }
    }
}
