//! In-memory control plane
//!
//! Used by the test suite and by `--provider simulated` for dry runs that
//! keep state across invocations. Generates identities and computed
//! attributes per kind, counts calls, and can inject faults.

use crate::error::{CloudError, Result};
use crate::provider::{AuthStatus, ProviderResource, Readiness, ResourceProvider, ResourceRequest};
use crate::state::StateSnapshot;
use async_trait::async_trait;
use gateflow_core::ResourceKind;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Calls made against the simulated control plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u32,
    pub read: u32,
    pub update: u32,
    pub delete: u32,
    pub poll: u32,
}

impl CallCounts {
    /// Calls that change the control plane
    pub fn mutating(&self) -> u32 {
        self.create + self.update + self.delete
    }

    pub fn total(&self) -> u32 {
        self.mutating() + self.read + self.poll
    }
}

#[derive(Debug, Clone, Default)]
struct Fault {
    /// Next N mutating calls fail transiently
    transient: u32,
    /// Mutating calls are rejected outright
    reject: Option<String>,
    /// Polls before readiness; `None` means never ready
    ready_after: Option<Option<u32>>,
    /// Readiness reports a terminal failure
    fail_readiness: Option<String>,
}

#[derive(Debug, Clone)]
struct SimResource {
    name: String,
    kind: ResourceKind,
    outputs: BTreeMap<String, Value>,
    /// Remaining pending polls; `None` means never ready
    pending_polls: Option<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    resources: BTreeMap<String, SimResource>,
    tokens: BTreeMap<String, String>,
    next_id: u64,
    calls: CallCounts,
    log: Vec<String>,
    faults: BTreeMap<String, Fault>,
}

/// Simulated provider
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    inner: Mutex<SimState>,
    /// Delay applied to every create, update and delete
    latency: Duration,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

/// Tracks concurrent calls for the lifetime of one call
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from resources that a previous run recorded
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let provider = Self::new();
        {
            let mut state = provider.lock();
            for (name, resource) in &snapshot.resources {
                state.resources.insert(
                    resource.id.clone(),
                    SimResource {
                        name: name.clone(),
                        kind: resource.kind,
                        outputs: resource.outputs.clone(),
                        pending_polls: Some(0),
                    },
                );
                for copy in &resource.deposed {
                    state.resources.insert(
                        copy.id.clone(),
                        SimResource {
                            name: name.clone(),
                            kind: copy.kind,
                            outputs: BTreeMap::new(),
                            pending_polls: Some(0),
                        },
                    );
                }
            }
            state.next_id = state
                .resources
                .keys()
                .filter_map(|id| id.rsplit('-').next())
                .filter_map(|seq| u64::from_str_radix(seq, 16).ok())
                .max()
                .unwrap_or(0)
                .max(state.resources.len() as u64);
        }
        provider
    }

    /// Every mutating call takes `latency` to complete
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Highest number of mutating calls observed running at once
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fault(&self, name: &str) -> MutexGuard<'_, SimState> {
        let mut state = self.lock();
        state.faults.entry(name.to_string()).or_default();
        state
    }

    /// The next `count` mutating calls on `name` fail transiently
    pub fn fail_transiently(&self, name: &str, count: u32) {
        if let Some(f) = self.fault(name).faults.get_mut(name) {
            f.transient = count;
        }
    }

    /// Mutating calls on `name` are rejected
    pub fn reject(&self, name: &str, message: &str) {
        if let Some(f) = self.fault(name).faults.get_mut(name) {
            f.reject = Some(message.to_string());
        }
    }

    /// `name` reports pending for `polls` polls after create
    pub fn ready_after(&self, name: &str, polls: u32) {
        if let Some(f) = self.fault(name).faults.get_mut(name) {
            f.ready_after = Some(Some(polls));
        }
    }

    /// `name` never becomes ready
    pub fn never_ready(&self, name: &str) {
        if let Some(f) = self.fault(name).faults.get_mut(name) {
            f.ready_after = Some(None);
        }
    }

    /// Readiness of `name` ends in a terminal failure
    pub fn fail_readiness(&self, name: &str, reason: &str) {
        if let Some(f) = self.fault(name).faults.get_mut(name) {
            f.fail_readiness = Some(reason.to_string());
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Ordered log of mutating calls, e.g. `create:gateway`
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Logical names currently present
    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .resources
            .values()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }
}

impl SimState {
    /// Apply injected faults for a mutating call
    fn check_faults(&mut self, name: &str) -> Result<()> {
        let Some(fault) = self.faults.get_mut(name) else {
            return Ok(());
        };
        if let Some(message) = &fault.reject {
            return Err(CloudError::rejected(name, message.clone()));
        }
        if fault.transient > 0 {
            fault.transient -= 1;
            return Err(CloudError::transient(name, "Throttling: Rate exceeded"));
        }
        Ok(())
    }

    /// Calls addressing an identity must name the kind it was created as
    fn check_kind(&self, name: &str, kind: ResourceKind, id: &str) -> Result<()> {
        match self.resources.get(id) {
            Some(resource) if resource.kind != kind => Err(CloudError::rejected(
                name,
                format!("{} is a {}, not a {}", id, resource.kind, kind),
            )),
            _ => Ok(()),
        }
    }

    fn pending_polls(&self, name: &str) -> Option<u32> {
        match self.faults.get(name).and_then(|f| f.ready_after) {
            Some(polls) => polls,
            None => Some(0),
        }
    }

    fn generate_id(&mut self, kind: ResourceKind) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", id_prefix(kind), self.next_id)
    }
}

fn id_prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::ComputeInstance => "i",
        ResourceKind::BlockVolume => "vol",
        ResourceKind::VolumeAttachment => "attach",
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::NetworkEndpoint => "vpce",
        ResourceKind::Role => "role",
        ResourceKind::RolePolicy => "policy",
        ResourceKind::Gateway => "sgw",
        ResourceKind::GatewayCache => "cache",
        ResourceKind::FileShare => "share",
        ResourceKind::BucketNotification => "notify",
        ResourceKind::EventRule => "rule",
        ResourceKind::EventTarget => "target",
        ResourceKind::NotificationTopic => "topic",
        ResourceKind::TopicPolicy => "topicpolicy",
    }
}

/// Computed attributes a real control plane would report
fn computed_outputs(request: &ResourceRequest, id: &str, seq: u64) -> BTreeMap<String, Value> {
    let mut outputs = BTreeMap::new();
    let arn = format!("arn:sim:{}:{}", request.kind, id);
    outputs.insert("arn".to_string(), Value::String(arn));
    if let Some(name) = request.str("name") {
        outputs.insert("name".to_string(), Value::String(name.to_string()));
    }

    match request.kind {
        ResourceKind::ComputeInstance => {
            let ip = format!("10.0.{}.{}", (seq / 250) % 256, seq % 250 + 4);
            outputs.insert("private_ip".to_string(), Value::String(ip));
            outputs.insert(
                "availability_zone".to_string(),
                Value::String("sim-zone-a".to_string()),
            );
        }
        ResourceKind::NetworkEndpoint => {
            outputs.insert(
                "dns_name".to_string(),
                Value::String(format!("{}.storagegateway.sim.internal", id)),
            );
        }
        ResourceKind::FileShare => {
            let bucket = request
                .str("location_arn")
                .and_then(|arn| arn.rsplit(':').next())
                .unwrap_or("share");
            outputs.insert("path".to_string(), Value::String(format!("/{}", bucket)));
        }
        ResourceKind::VolumeAttachment => {
            if let Some(device) = request.str("device_name") {
                outputs.insert("device_name".to_string(), Value::String(device.to_string()));
            }
        }
        _ => {}
    }
    outputs
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    fn display_name(&self) -> &str {
        "Simulated control plane"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        Ok(AuthStatus::ok("simulated account"))
    }

    async fn create(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let _call = self.enter().await;
        let mut state = self.lock();
        state.calls.create += 1;

        if let Some(id) = state.tokens.get(&request.client_token).cloned()
            && let Some(existing) = state.resources.get(&id)
        {
            debug!(resource = %request.name, %id, "Create replayed with known client token");
            return Ok(ProviderResource {
                id,
                outputs: existing.outputs.clone(),
            });
        }

        state.check_faults(&request.name)?;

        let id = state.generate_id(request.kind);
        let outputs = computed_outputs(request, &id, state.next_id);
        let pending_polls = state.pending_polls(&request.name);
        state.resources.insert(
            id.clone(),
            SimResource {
                name: request.name.clone(),
                kind: request.kind,
                outputs: outputs.clone(),
                pending_polls,
            },
        );
        state.tokens.insert(request.client_token.clone(), id.clone());
        state.log.push(format!("create:{}", request.name));

        Ok(ProviderResource { id, outputs })
    }

    async fn read(&self, _kind: ResourceKind, id: &str) -> Result<Option<ProviderResource>> {
        let mut state = self.lock();
        state.calls.read += 1;
        Ok(state.resources.get(id).map(|r| ProviderResource {
            id: id.to_string(),
            outputs: r.outputs.clone(),
        }))
    }

    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> Result<ProviderResource> {
        let _call = self.enter().await;
        let mut state = self.lock();
        state.calls.update += 1;
        state.check_faults(&request.name)?;

        let seq = state.next_id;
        let Some(resource) = state.resources.get_mut(id) else {
            return Err(CloudError::rejected(
                &request.name,
                format!("{} {} does not exist", request.kind, id),
            ));
        };
        for (key, value) in computed_outputs(request, id, seq) {
            // 既存の計算値は維持する
            resource.outputs.entry(key).or_insert(value);
        }
        if let Some(name) = request.str("name") {
            resource
                .outputs
                .insert("name".to_string(), Value::String(name.to_string()));
        }
        let outputs = resource.outputs.clone();
        state
            .log
            .push(format!("update:{}:{}", request.name, changed.join(",")));

        Ok(ProviderResource {
            id: id.to_string(),
            outputs,
        })
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let _call = self.enter().await;
        let mut state = self.lock();
        state.calls.delete += 1;

        let Some(name) = state.resources.get(id).map(|r| r.name.clone()) else {
            debug!(%id, "Delete of absent resource");
            return Ok(());
        };
        state.check_kind(&name, kind, id)?;
        state.check_faults(&name)?;
        state.resources.remove(id);
        state.log.push(format!("delete:{}", name));
        Ok(())
    }

    async fn poll(&self, kind: ResourceKind, id: &str) -> Result<Readiness> {
        let mut state = self.lock();
        state.calls.poll += 1;

        let Some(name) = state.resources.get(id).map(|r| r.name.clone()) else {
            return Ok(Readiness::Failed(format!("{} not found", id)));
        };
        state.check_kind(&name, kind, id)?;
        if let Some(reason) = state
            .faults
            .get(&name)
            .and_then(|f| f.fail_readiness.clone())
        {
            return Ok(Readiness::Failed(reason));
        }

        let Some(resource) = state.resources.get_mut(id) else {
            return Ok(Readiness::Failed(format!("{} not found", id)));
        };
        match resource.pending_polls {
            None => Ok(Readiness::Pending("pending".to_string())),
            Some(0) => Ok(Readiness::Ready),
            Some(n) => {
                resource.pending_polls = Some(n - 1);
                Ok(Readiness::Pending(format!("{} polls remaining", n)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceState;
    use serde_json::json;

    fn request(name: &str, kind: ResourceKind, token: &str) -> ResourceRequest {
        ResourceRequest::new(name, kind, BTreeMap::new(), token)
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_token() {
        let provider = SimulatedProvider::new();
        let first = provider
            .create(&request("topic", ResourceKind::NotificationTopic, "t-1"))
            .await
            .unwrap();
        let again = provider
            .create(&request("topic", ResourceKind::NotificationTopic, "t-1"))
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(provider.resource_count(), 1);
        assert_eq!(provider.calls().create, 2);
    }

    #[tokio::test]
    async fn test_computed_outputs() {
        let provider = SimulatedProvider::new();
        let instance = provider
            .create(&request("vm", ResourceKind::ComputeInstance, "t-1"))
            .await
            .unwrap();
        assert!(instance.outputs.contains_key("private_ip"));
        assert!(instance.outputs.contains_key("availability_zone"));

        let share = provider
            .create(&ResourceRequest::new(
                "share",
                ResourceKind::FileShare,
                [("location_arn".to_string(), json!("arn:aws:s3:::uploads"))].into(),
                "t-2",
            ))
            .await
            .unwrap();
        assert_eq!(share.outputs["path"], json!("/uploads"));
    }

    #[tokio::test]
    async fn test_delete_of_absent_resource_succeeds() {
        let provider = SimulatedProvider::new();
        provider
            .delete(ResourceKind::Role, "role-missing")
            .await
            .unwrap();
        assert!(provider.log().is_empty());
    }

    #[tokio::test]
    async fn test_calls_with_the_wrong_kind_are_rejected() {
        let provider = SimulatedProvider::new();
        let topic = provider
            .create(&request("topic", ResourceKind::NotificationTopic, "t-1"))
            .await
            .unwrap();

        let err = provider
            .delete(ResourceKind::Role, &topic.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Rejected { .. }));
        let err = provider
            .poll(ResourceKind::ComputeInstance, &topic.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Rejected { .. }));

        assert_eq!(provider.live_names(), vec!["topic"]);
        provider
            .delete(ResourceKind::NotificationTopic, &topic.id)
            .await
            .unwrap();
        assert_eq!(provider.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_faults() {
        let provider = SimulatedProvider::new();
        provider.fail_transiently("topic", 1);
        provider.reject("role", "EntityAlreadyExists");

        let err = provider
            .create(&request("topic", ResourceKind::NotificationTopic, "t-1"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        provider
            .create(&request("topic", ResourceKind::NotificationTopic, "t-1"))
            .await
            .unwrap();

        let err = provider
            .create(&request("role", ResourceKind::Role, "t-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_seeded_from_snapshot() {
        let mut snapshot = StateSnapshot::new();
        snapshot.set_resource(
            "vm",
            ResourceState::new("i-1", ResourceKind::ComputeInstance)
                .with_output("private_ip", json!("10.0.0.9")),
        );
        let provider = SimulatedProvider::from_snapshot(&snapshot);

        let found = provider
            .read(ResourceKind::ComputeInstance, "i-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.outputs["private_ip"], json!("10.0.0.9"));
        assert_eq!(provider.live_names(), vec!["vm"]);
    }
}
