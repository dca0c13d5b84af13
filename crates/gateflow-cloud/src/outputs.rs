//! Output projection
//!
//! Read-only view from output names to values computed from recorded
//! resource attributes.

use crate::error::{CloudError, Result};
use crate::state::StateSnapshot;
use gateflow_core::{OutputSpec, Reference, value_to_plain_string};
use serde_json::Value;

/// Projects declared outputs out of a state snapshot
pub struct OutputProjector<'a> {
    specs: &'a [OutputSpec],
    state: &'a StateSnapshot,
}

impl<'a> OutputProjector<'a> {
    pub fn new(specs: &'a [OutputSpec], state: &'a StateSnapshot) -> Self {
        Self { specs, state }
    }

    /// Declared output names, in declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|s| s.name.as_str())
    }

    /// Value of one output
    ///
    /// Fails with [`CloudError::OutputUnavailable`] when a referenced
    /// resource has not been materialized yet.
    pub fn get(&self, name: &str) -> Result<Value> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CloudError::UnknownOutput(name.to_string()))?;
        self.project(spec)
    }

    /// Value of one output rendered as plain text
    pub fn get_string(&self, name: &str) -> Result<String> {
        self.get(name).map(|v| value_to_plain_string(&v))
    }

    /// Every output with its own result
    pub fn all(&self) -> Vec<(String, Result<Value>)> {
        self.specs
            .iter()
            .map(|spec| (spec.name.clone(), self.project(spec)))
            .collect()
    }

    fn project(&self, spec: &OutputSpec) -> Result<Value> {
        let lookup = |r: &Reference| self.state.value(&r.resource, &r.attribute);
        spec.value
            .try_resolve(&lookup)
            .map_err(|reference| CloudError::OutputUnavailable {
                output: spec.name.clone(),
                resource: reference.resource,
            })
    }
}
