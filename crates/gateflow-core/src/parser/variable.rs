//! variable / variables ノードのパース

use super::{first_string, property};
use super::resource::kdl_value_to_json;
use crate::error::{FlowError, Result};
use crate::model::{VariableKind, VariableSpec};
use kdl::KdlNode;
use std::collections::BTreeMap;

/// variable ノードをパース
///
/// 例: `variable "subnet_cidr" type="cidr" required=#true description="..."`
pub fn parse_variable(node: &KdlNode) -> Result<VariableSpec> {
    let name = first_string(node)
        .ok_or_else(|| FlowError::InvalidConfig("variable requires a name".to_string()))?
        .to_string();

    let kind = match property(node, "type").and_then(|v| v.as_string()) {
        Some(kind) => VariableKind::parse(kind).ok_or_else(|| {
            FlowError::InvalidConfig(format!("variable '{}': unknown type '{}'", name, kind))
        })?,
        None => VariableKind::String,
    };

    let default = property(node, "default").map(kdl_value_to_json);
    let required = property(node, "required")
        .and_then(|v| v.as_bool())
        .unwrap_or(default.is_none());

    if required && default.is_some() {
        return Err(FlowError::InvalidConfig(format!(
            "variable '{}': required と default は同時に指定できません",
            name
        )));
    }

    let description = property(node, "description")
        .and_then(|v| v.as_string())
        .map(|s| s.to_string());

    Ok(VariableSpec {
        name,
        kind,
        required,
        default,
        description,
    })
}

/// variables ブロックをパース
pub fn parse_variables_block(node: &KdlNode) -> BTreeMap<String, serde_json::Value> {
    let mut values = BTreeMap::new();
    if let Some(children) = node.children() {
        for var in children.nodes() {
            let key = var.name().value().to_string();
            if let Some(entry) = var.entries().first() {
                values.insert(key, kdl_value_to_json(entry.value()));
            }
        }
    }
    values
}
