//! resource / output ノードのパース

use super::{first_string, property};
use crate::error::{FlowError, Result};
use crate::model::{Expr, OutputSpec, Reference, ResourceDescriptor, ResourceKind};
use kdl::{KdlEntry, KdlNode};

/// resource ノードをパース
///
/// ```kdl
/// resource "audit_topic" kind="notification-topic" {
///     name "{{ name_prefix }}-audit"
///     subnets "subnet-a" (ref)"extra_subnet.id"
///     (concat)display_name "audit for " (ref)"gateway.arn"
///     depends_on "upload_topic"
/// }
/// ```
pub fn parse_resource(node: &KdlNode) -> Result<ResourceDescriptor> {
    let name = first_string(node)
        .ok_or_else(|| FlowError::InvalidConfig("resource requires a name".to_string()))?
        .to_string();

    let kind: ResourceKind = property(node, "kind")
        .and_then(|v| v.as_string())
        .ok_or_else(|| FlowError::InvalidConfig(format!("resource '{}' requires kind=", name)))?
        .parse()?;

    let mut resource = ResourceDescriptor::new(name, kind);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "depends_on" | "depends-on" => {
                    for dep in child
                        .entries()
                        .iter()
                        .filter_map(|e| e.value().as_string())
                    {
                        resource = resource.depends_on(dep);
                    }
                }
                attribute => {
                    let expr = parse_attribute(child).map_err(|e| {
                        FlowError::InvalidConfig(format!(
                            "resource '{}' attribute '{}': {}",
                            resource.name, attribute, e
                        ))
                    })?;
                    resource.attributes.insert(attribute.to_string(), expr);
                }
            }
        }
    }

    Ok(resource)
}

/// output ノードをパース
///
/// 位置引数が1つならその値、複数なら文字列連結になります。
///
/// ```kdl
/// output "gateway_ip" (ref)"gateway_instance.private_ip" description="..."
/// output "mount" "mount -t nfs " (ref)"gateway_instance.private_ip" ":/share"
/// ```
pub fn parse_output(node: &KdlNode) -> Result<OutputSpec> {
    let mut positional = node.entries().iter().filter(|e| e.name().is_none());

    let name = positional
        .next()
        .and_then(|e| e.value().as_string())
        .ok_or_else(|| FlowError::InvalidConfig("output requires a name".to_string()))?
        .to_string();

    let parts = positional.map(entry_to_expr).collect::<Result<Vec<_>>>()?;
    let value = match parts.len() {
        0 => {
            return Err(FlowError::InvalidConfig(format!(
                "output '{}' requires a value",
                name
            )));
        }
        1 => parts.into_iter().next().unwrap_or(Expr::Literal(serde_json::Value::Null)),
        _ => Expr::Concat(parts),
    };

    let mut output = OutputSpec::new(name, value);
    if let Some(description) = property(node, "description").and_then(|v| v.as_string()) {
        output = output.describe(description);
    }
    Ok(output)
}

/// 属性ノードを式に変換
fn parse_attribute(node: &KdlNode) -> Result<Expr> {
    if let Some(children) = node.children() {
        // ネストしたブロックはオブジェクトリテラルとして扱う（参照は不可）
        let mut object = serde_json::Map::new();
        for child in children.nodes() {
            let value = match parse_attribute(child)? {
                Expr::Literal(value) => value,
                _ => {
                    return Err(FlowError::InvalidConfig(
                        "references are not allowed inside nested blocks".to_string(),
                    ));
                }
            };
            object.insert(child.name().value().to_string(), value);
        }
        return Ok(Expr::Literal(serde_json::Value::Object(object)));
    }

    let parts = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(entry_to_expr)
        .collect::<Result<Vec<_>>>()?;

    let annotation = node.ty().map(|t| t.value());
    match (annotation, parts.len()) {
        (Some("concat"), _) => Ok(Expr::Concat(parts)),
        (Some("list"), _) => Ok(collapse_list(parts)),
        (Some(other), _) => Err(FlowError::InvalidConfig(format!(
            "unknown attribute annotation '({})'",
            other
        ))),
        (None, 0) => Ok(Expr::Literal(serde_json::Value::Null)),
        (None, 1) => Ok(parts.into_iter().next().unwrap_or(Expr::Literal(serde_json::Value::Null))),
        (None, _) => Ok(collapse_list(parts)),
    }
}

/// 全てリテラルのリストは1つのJSON配列リテラルにまとめる
fn collapse_list(parts: Vec<Expr>) -> Expr {
    if parts.iter().all(|p| matches!(p, Expr::Literal(_))) {
        let values = parts
            .into_iter()
            .filter_map(|p| match p {
                Expr::Literal(v) => Some(v),
                _ => None,
            })
            .collect();
        Expr::Literal(serde_json::Value::Array(values))
    } else {
        Expr::List(parts)
    }
}

fn entry_to_expr(entry: &KdlEntry) -> Result<Expr> {
    match entry.ty().map(|t| t.value()) {
        Some("ref") => {
            let raw = entry.value().as_string().ok_or_else(|| {
                FlowError::InvalidReference(entry.value().to_string())
            })?;
            let reference: Reference = raw.parse()?;
            Ok(Expr::Ref(reference))
        }
        Some(other) => Err(FlowError::InvalidConfig(format!(
            "unknown value annotation '({})'",
            other
        ))),
        None => Ok(Expr::Literal(kdl_value_to_json(entry.value()))),
    }
}

/// KDL値をJSON値に変換
pub fn kdl_value_to_json(value: &kdl::KdlValue) -> serde_json::Value {
    if let Some(s) = value.as_string() {
        serde_json::Value::String(s.to_string())
    } else if let Some(i) = value.as_integer() {
        // i128をi64に変換してからJSONに変換
        serde_json::Value::Number((i as i64).into())
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    } else if let Some(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else {
        serde_json::Value::Null
    }
}
