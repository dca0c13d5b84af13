//! JSON documents passed to the aws CLI
//!
//! IAM policies, security group permissions and topic policies.

use gateflow_core::{IngressPolicy, Protocol};
use serde_json::{Value, json};

/// Statement id of the publish grant managed on a topic policy
pub const TOPIC_STATEMENT_ID: &str = "gateflow-publish";

/// `--ip-permissions` for an ingress policy
///
/// Rules with the same protocol and port range share one permission.
pub fn ip_permissions(policy: &IngressPolicy) -> Value {
    let mut permissions: Vec<(Protocol, u16, u16, Vec<Value>)> = Vec::new();
    for rule in &policy.rules {
        let mut range = json!({ "CidrIp": rule.cidr.to_string() });
        if let Some(description) = &rule.description {
            range["Description"] = json!(description);
        }
        match permissions
            .iter_mut()
            .find(|(p, from, to, _)| *p == rule.protocol && *from == rule.from_port && *to == rule.to_port)
        {
            Some((_, _, _, ranges)) => ranges.push(range),
            None => permissions.push((rule.protocol, rule.from_port, rule.to_port, vec![range])),
        }
    }

    Value::Array(
        permissions
            .into_iter()
            .map(|(protocol, from, to, ranges)| {
                json!({
                    "IpProtocol": protocol.to_string(),
                    "FromPort": from,
                    "ToPort": to,
                    "IpRanges": ranges,
                })
            })
            .collect(),
    )
}

/// Trust policy letting `service` assume a role
pub fn assume_role_policy(service: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service },
            "Action": "sts:AssumeRole"
        }]
    })
}

/// Inline policy allowing `actions` on `resources`
pub fn allow_policy(actions: &[String], resources: &[String]) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": actions,
            "Resource": resources
        }]
    })
}

/// Publish grant for `service`, limited to events from `source_arn`
pub fn publish_statement(topic_arn: &str, service: &str, source_arn: Option<&str>) -> Value {
    let mut statement = json!({
        "Sid": TOPIC_STATEMENT_ID,
        "Effect": "Allow",
        "Principal": { "Service": service },
        "Action": "sns:Publish",
        "Resource": topic_arn
    });
    if let Some(source) = source_arn {
        statement["Condition"] = json!({ "ArnEquals": { "aws:SourceArn": source } });
    }
    statement
}

/// Replace the managed statement in an existing topic policy
///
/// `statement = None` removes it. Statements owned by others are kept.
pub fn merge_topic_policy(existing: Option<&str>, statement: Option<Value>) -> Value {
    let mut policy = existing
        .and_then(|text| serde_json::from_str::<Value>(text).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({ "Version": "2012-10-17", "Statement": [] }));

    let mut statements: Vec<Value> = match policy.get("Statement") {
        Some(Value::Array(items)) => items.clone(),
        Some(single @ Value::Object(_)) => vec![single.clone()],
        _ => Vec::new(),
    };
    statements.retain(|s| s.get("Sid").and_then(Value::as_str) != Some(TOPIC_STATEMENT_ID));
    statements.extend(statement);

    policy["Statement"] = Value::Array(statements);
    policy
}

/// Whether a topic policy carries the managed statement
pub fn has_publish_statement(policy: &str) -> bool {
    serde_json::from_str::<Value>(policy)
        .ok()
        .and_then(|p| p.get("Statement").cloned())
        .and_then(|s| s.as_array().cloned())
        .is_some_and(|statements| {
            statements
                .iter()
                .any(|s| s.get("Sid").and_then(Value::as_str) == Some(TOPIC_STATEMENT_ID))
        })
}
