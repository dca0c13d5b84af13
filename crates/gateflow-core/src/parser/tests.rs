use super::*;
use crate::model::{Expr, Reference, ResourceKind, VariableKind};
use serde_json::json;

#[test]
fn test_parse_project_and_topology() {
    let kdl = r#"
        project "nfs-gateway"
        topology "file-gateway"
    "#;

    let project = parse_kdl_string(kdl, "fallback".to_string()).unwrap();
    assert_eq!(project.name, "nfs-gateway");
    assert_eq!(project.topology.as_deref(), Some("file-gateway"));
}

#[test]
fn test_default_name_is_used_without_project_node() {
    let project = parse_kdl_string("", "dir-name".to_string()).unwrap();
    assert_eq!(project.name, "dir-name");
    assert!(project.topology.is_none());
}

#[test]
fn test_parse_variables() {
    let kdl = r#"
        variable "vpc_id" required=#true description="VPC hosting the gateway"
        variable "subnet_cidr" type="cidr"
        variable "cache_volume_size" type="integer" default=150
        variable "debug" type="bool" required=#false
    "#;

    let project = parse_kdl_string(kdl, "test".to_string()).unwrap();
    assert_eq!(project.variables.len(), 4);

    let vpc = project.variable("vpc_id").unwrap();
    assert!(vpc.required);
    assert_eq!(vpc.description.as_deref(), Some("VPC hosting the gateway"));

    // default なしは必須扱い
    let cidr = project.variable("subnet_cidr").unwrap();
    assert!(cidr.required);
    assert_eq!(cidr.kind, VariableKind::Cidr);

    let size = project.variable("cache_volume_size").unwrap();
    assert!(!size.required);
    assert_eq!(size.default, Some(json!(150)));

    let debug = project.variable("debug").unwrap();
    assert!(!debug.required);
    assert!(debug.default.is_none());
}

#[test]
fn test_required_with_default_is_rejected() {
    let kdl = r#"variable "x" required=#true default="y""#;
    assert!(parse_kdl_string(kdl, "test".to_string()).is_err());
}

#[test]
fn test_unknown_variable_type_is_rejected() {
    let kdl = r#"variable "x" type="float""#;
    let err = parse_kdl_string(kdl, "test".to_string()).unwrap_err();
    assert!(err.to_string().contains("float"));
}

#[test]
fn test_parse_variables_block() {
    let kdl = r#"
        variables {
            vpc_id "vpc-0abc"
            cache_volume_size 200
            enabled #true
        }
    "#;

    let project = parse_kdl_string(kdl, "test".to_string()).unwrap();
    assert_eq!(project.values["vpc_id"], json!("vpc-0abc"));
    assert_eq!(project.values["cache_volume_size"], json!(200));
    assert_eq!(project.values["enabled"], json!(true));
}

#[test]
fn test_parse_resource_with_references() {
    let kdl = r#"
        resource "audit_topic" kind="notification-topic" {
            name "{{ name_prefix }}-audit"
            subnets "subnet-a" (ref)"extra.id"
            tags "a" "b"
            (concat)display "audit for " (ref)"gateway.arn"
            (list)single "only"
            depends_on "upload_topic"
        }
    "#;

    let project = parse_kdl_string(kdl, "test".to_string()).unwrap();
    let resource = &project.resources[0];
    assert_eq!(resource.name, "audit_topic");
    assert_eq!(resource.kind, ResourceKind::NotificationTopic);
    assert_eq!(resource.depends_on, vec!["upload_topic".to_string()]);

    assert_eq!(
        resource.attribute("name"),
        Some(&Expr::literal("{{ name_prefix }}-audit"))
    );
    assert_eq!(
        resource.attribute("subnets"),
        Some(&Expr::List(vec![
            Expr::literal("subnet-a"),
            Expr::Ref(Reference::new("extra", "id")),
        ]))
    );
    assert_eq!(resource.attribute("tags"), Some(&Expr::literal(json!(["a", "b"]))));
    assert_eq!(
        resource.attribute("display"),
        Some(&Expr::Concat(vec![
            Expr::literal("audit for "),
            Expr::reference("gateway", "arn"),
        ]))
    );
    assert_eq!(resource.attribute("single"), Some(&Expr::literal(json!(["only"]))));
}

#[test]
fn test_parse_nested_block_as_object() {
    let kdl = r#"
        resource "rule" kind="event-rule" {
            pattern {
                source "aws.s3"
                detail_type "Object Created"
            }
        }
    "#;

    let project = parse_kdl_string(kdl, "test".to_string()).unwrap();
    assert_eq!(
        project.resources[0].attribute("pattern"),
        Some(&Expr::literal(json!({
            "source": "aws.s3",
            "detail_type": "Object Created"
        })))
    );
}

#[test]
fn test_resource_requires_kind() {
    let kdl = r#"resource "x" { name "y" }"#;
    let err = parse_kdl_string(kdl, "test".to_string()).unwrap_err();
    assert!(err.to_string().contains("kind"));
}

#[test]
fn test_resource_unknown_kind() {
    let kdl = r#"resource "x" kind="database" {}"#;
    let err = parse_kdl_string(kdl, "test".to_string()).unwrap_err();
    assert!(matches!(err, FlowError::UnknownResourceKind(_)));
}

#[test]
fn test_duplicate_resource_is_rejected() {
    let kdl = r#"
        resource "x" kind="role" {}
        resource "x" kind="role" {}
    "#;
    let err = parse_kdl_string(kdl, "test".to_string()).unwrap_err();
    assert!(matches!(err, FlowError::DuplicateResource(name) if name == "x"));
}

#[test]
fn test_invalid_reference_is_rejected() {
    let kdl = r#"
        resource "x" kind="role" {
            arn (ref)"no_attribute"
        }
    "#;
    assert!(parse_kdl_string(kdl, "test".to_string()).is_err());
}

#[test]
fn test_parse_outputs() {
    let kdl = r#"
        output "gateway_ip" (ref)"gateway_instance.private_ip" description="private IP"
        output "mount" "mount " (ref)"gateway_instance.private_ip" ":/share"
    "#;

    let project = parse_kdl_string(kdl, "test".to_string()).unwrap();
    assert_eq!(project.outputs.len(), 2);

    let ip = &project.outputs[0];
    assert_eq!(ip.value, Expr::reference("gateway_instance", "private_ip"));
    assert_eq!(ip.description.as_deref(), Some("private IP"));

    let mount = &project.outputs[1];
    assert!(matches!(&mount.value, Expr::Concat(parts) if parts.len() == 3));
}

#[test]
fn test_output_without_value_is_rejected() {
    let kdl = r#"output "empty""#;
    assert!(parse_kdl_string(kdl, "test".to_string()).is_err());
}

#[test]
fn test_parse_kdl_file_uses_directory_name() {
    let dir = tempfile::tempdir().unwrap();
    let project_dir = dir.path().join("my-gateway");
    std::fs::create_dir(&project_dir).unwrap();
    let file = project_dir.join("gate.kdl");
    std::fs::write(&file, "topology \"file-gateway\"").unwrap();

    let project = parse_kdl_file(&file).unwrap();
    assert_eq!(project.name, "my-gateway");
}
