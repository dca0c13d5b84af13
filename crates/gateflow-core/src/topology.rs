//! 組み込みトポロジー
//!
//! `topology "file-gateway"` で宣言される固定のリソース構成です。
//! プライベートネットワーク上のマシンが、マネージドNFS経由で
//! オブジェクトストレージのバケットにファイルを書き込めるようにします。

use crate::error::{FlowError, Result};
use crate::model::{Expr, OutputSpec, ResourceDescriptor, ResourceKind, VariableKind, VariableSpec};
use crate::network::IngressPolicy;
use crate::variables::ResolvedVariables;
use serde_json::json;

/// ファイルゲートウェイ構成の名前
pub const FILE_GATEWAY: &str = "file-gateway";

/// キャッシュディスクを接続するデバイス名
pub const CACHE_DEVICE: &str = "/dev/sdf";

/// トポロジーが生成するリソースと出力
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub resources: Vec<ResourceDescriptor>,
    pub outputs: Vec<OutputSpec>,
}

/// トポロジーが暗黙に宣言する変数
pub fn builtin_variables(topology: &str) -> Result<Vec<VariableSpec>> {
    match topology {
        FILE_GATEWAY => Ok(file_gateway_variables()),
        other => Err(FlowError::UnknownTopology(other.to_string())),
    }
}

/// トポロジーを構築
pub fn build_topology(topology: &str, vars: &ResolvedVariables) -> Result<Topology> {
    match topology {
        FILE_GATEWAY => file_gateway(vars),
        other => Err(FlowError::UnknownTopology(other.to_string())),
    }
}

pub fn file_gateway_variables() -> Vec<VariableSpec> {
    vec![
        VariableSpec::required("region").describe("Region to provision in"),
        VariableSpec::required("vpc_id").describe("VPC hosting the gateway"),
        VariableSpec::required("subnet_id").describe("Subnet for the appliance and endpoint"),
        VariableSpec::required("subnet_cidr")
            .of_kind(VariableKind::Cidr)
            .describe("Only clients in this range may reach the share"),
        VariableSpec::required("bucket_name").describe("Bucket backing the file share"),
        VariableSpec::required("gateway_ami").describe("Storage gateway appliance image"),
        VariableSpec::optional("name_prefix", "gateflow"),
        VariableSpec::optional("instance_type", "m5.xlarge"),
        VariableSpec::optional("cache_volume_size", 150).of_kind(VariableKind::Integer),
        VariableSpec::optional("gateway_timezone", "GMT"),
        VariableSpec::optional("storage_class", "S3_STANDARD"),
    ]
}

fn require(vars: &ResolvedVariables, name: &str) -> Result<String> {
    vars.string(name)
        .ok_or_else(|| FlowError::VariableValidation(vec![format!("必須変数 '{}' が指定されていません", name)]))
}

/// ファイルゲートウェイ構成を構築
pub fn file_gateway(vars: &ResolvedVariables) -> Result<Topology> {
    let region = require(vars, "region")?;
    let vpc_id = require(vars, "vpc_id")?;
    let subnet_id = require(vars, "subnet_id")?;
    let bucket = require(vars, "bucket_name")?;
    let ami = require(vars, "gateway_ami")?;
    let cidr = vars.cidr("subnet_cidr").ok_or_else(|| {
        FlowError::VariableValidation(vec!["変数 'subnet_cidr' は CIDR 形式で指定してください".to_string()])
    })?;
    let prefix = vars.string("name_prefix").unwrap_or_else(|| "gateflow".to_string());
    let instance_type = vars
        .string("instance_type")
        .unwrap_or_else(|| "m5.xlarge".to_string());
    let cache_size = vars.integer("cache_volume_size").unwrap_or(150);
    let timezone = vars
        .string("gateway_timezone")
        .unwrap_or_else(|| "GMT".to_string());
    let storage_class = vars
        .string("storage_class")
        .unwrap_or_else(|| "S3_STANDARD".to_string());

    let bucket_arn = format!("arn:aws:s3:::{}", bucket);
    let sg_ids = || Expr::List(vec![Expr::reference("gateway_sg", "id")]);

    let resources = vec![
        // ネットワーク
        ResourceDescriptor::new("gateway_sg", ResourceKind::SecurityGroup)
            .with("name", format!("{}-gateway-sg", prefix))
            .with("description", "NFS file gateway access from the private subnet")
            .with("vpc_id", vpc_id.as_str())
            .with("ingress", Expr::Literal(IngressPolicy::file_gateway(cidr).to_value())),
        ResourceDescriptor::new("gateway_endpoint", ResourceKind::NetworkEndpoint)
            .with("vpc_id", vpc_id.as_str())
            .with("service", "storagegateway")
            .with("subnet_ids", Expr::literal(json!([subnet_id])))
            .with("security_group_ids", sg_ids())
            .with("private_dns", Expr::literal(true)),
        // アプライアンス
        ResourceDescriptor::new("gateway_instance", ResourceKind::ComputeInstance)
            .with("name", format!("{}-gateway", prefix))
            .with("image_id", ami.as_str())
            .with("instance_type", instance_type.as_str())
            .with("subnet_id", subnet_id.as_str())
            .with("security_group_ids", sg_ids()),
        ResourceDescriptor::new("cache_volume", ResourceKind::BlockVolume)
            .with("name", format!("{}-gateway-cache", prefix))
            .with(
                "availability_zone",
                Expr::reference("gateway_instance", "availability_zone"),
            )
            .with("size", Expr::literal(cache_size))
            .with("volume_type", "gp3"),
        ResourceDescriptor::new("cache_attachment", ResourceKind::VolumeAttachment)
            .with("device_name", CACHE_DEVICE)
            .with("instance_id", Expr::reference("gateway_instance", "id"))
            .with("volume_id", Expr::reference("cache_volume", "id")),
        // ゲートウェイ
        ResourceDescriptor::new("gateway", ResourceKind::Gateway)
            .with("name", format!("{}-file-gateway", prefix))
            .with("gateway_type", "FILE_S3")
            .with("timezone", timezone.as_str())
            .with("region", region.as_str())
            .with(
                "activation_ip",
                Expr::reference("gateway_instance", "private_ip"),
            )
            .with("endpoint_dns", Expr::reference("gateway_endpoint", "dns_name")),
        ResourceDescriptor::new("gateway_cache", ResourceKind::GatewayCache)
            .with("gateway_arn", Expr::reference("gateway", "arn"))
            .with("disk_path", Expr::reference("cache_attachment", "device_name")),
        // バケットへのアクセス権
        ResourceDescriptor::new("bucket_role", ResourceKind::Role)
            .with("name", format!("{}-gateway-bucket-access", prefix))
            .with("assume_service", "storagegateway.amazonaws.com"),
        ResourceDescriptor::new("bucket_access", ResourceKind::RolePolicy)
            .with("name", "bucket-access")
            .with("role_name", Expr::reference("bucket_role", "name"))
            .with(
                "actions",
                Expr::literal(json!([
                    "s3:GetAccelerateConfiguration",
                    "s3:GetBucketLocation",
                    "s3:GetBucketVersioning",
                    "s3:ListBucket",
                    "s3:ListBucketVersions",
                    "s3:ListBucketMultipartUploads",
                    "s3:AbortMultipartUpload",
                    "s3:DeleteObject",
                    "s3:DeleteObjectVersion",
                    "s3:GetObject",
                    "s3:GetObjectAcl",
                    "s3:GetObjectVersion",
                    "s3:ListMultipartUploadParts",
                    "s3:PutObject",
                    "s3:PutObjectAcl"
                ])),
            )
            .with(
                "resources",
                Expr::literal(json!([bucket_arn, format!("{}/*", bucket_arn)])),
            ),
        // ファイル共有
        ResourceDescriptor::new("file_share", ResourceKind::FileShare)
            .with("gateway_arn", Expr::reference("gateway", "arn"))
            .with("role_arn", Expr::reference("bucket_role", "arn"))
            .with("location_arn", bucket_arn.as_str())
            .with("client_list", Expr::literal(json!([cidr.to_string()])))
            .with("storage_class", storage_class.as_str())
            .with("squash", "RootSquash")
            .depends_on("gateway_cache")
            .depends_on("bucket_access"),
        // アップロード通知
        ResourceDescriptor::new("bucket_events", ResourceKind::BucketNotification)
            .with("bucket", bucket.as_str())
            .with("eventbridge", Expr::literal(true)),
        ResourceDescriptor::new("upload_topic", ResourceKind::NotificationTopic)
            .with("name", format!("{}-uploads", prefix)),
        ResourceDescriptor::new("upload_rule", ResourceKind::EventRule)
            .with("name", format!("{}-object-created", prefix))
            .with(
                "event_pattern",
                Expr::literal(json!({
                    "source": ["aws.s3"],
                    "detail-type": ["Object Created"],
                    "detail": { "bucket": { "name": [bucket] } }
                })),
            )
            .depends_on("bucket_events"),
        ResourceDescriptor::new("upload_topic_policy", ResourceKind::TopicPolicy)
            .with("topic_arn", Expr::reference("upload_topic", "arn"))
            .with("allow_service", "events.amazonaws.com")
            .with("source_arn", Expr::reference("upload_rule", "arn")),
        ResourceDescriptor::new("upload_target", ResourceKind::EventTarget)
            .with("rule_name", Expr::reference("upload_rule", "name"))
            .with("target_id", "upload-topic")
            .with("target_arn", Expr::reference("upload_topic", "arn"))
            .depends_on("upload_topic_policy"),
    ];

    let outputs = vec![
        OutputSpec::new(
            "gateway_ip",
            Expr::reference("gateway_instance", "private_ip"),
        )
        .describe("Private IP address of the gateway appliance"),
        OutputSpec::new(
            "mount_command",
            Expr::Concat(vec![
                Expr::literal("sudo mount -t nfs -o nolock,hard "),
                Expr::reference("gateway_instance", "private_ip"),
                Expr::literal(":"),
                Expr::reference("file_share", "path"),
                Expr::literal(" [MountPath]"),
            ]),
        )
        .describe("Command to mount the file share on a client"),
    ];

    Ok(Topology { resources, outputs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceGraph;
    use crate::network::Protocol;
    use crate::variables::{VariableSources, resolve_variables};
    use std::collections::BTreeMap;

    fn vars() -> ResolvedVariables {
        let file: BTreeMap<String, serde_json::Value> = [
            ("region", "eu-west-1"),
            ("vpc_id", "vpc-0abc"),
            ("subnet_id", "subnet-0abc"),
            ("subnet_cidr", "10.0.0.0/8"),
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
        resolve_variables(&file_gateway_variables(), &sources).unwrap()
    }

    #[test]
    fn test_file_gateway_graph_is_acyclic() {
        let topology = file_gateway(&vars()).unwrap();
        let graph = ResourceGraph::build(topology.resources.clone()).unwrap();
        graph.validate_outputs(&topology.outputs).unwrap();

        assert_eq!(graph.len(), 15);
        let order = graph.topological_order();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("gateway_sg") < pos("gateway_instance"));
        assert!(pos("gateway_instance") < pos("gateway"));
        assert!(pos("gateway_endpoint") < pos("gateway"));
        assert!(pos("cache_attachment") < pos("gateway_cache"));
        assert!(pos("gateway_cache") < pos("file_share"));
        assert!(pos("bucket_access") < pos("file_share"));
        assert!(pos("upload_topic_policy") < pos("upload_target"));
    }

    #[test]
    fn test_security_group_is_restricted_to_subnet() {
        let topology = file_gateway(&vars()).unwrap();
        let sg = topology
            .resources
            .iter()
            .find(|r| r.name == "gateway_sg")
            .unwrap();
        let Some(Expr::Literal(ingress)) = sg.attribute("ingress") else {
            panic!("ingress should be a literal");
        };
        let policy = IngressPolicy::from_value(ingress).unwrap();

        assert!(!policy.allows("192.168.1.1".parse().unwrap(), Protocol::Tcp, 2049));
        assert!(policy.allows("10.5.5.5".parse().unwrap(), Protocol::Tcp, 2049));
    }

    #[test]
    fn test_outputs() {
        let topology = file_gateway(&vars()).unwrap();
        let names: Vec<&str> = topology.outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["gateway_ip", "mount_command"]);
    }

    #[test]
    fn test_defaults_are_used() {
        let topology = file_gateway(&vars()).unwrap();
        let instance = topology
            .resources
            .iter()
            .find(|r| r.name == "gateway_instance")
            .unwrap();
        assert_eq!(instance.attribute("instance_type"), Some(&Expr::literal("m5.xlarge")));
        assert_eq!(instance.attribute("name"), Some(&Expr::literal("gateflow-gateway")));
    }

    #[test]
    fn test_unknown_topology() {
        assert!(matches!(
            builtin_variables("web-server"),
            Err(FlowError::UnknownTopology(_))
        ));
    }
}
