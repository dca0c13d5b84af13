//! AWS provider implementation
//!
//! Maps every resource kind onto aws CLI operations. Resources without a
//! single provider id use composite ids joined with `|`.

use crate::activation::{ActivationRequest, fetch_activation_key};
use crate::awscli::{Args, AwsCli, field, string_field};
use crate::documents::{
    TOPIC_STATEMENT_ID, allow_policy, assume_role_policy, has_publish_statement, ip_permissions,
    merge_topic_policy, publish_statement,
};
use crate::error::AwsError;
use async_trait::async_trait;
use gateflow_cloud::{
    AuthStatus, CloudError, ProviderResource, Readiness, ResourceProvider, ResourceRequest, Result,
};
use gateflow_core::{IngressPolicy, ResourceKind};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use tracing::{debug, info};

const ID_SEPARATOR: char = '|';
const MAX_CLIENT_TOKEN: usize = 64;

/// AWS provider
pub struct AwsProvider {
    cli: AwsCli,
}

impl AwsProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            cli: AwsCli::new(region),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.cli = self.cli.with_profile(profile);
        self
    }

    async fn call(
        &self,
        resource: &str,
        service: &str,
        operation: &str,
        args: Args,
    ) -> Result<Value> {
        self.cli
            .run(service, operation, &args.build())
            .await
            .map_err(|e| e.into_cloud(resource))
    }

    /// Like [`call`](Self::call) but a missing resource yields `None`
    async fn call_optional(
        &self,
        resource: &str,
        service: &str,
        operation: &str,
        args: Args,
    ) -> Result<Option<Value>> {
        match self.cli.run(service, operation, &args.build()).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() || gateway_missing(&e) => Ok(None),
            Err(e) => Err(e.into_cloud(resource)),
        }
    }

    // ---- security group ----

    async fn create_security_group(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let name = required(request, "name")?;
        let vpc_id = required(request, "vpc_id")?;
        let args = Args::new()
            .arg("--group-name", name)
            .arg("--description", request.str("description").unwrap_or(name))
            .arg("--vpc-id", vpc_id);

        let group_id = match self
            .cli
            .run("ec2", "create-security-group", &args.build())
            .await
        {
            Ok(out) => string_field(&out, "create-security-group", &["GroupId"])
                .map_err(|e| e.into_cloud(&request.name))?,
            // 前回の試行で作成済み
            Err(e) if e.code() == Some("InvalidGroup.Duplicate") => {
                let out = self
                    .call(
                        &request.name,
                        "ec2",
                        "describe-security-groups",
                        Args::new().list(
                            "--filters",
                            &[
                                format!("Name=group-name,Values={}", name),
                                format!("Name=vpc-id,Values={}", vpc_id),
                            ],
                        ),
                    )
                    .await?;
                info!(resource = %request.name, "Adopting existing security group");
                string_field(&out, "describe-security-groups", &["SecurityGroups", "0", "GroupId"])
                    .map_err(|e| e.into_cloud(&request.name))?
            }
            Err(e) => return Err(e.into_cloud(&request.name)),
        };

        if let Some(ingress) = request.attribute("ingress") {
            let current = self.security_group_permissions(&request.name, &group_id).await?;
            if current.as_array().is_none_or(|p| p.is_empty()) {
                self.authorize_ingress(&request.name, &group_id, ingress).await?;
            }
        }

        Ok(ProviderResource::new(group_id).with_output("name", name))
    }

    async fn security_group_permissions(&self, resource: &str, group_id: &str) -> Result<Value> {
        let out = self
            .call(
                resource,
                "ec2",
                "describe-security-groups",
                Args::new().arg("--group-ids", group_id),
            )
            .await?;
        Ok(field(&out, &["SecurityGroups", "0", "IpPermissions"])
            .cloned()
            .unwrap_or(Value::Array(Vec::new())))
    }

    async fn authorize_ingress(&self, resource: &str, group_id: &str, ingress: &Value) -> Result<()> {
        let policy = IngressPolicy::from_value(ingress)?;
        if policy.rules.is_empty() {
            return Ok(());
        }
        self.call(
            resource,
            "ec2",
            "authorize-security-group-ingress",
            Args::new()
                .arg("--group-id", group_id)
                .json("--ip-permissions", &ip_permissions(&policy)),
        )
        .await?;
        Ok(())
    }

    async fn update_security_group(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> Result<ProviderResource> {
        let current = self.security_group_permissions(&request.name, id).await?;
        if current.as_array().is_some_and(|p| !p.is_empty()) {
            self.call(
                &request.name,
                "ec2",
                "revoke-security-group-ingress",
                Args::new()
                    .arg("--group-id", id)
                    .json("--ip-permissions", &current),
            )
            .await?;
        }
        if let Some(ingress) = request.attribute("ingress") {
            self.authorize_ingress(&request.name, id, ingress).await?;
        }
        Ok(ProviderResource::new(id))
    }

    // ---- VPC endpoint ----

    async fn create_endpoint(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let service = format!(
            "com.amazonaws.{}.{}",
            self.cli.region(),
            required(request, "service")?
        );
        let private_dns = request
            .attribute("private_dns")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let args = Args::new()
            .arg("--vpc-endpoint-type", "Interface")
            .arg("--vpc-id", required(request, "vpc_id")?)
            .arg("--service-name", service)
            .list("--subnet-ids", &request.strings("subnet_ids"))
            .list("--security-group-ids", &request.strings("security_group_ids"))
            .flag(if private_dns {
                "--private-dns-enabled"
            } else {
                "--no-private-dns-enabled"
            })
            .arg("--client-token", client_token(request));
        let out = self
            .call(&request.name, "ec2", "create-vpc-endpoint", args)
            .await?;
        endpoint_resource(field(&out, &["VpcEndpoint"]).unwrap_or(&Value::Null))
            .map_err(|e| e.into_cloud(&request.name))
    }

    async fn describe_endpoint(&self, resource: &str, id: &str) -> Result<Option<Value>> {
        let out = self
            .call_optional(
                resource,
                "ec2",
                "describe-vpc-endpoints",
                Args::new().arg("--vpc-endpoint-ids", id),
            )
            .await?;
        Ok(out.and_then(|o| field(&o, &["VpcEndpoints", "0"]).cloned()))
    }

    async fn update_endpoint(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> Result<ProviderResource> {
        let current = self
            .describe_endpoint(&request.name, id)
            .await?
            .ok_or_else(|| CloudError::rejected(&request.name, format!("endpoint {} not found", id)))?;

        let current_subnets = strings_at(&current, &["SubnetIds"], None);
        let current_groups = strings_at(&current, &["Groups"], Some("GroupId"));
        let (add_subnets, remove_subnets) = diff_sets(&current_subnets, &request.strings("subnet_ids"));
        let (add_groups, remove_groups) =
            diff_sets(&current_groups, &request.strings("security_group_ids"));

        let mut args = Args::new()
            .arg("--vpc-endpoint-id", id)
            .list("--add-subnet-ids", &add_subnets)
            .list("--remove-subnet-ids", &remove_subnets)
            .list("--add-security-group-ids", &add_groups)
            .list("--remove-security-group-ids", &remove_groups);
        if changed.iter().any(|c| c == "private_dns") {
            let enabled = request
                .attribute("private_dns")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            args = args.flag(if enabled {
                "--private-dns-enabled"
            } else {
                "--no-private-dns-enabled"
            });
        }
        self.call(&request.name, "ec2", "modify-vpc-endpoint", args)
            .await?;

        endpoint_resource(&current).map_err(|e| e.into_cloud(&request.name))
    }

    // ---- instance ----

    async fn create_instance(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let mut args = Args::new()
            .arg("--image-id", required(request, "image_id")?)
            .arg("--count", "1")
            .opt("--instance-type", request.str("instance_type"))
            .opt("--subnet-id", request.str("subnet_id"))
            .list("--security-group-ids", &request.strings("security_group_ids"))
            .arg("--client-token", client_token(request));
        if let Some(name) = request.str("name") {
            args = args.json("--tag-specifications", &name_tags("instance", name));
        }
        let out = self
            .call(&request.name, "ec2", "run-instances", args)
            .await?;
        instance_resource(field(&out, &["Instances", "0"]).unwrap_or(&Value::Null))
            .map_err(|e| e.into_cloud(&request.name))
    }

    async fn describe_instance(&self, resource: &str, id: &str) -> Result<Option<Value>> {
        let out = self
            .call_optional(
                resource,
                "ec2",
                "describe-instances",
                Args::new().arg("--instance-ids", id),
            )
            .await?;
        Ok(out
            .and_then(|o| field(&o, &["Reservations", "0", "Instances", "0"]).cloned())
            .filter(|i| {
                field(i, &["State", "Name"]).and_then(Value::as_str) != Some("terminated")
            }))
    }

    async fn update_instance(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> Result<ProviderResource> {
        if changed.iter().any(|c| c == "name")
            && let Some(name) = request.str("name")
        {
            self.tag_name(&request.name, id, name).await?;
        }
        if changed.iter().any(|c| c == "security_group_ids") {
            self.call(
                &request.name,
                "ec2",
                "modify-instance-attribute",
                Args::new()
                    .arg("--instance-id", id)
                    .list("--groups", &request.strings("security_group_ids")),
            )
            .await?;
        }
        let current = self
            .describe_instance(&request.name, id)
            .await?
            .ok_or_else(|| CloudError::rejected(&request.name, format!("instance {} not found", id)))?;
        instance_resource(&current).map_err(|e| e.into_cloud(&request.name))
    }

    async fn tag_name(&self, resource: &str, id: &str, name: &str) -> Result<()> {
        self.call(
            resource,
            "ec2",
            "create-tags",
            Args::new()
                .arg("--resources", id)
                .json("--tags", &json!([{ "Key": "Name", "Value": name }])),
        )
        .await?;
        Ok(())
    }

    // ---- volume ----

    async fn create_volume(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let mut args = Args::new()
            .arg("--availability-zone", required(request, "availability_zone")?)
            .opt("--size", request.attribute("size").map(plain))
            .opt("--volume-type", request.str("volume_type"))
            .arg("--client-token", client_token(request));
        if let Some(name) = request.str("name") {
            args = args.json("--tag-specifications", &name_tags("volume", name));
        }
        let out = self
            .call(&request.name, "ec2", "create-volume", args)
            .await?;
        let id = string_field(&out, "create-volume", &["VolumeId"])
            .map_err(|e| e.into_cloud(&request.name))?;
        Ok(ProviderResource::new(id))
    }

    async fn describe_volume(&self, resource: &str, id: &str) -> Result<Option<Value>> {
        let out = self
            .call_optional(
                resource,
                "ec2",
                "describe-volumes",
                Args::new().arg("--volume-ids", id),
            )
            .await?;
        Ok(out.and_then(|o| field(&o, &["Volumes", "0"]).cloned()))
    }

    async fn update_volume(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> Result<ProviderResource> {
        if changed.iter().any(|c| c == "size" || c == "volume_type") {
            self.call(
                &request.name,
                "ec2",
                "modify-volume",
                Args::new()
                    .arg("--volume-id", id)
                    .opt("--size", request.attribute("size").map(plain))
                    .opt("--volume-type", request.str("volume_type")),
            )
            .await?;
        }
        if changed.iter().any(|c| c == "name")
            && let Some(name) = request.str("name")
        {
            self.tag_name(&request.name, id, name).await?;
        }
        Ok(ProviderResource::new(id))
    }

    // ---- volume attachment ----

    async fn create_attachment(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let volume_id = required(request, "volume_id")?;
        let instance_id = required(request, "instance_id")?;
        let device = required(request, "device_name")?;
        let id = join_id(&[volume_id, instance_id]);

        if self.read_attachment(&request.name, &id).await?.is_none() {
            self.call(
                &request.name,
                "ec2",
                "attach-volume",
                Args::new()
                    .arg("--device", device)
                    .arg("--instance-id", instance_id)
                    .arg("--volume-id", volume_id),
            )
            .await?;
        }
        Ok(ProviderResource::new(id).with_output("device_name", device))
    }

    async fn read_attachment(&self, resource: &str, id: &str) -> Result<Option<ProviderResource>> {
        let [volume_id, instance_id] = split_id::<2>(id)?;
        let Some(volume) = self.describe_volume(resource, volume_id).await? else {
            return Ok(None);
        };
        let attachment = field(&volume, &["Attachments"])
            .and_then(Value::as_array)
            .and_then(|items| {
                items.iter().find(|a| {
                    a.get("InstanceId").and_then(Value::as_str) == Some(instance_id)
                        && matches!(
                            a.get("State").and_then(Value::as_str),
                            Some("attaching" | "attached")
                        )
                })
            });
        Ok(attachment.map(|a| {
            let mut resource = ProviderResource::new(id);
            if let Some(device) = a.get("Device") {
                resource = resource.with_output("device_name", device.clone());
            }
            resource
        }))
    }

    async fn delete_attachment(&self, id: &str) -> Result<()> {
        if self.read_attachment(id, id).await?.is_none() {
            return Ok(());
        }
        let [volume_id, instance_id] = split_id::<2>(id)?;
        self.call(
            id,
            "ec2",
            "detach-volume",
            Args::new()
                .arg("--volume-id", volume_id)
                .arg("--instance-id", instance_id),
        )
        .await?;
        Ok(())
    }

    // ---- IAM ----

    async fn create_role(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let name = required(request, "name")?;
        let out = self
            .call(
                &request.name,
                "iam",
                "create-role",
                Args::new()
                    .arg("--role-name", name)
                    .json(
                        "--assume-role-policy-document",
                        &assume_role_policy(required(request, "assume_service")?),
                    ),
            )
            .await?;
        role_resource(field(&out, &["Role"]).unwrap_or(&Value::Null))
            .map_err(|e| e.into_cloud(&request.name))
    }

    async fn update_role(&self, id: &str, request: &ResourceRequest) -> Result<ProviderResource> {
        self.call(
            &request.name,
            "iam",
            "update-assume-role-policy",
            Args::new().arg("--role-name", id).json(
                "--policy-document",
                &assume_role_policy(required(request, "assume_service")?),
            ),
        )
        .await?;
        self.read_role(&request.name, id)
            .await?
            .ok_or_else(|| CloudError::rejected(&request.name, format!("role {} not found", id)))
    }

    async fn read_role(&self, resource: &str, id: &str) -> Result<Option<ProviderResource>> {
        let out = self
            .call_optional(resource, "iam", "get-role", Args::new().arg("--role-name", id))
            .await?;
        out.map(|o| role_resource(field(&o, &["Role"]).unwrap_or(&Value::Null)))
            .transpose()
            .map_err(|e| e.into_cloud(resource))
    }

    async fn put_role_policy(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let role = required(request, "role_name")?;
        let policy = required(request, "name")?;
        self.call(
            &request.name,
            "iam",
            "put-role-policy",
            Args::new()
                .arg("--role-name", role)
                .arg("--policy-name", policy)
                .json(
                    "--policy-document",
                    &allow_policy(&request.strings("actions"), &request.strings("resources")),
                ),
        )
        .await?;
        Ok(ProviderResource::new(join_id(&[role, policy])).with_output("name", policy))
    }

    // ---- storage gateway ----

    async fn activate_gateway(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let gateway_type = request.str("gateway_type").unwrap_or("FILE_S3");
        let region = request.str("region").unwrap_or(self.cli.region());
        let activation = ActivationRequest {
            appliance_ip: required(request, "activation_ip")?,
            region,
            gateway_type,
            endpoint_dns: request.str("endpoint_dns"),
        };
        // アプライアンスの起動直後は応答しないことがある
        let key = fetch_activation_key(&activation)
            .await
            .map_err(|e| CloudError::transient(&request.name, e.to_string()))?;

        let out = self
            .call(
                &request.name,
                "storagegateway",
                "activate-gateway",
                Args::new()
                    .arg("--activation-key", key)
                    .arg("--gateway-name", required(request, "name")?)
                    .arg("--gateway-timezone", request.str("timezone").unwrap_or("GMT"))
                    .arg("--gateway-region", region)
                    .arg("--gateway-type", gateway_type),
            )
            .await?;
        let arn = string_field(&out, "activate-gateway", &["GatewayARN"])
            .map_err(|e| e.into_cloud(&request.name))?;
        info!(resource = %request.name, %arn, "Gateway activated");
        Ok(ProviderResource::new(arn.clone()).with_output("arn", arn))
    }

    async fn describe_gateway(&self, resource: &str, arn: &str) -> Result<Option<Value>> {
        self.call_optional(
            resource,
            "storagegateway",
            "describe-gateway-information",
            Args::new().arg("--gateway-arn", arn),
        )
        .await
    }

    async fn update_gateway(&self, id: &str, request: &ResourceRequest) -> Result<ProviderResource> {
        self.call(
            &request.name,
            "storagegateway",
            "update-gateway-information",
            Args::new()
                .arg("--gateway-arn", id)
                .opt("--gateway-name", request.str("name"))
                .opt("--gateway-timezone", request.str("timezone")),
        )
        .await?;
        Ok(ProviderResource::new(id).with_output("arn", id))
    }

    async fn add_cache(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let gateway_arn = required(request, "gateway_arn")?;
        let disks = self.local_disks(&request.name, gateway_arn).await?;
        let disk = select_cache_disk(&disks, request.str("disk_path")).ok_or_else(|| {
            // アタッチしたディスクがゲートウェイから見えるまで時間がかかる
            CloudError::transient(&request.name, "no local disk available for cache yet")
        })?;
        let disk_id = disk
            .get("DiskId")
            .and_then(Value::as_str)
            .ok_or_else(|| CloudError::rejected(&request.name, "local disk without DiskId"))?;

        if disk.get("DiskAllocationType").and_then(Value::as_str) != Some(CACHE_ALLOCATION) {
            self.call(
                &request.name,
                "storagegateway",
                "add-cache",
                Args::new()
                    .arg("--gateway-arn", gateway_arn)
                    .list("--disk-ids", &[disk_id.to_string()]),
            )
            .await?;
        }
        Ok(ProviderResource::new(join_id(&[gateway_arn, disk_id])))
    }

    async fn local_disks(&self, resource: &str, gateway_arn: &str) -> Result<Vec<Value>> {
        let out = self
            .call(
                resource,
                "storagegateway",
                "list-local-disks",
                Args::new().arg("--gateway-arn", gateway_arn),
            )
            .await?;
        Ok(field(&out, &["Disks"])
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_cache(&self, id: &str) -> Result<Option<ProviderResource>> {
        let [gateway_arn, disk_id] = split_id::<2>(id)?;
        if self.describe_gateway(id, gateway_arn).await?.is_none() {
            return Ok(None);
        }
        let disks = self.local_disks(id, gateway_arn).await?;
        let allocated = disks.iter().any(|d| {
            d.get("DiskId").and_then(Value::as_str) == Some(disk_id)
                && d.get("DiskAllocationType").and_then(Value::as_str) == Some(CACHE_ALLOCATION)
        });
        Ok(allocated.then(|| ProviderResource::new(id)))
    }

    async fn create_file_share(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let out = self
            .call(
                &request.name,
                "storagegateway",
                "create-nfs-file-share",
                Args::new()
                    .arg("--client-token", client_token(request))
                    .arg("--gateway-arn", required(request, "gateway_arn")?)
                    .arg("--role", required(request, "role_arn")?)
                    .arg("--location-arn", required(request, "location_arn")?)
                    .list("--client-list", &request.strings("client_list"))
                    .opt("--default-storage-class", request.str("storage_class"))
                    .opt("--squash", request.str("squash")),
            )
            .await?;
        let arn = string_field(&out, "create-nfs-file-share", &["FileShareARN"])
            .map_err(|e| e.into_cloud(&request.name))?;
        self.file_share_resource(&request.name, &arn).await
    }

    async fn describe_file_share(&self, resource: &str, arn: &str) -> Result<Option<Value>> {
        let out = self
            .call_optional(
                resource,
                "storagegateway",
                "describe-nfs-file-shares",
                Args::new().list("--file-share-arn-list", &[arn.to_string()]),
            )
            .await?;
        Ok(out.and_then(|o| field(&o, &["NFSFileShareInfoList", "0"]).cloned()))
    }

    async fn file_share_resource(&self, resource: &str, arn: &str) -> Result<ProviderResource> {
        let mut share = ProviderResource::new(arn).with_output("arn", arn);
        if let Some(info) = self.describe_file_share(resource, arn).await?
            && let Some(path) = info.get("Path")
        {
            share = share.with_output("path", path.clone());
        }
        Ok(share)
    }

    async fn update_file_share(&self, id: &str, request: &ResourceRequest) -> Result<ProviderResource> {
        self.call(
            &request.name,
            "storagegateway",
            "update-nfs-file-share",
            Args::new()
                .arg("--file-share-arn", id)
                .list("--client-list", &request.strings("client_list"))
                .opt("--default-storage-class", request.str("storage_class"))
                .opt("--squash", request.str("squash")),
        )
        .await?;
        self.file_share_resource(&request.name, id).await
    }

    // ---- notifications ----

    async fn put_bucket_notification(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let bucket = required(request, "bucket")?;
        let eventbridge = request
            .attribute("eventbridge")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let configuration = if eventbridge {
            json!({ "EventBridgeConfiguration": {} })
        } else {
            json!({})
        };
        self.call(
            &request.name,
            "s3api",
            "put-bucket-notification-configuration",
            Args::new()
                .arg("--bucket", bucket)
                .json("--notification-configuration", &configuration),
        )
        .await?;
        Ok(ProviderResource::new(bucket))
    }

    async fn put_rule(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let name = required(request, "name")?;
        let pattern = request
            .attribute("event_pattern")
            .ok_or_else(|| missing(request, "event_pattern"))?;
        let out = self
            .call(
                &request.name,
                "events",
                "put-rule",
                Args::new()
                    .arg("--name", name)
                    .json("--event-pattern", pattern)
                    .arg("--state", "ENABLED"),
            )
            .await?;
        let arn = string_field(&out, "put-rule", &["RuleArn"])
            .map_err(|e| e.into_cloud(&request.name))?;
        Ok(ProviderResource::new(name)
            .with_output("arn", arn)
            .with_output("name", name))
    }

    async fn put_target(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let rule = required(request, "rule_name")?;
        let target_id = required(request, "target_id")?;
        let out = self
            .call(
                &request.name,
                "events",
                "put-targets",
                Args::new().arg("--rule", rule).json(
                    "--targets",
                    &json!([{ "Id": target_id, "Arn": required(request, "target_arn")? }]),
                ),
            )
            .await?;
        if field(&out, &["FailedEntryCount"]).and_then(Value::as_u64) > Some(0) {
            let message = field(&out, &["FailedEntries", "0", "ErrorMessage"])
                .and_then(Value::as_str)
                .unwrap_or("target rejected");
            return Err(CloudError::rejected(&request.name, message));
        }
        Ok(ProviderResource::new(join_id(&[rule, target_id])))
    }

    async fn create_topic(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let name = required(request, "name")?;
        let out = self
            .call(
                &request.name,
                "sns",
                "create-topic",
                Args::new().arg("--name", name),
            )
            .await?;
        let arn = string_field(&out, "create-topic", &["TopicArn"])
            .map_err(|e| e.into_cloud(&request.name))?;
        Ok(ProviderResource::new(arn.clone())
            .with_output("arn", arn)
            .with_output("name", name))
    }

    async fn topic_policy(&self, resource: &str, topic_arn: &str) -> Result<Option<Option<String>>> {
        let out = self
            .call_optional(
                resource,
                "sns",
                "get-topic-attributes",
                Args::new().arg("--topic-arn", topic_arn),
            )
            .await?;
        Ok(out.map(|o| {
            field(&o, &["Attributes", "Policy"])
                .and_then(Value::as_str)
                .map(str::to_string)
        }))
    }

    async fn set_topic_policy(&self, resource: &str, topic_arn: &str, policy: &Value) -> Result<()> {
        self.call(
            resource,
            "sns",
            "set-topic-attributes",
            Args::new()
                .arg("--topic-arn", topic_arn)
                .arg("--attribute-name", "Policy")
                .json("--attribute-value", policy),
        )
        .await?;
        Ok(())
    }

    async fn put_topic_policy(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        let topic_arn = required(request, "topic_arn")?;
        let existing = self
            .topic_policy(&request.name, topic_arn)
            .await?
            .ok_or_else(|| CloudError::rejected(&request.name, format!("topic {} not found", topic_arn)))?;
        let statement = publish_statement(
            topic_arn,
            required(request, "allow_service")?,
            request.str("source_arn"),
        );
        let policy = merge_topic_policy(existing.as_deref(), Some(statement));
        self.set_topic_policy(&request.name, topic_arn, &policy)
            .await?;
        Ok(ProviderResource::new(topic_arn).with_output("sid", TOPIC_STATEMENT_ID))
    }
}

const CACHE_ALLOCATION: &str = "CACHE STORAGE";

#[async_trait]
impl ResourceProvider for AwsProvider {
    fn name(&self) -> &str {
        "aws"
    }

    fn display_name(&self) -> &str {
        "Amazon Web Services"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        match self.cli.check_auth().await {
            Ok(identity) => Ok(AuthStatus::ok(format!(
                "{} ({})",
                identity.account, identity.arn
            ))),
            Err(AwsError::CliNotFound) => Err(AwsError::CliNotFound.into_cloud("aws")),
            Err(e) => Ok(AuthStatus::failed(e.to_string())),
        }
    }

    #[tracing::instrument(skip_all, fields(resource = %request.name, kind = %request.kind))]
    async fn create(&self, request: &ResourceRequest) -> Result<ProviderResource> {
        debug!("Creating");
        match request.kind {
            ResourceKind::SecurityGroup => self.create_security_group(request).await,
            ResourceKind::NetworkEndpoint => self.create_endpoint(request).await,
            ResourceKind::ComputeInstance => self.create_instance(request).await,
            ResourceKind::BlockVolume => self.create_volume(request).await,
            ResourceKind::VolumeAttachment => self.create_attachment(request).await,
            ResourceKind::Role => self.create_role(request).await,
            ResourceKind::RolePolicy => self.put_role_policy(request).await,
            ResourceKind::Gateway => self.activate_gateway(request).await,
            ResourceKind::GatewayCache => self.add_cache(request).await,
            ResourceKind::FileShare => self.create_file_share(request).await,
            ResourceKind::BucketNotification => self.put_bucket_notification(request).await,
            ResourceKind::EventRule => self.put_rule(request).await,
            ResourceKind::EventTarget => self.put_target(request).await,
            ResourceKind::NotificationTopic => self.create_topic(request).await,
            ResourceKind::TopicPolicy => self.put_topic_policy(request).await,
        }
    }

    async fn read(&self, kind: ResourceKind, id: &str) -> Result<Option<ProviderResource>> {
        match kind {
            ResourceKind::SecurityGroup => Ok(self
                .call_optional(
                    id,
                    "ec2",
                    "describe-security-groups",
                    Args::new().arg("--group-ids", id),
                )
                .await?
                .map(|_| ProviderResource::new(id))),
            ResourceKind::NetworkEndpoint => self
                .describe_endpoint(id, id)
                .await?
                .map(|e| endpoint_resource(&e))
                .transpose()
                .map_err(|e| e.into_cloud(id)),
            ResourceKind::ComputeInstance => self
                .describe_instance(id, id)
                .await?
                .map(|i| instance_resource(&i))
                .transpose()
                .map_err(|e| e.into_cloud(id)),
            ResourceKind::BlockVolume => Ok(self
                .describe_volume(id, id)
                .await?
                .map(|_| ProviderResource::new(id))),
            ResourceKind::VolumeAttachment => self.read_attachment(id, id).await,
            ResourceKind::Role => self.read_role(id, id).await,
            ResourceKind::RolePolicy => {
                let [role, policy] = split_id::<2>(id)?;
                Ok(self
                    .call_optional(
                        id,
                        "iam",
                        "get-role-policy",
                        Args::new().arg("--role-name", role).arg("--policy-name", policy),
                    )
                    .await?
                    .map(|_| ProviderResource::new(id).with_output("name", policy)))
            }
            ResourceKind::Gateway => Ok(self
                .describe_gateway(id, id)
                .await?
                .map(|_| ProviderResource::new(id).with_output("arn", id))),
            ResourceKind::GatewayCache => self.read_cache(id).await,
            ResourceKind::FileShare => match self.describe_file_share(id, id).await? {
                Some(_) => self.file_share_resource(id, id).await.map(Some),
                None => Ok(None),
            },
            ResourceKind::BucketNotification => {
                let out = self
                    .call_optional(
                        id,
                        "s3api",
                        "get-bucket-notification-configuration",
                        Args::new().arg("--bucket", id),
                    )
                    .await?;
                Ok(out
                    .filter(|o| o.get("EventBridgeConfiguration").is_some())
                    .map(|_| ProviderResource::new(id)))
            }
            ResourceKind::EventRule => {
                let out = self
                    .call_optional(id, "events", "describe-rule", Args::new().arg("--name", id))
                    .await?;
                Ok(out.map(|o| {
                    let mut rule = ProviderResource::new(id).with_output("name", id);
                    if let Some(arn) = o.get("Arn") {
                        rule = rule.with_output("arn", arn.clone());
                    }
                    rule
                }))
            }
            ResourceKind::EventTarget => {
                let [rule, target_id] = split_id::<2>(id)?;
                let out = self
                    .call_optional(
                        id,
                        "events",
                        "list-targets-by-rule",
                        Args::new().arg("--rule", rule),
                    )
                    .await?;
                let present = out
                    .as_ref()
                    .and_then(|o| field(o, &["Targets"]))
                    .and_then(Value::as_array)
                    .is_some_and(|targets| {
                        targets
                            .iter()
                            .any(|t| t.get("Id").and_then(Value::as_str) == Some(target_id))
                    });
                Ok(present.then(|| ProviderResource::new(id)))
            }
            ResourceKind::NotificationTopic => Ok(self
                .topic_policy(id, id)
                .await?
                .map(|_| ProviderResource::new(id).with_output("arn", id))),
            ResourceKind::TopicPolicy => Ok(self
                .topic_policy(id, id)
                .await?
                .flatten()
                .filter(|policy| has_publish_statement(policy))
                .map(|_| ProviderResource::new(id))),
        }
    }

    #[tracing::instrument(skip_all, fields(resource = %request.name, kind = %request.kind, %id))]
    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> Result<ProviderResource> {
        debug!(changed = ?changed, "Updating");
        match request.kind {
            ResourceKind::SecurityGroup => self.update_security_group(id, request).await,
            ResourceKind::NetworkEndpoint => self.update_endpoint(id, request, changed).await,
            ResourceKind::ComputeInstance => self.update_instance(id, request, changed).await,
            ResourceKind::BlockVolume => self.update_volume(id, request, changed).await,
            ResourceKind::Role => self.update_role(id, request).await,
            ResourceKind::RolePolicy => self.put_role_policy(request).await,
            ResourceKind::Gateway => self.update_gateway(id, request).await,
            ResourceKind::FileShare => self.update_file_share(id, request).await,
            ResourceKind::BucketNotification => self.put_bucket_notification(request).await,
            ResourceKind::EventRule => self.put_rule(request).await,
            ResourceKind::EventTarget => self.put_target(request).await,
            ResourceKind::TopicPolicy => self.put_topic_policy(request).await,
            ResourceKind::VolumeAttachment
            | ResourceKind::GatewayCache
            | ResourceKind::NotificationTopic => Err(CloudError::rejected(
                &request.name,
                format!("{} does not support in-place updates", request.kind),
            )),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        debug!("Deleting");
        let (service, operation, args) = match kind {
            ResourceKind::SecurityGroup => (
                "ec2",
                "delete-security-group",
                Args::new().arg("--group-id", id),
            ),
            ResourceKind::NetworkEndpoint => (
                "ec2",
                "delete-vpc-endpoints",
                Args::new().arg("--vpc-endpoint-ids", id),
            ),
            ResourceKind::ComputeInstance => (
                "ec2",
                "terminate-instances",
                Args::new().arg("--instance-ids", id),
            ),
            ResourceKind::BlockVolume => ("ec2", "delete-volume", Args::new().arg("--volume-id", id)),
            ResourceKind::VolumeAttachment => return self.delete_attachment(id).await,
            ResourceKind::Role => ("iam", "delete-role", Args::new().arg("--role-name", id)),
            ResourceKind::RolePolicy => {
                let [role, policy] = split_id::<2>(id)?;
                (
                    "iam",
                    "delete-role-policy",
                    Args::new().arg("--role-name", role).arg("--policy-name", policy),
                )
            }
            ResourceKind::Gateway => {
                if self.describe_gateway(id, id).await?.is_none() {
                    return Ok(());
                }
                (
                    "storagegateway",
                    "delete-gateway",
                    Args::new().arg("--gateway-arn", id),
                )
            }
            ResourceKind::GatewayCache => {
                // A cache disk cannot be removed on its own; it goes away with the gateway
                debug!("Cache disks are released together with the gateway");
                return Ok(());
            }
            ResourceKind::FileShare => (
                "storagegateway",
                "delete-file-share",
                Args::new().arg("--file-share-arn", id),
            ),
            ResourceKind::BucketNotification => (
                "s3api",
                "put-bucket-notification-configuration",
                Args::new()
                    .arg("--bucket", id)
                    .json("--notification-configuration", &json!({})),
            ),
            ResourceKind::EventRule => ("events", "delete-rule", Args::new().arg("--name", id)),
            ResourceKind::EventTarget => {
                let [rule, target_id] = split_id::<2>(id)?;
                (
                    "events",
                    "remove-targets",
                    Args::new().arg("--rule", rule).list("--ids", &[target_id.to_string()]),
                )
            }
            ResourceKind::NotificationTopic => {
                ("sns", "delete-topic", Args::new().arg("--topic-arn", id))
            }
            ResourceKind::TopicPolicy => {
                let Some(existing) = self.topic_policy(id, id).await? else {
                    return Ok(());
                };
                let policy = merge_topic_policy(existing.as_deref(), None);
                return self.set_topic_policy(id, id, &policy).await;
            }
        };

        match self.cli.run(service, operation, &args.build()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() || gateway_missing(&e) => {
                debug!("Already deleted");
                Ok(())
            }
            Err(e) => Err(e.into_cloud(id)),
        }
    }

    async fn poll(&self, kind: ResourceKind, id: &str) -> Result<Readiness> {
        let status = match kind {
            ResourceKind::ComputeInstance => self
                .describe_instance(id, id)
                .await?
                .and_then(|i| field(&i, &["State", "Name"]).cloned()),
            ResourceKind::BlockVolume => self
                .describe_volume(id, id)
                .await?
                .and_then(|v| v.get("State").cloned()),
            ResourceKind::NetworkEndpoint => self
                .describe_endpoint(id, id)
                .await?
                .and_then(|e| e.get("State").cloned()),
            ResourceKind::Gateway => self
                .describe_gateway(id, id)
                .await?
                .and_then(|g| g.get("GatewayState").cloned()),
            ResourceKind::FileShare => self
                .describe_file_share(id, id)
                .await?
                .and_then(|s| s.get("FileShareStatus").cloned()),
            _ => return Ok(Readiness::Ready),
        };
        let status = status.as_ref().and_then(Value::as_str).unwrap_or("");
        Ok(readiness(kind, status))
    }
}

/// Map a provider status string onto readiness
pub fn readiness(kind: ResourceKind, status: &str) -> Readiness {
    let pending = || Readiness::Pending(status.to_string());
    let failed = || Readiness::Failed(format!("{} is {}", kind, status));
    match kind {
        ResourceKind::ComputeInstance => match status {
            "running" => Readiness::Ready,
            "pending" | "" => pending(),
            _ => failed(),
        },
        ResourceKind::BlockVolume => match status {
            "available" | "in-use" => Readiness::Ready,
            "creating" | "" => pending(),
            _ => failed(),
        },
        ResourceKind::NetworkEndpoint => match status {
            "available" => Readiness::Ready,
            "pending" | "pendingAcceptance" | "" => pending(),
            _ => failed(),
        },
        ResourceKind::Gateway => match status {
            "RUNNING" => Readiness::Ready,
            // 接続直後は状態が取れないことがある
            _ => pending(),
        },
        ResourceKind::FileShare => match status {
            "AVAILABLE" => Readiness::Ready,
            "CREATING" | "UPDATING" | "" => pending(),
            _ => failed(),
        },
        _ => Readiness::Ready,
    }
}

/// Pick the local disk to use as cache
///
/// A disk already allocated as cache wins, then one at `path`, then the
/// only unallocated disk.
pub fn select_cache_disk<'a>(disks: &'a [Value], path: Option<&str>) -> Option<&'a Value> {
    let allocation = |d: &Value| d.get("DiskAllocationType").and_then(Value::as_str).map(str::to_string);
    if let Some(cache) = disks
        .iter()
        .find(|d| allocation(d).as_deref() == Some(CACHE_ALLOCATION))
    {
        return Some(cache);
    }
    let available: Vec<&Value> = disks
        .iter()
        .filter(|d| allocation(d).as_deref() == Some("AVAILABLE"))
        .collect();
    if let Some(path) = path
        && let Some(disk) = available.iter().copied().find(|d| {
            ["DiskPath", "DiskNode"]
                .iter()
                .any(|key| d.get(*key).and_then(Value::as_str) == Some(path))
        })
    {
        return Some(disk);
    }
    match available.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

fn gateway_missing(error: &AwsError) -> bool {
    match error {
        AwsError::CommandFailed {
            code: Some(code),
            message,
            ..
        } => {
            code == "InvalidGatewayRequestException"
                && (message.contains("GatewayNotFound")
                    || message.contains("FileShareNotFound")
                    || message.contains("does not exist"))
        }
        _ => false,
    }
}

fn required<'a>(request: &'a ResourceRequest, key: &str) -> Result<&'a str> {
    request.str(key).ok_or_else(|| missing(request, key))
}

fn missing(request: &ResourceRequest, key: &str) -> CloudError {
    CloudError::rejected(
        &request.name,
        AwsError::MissingAttribute(key.to_string()).to_string(),
    )
}

/// Client token within the EC2 and Storage Gateway length limit
///
/// Executor tokens already fit; longer ones from other callers are cut.
fn client_token(request: &ResourceRequest) -> String {
    request.client_token.chars().take(MAX_CLIENT_TOKEN).collect()
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn name_tags(resource_type: &str, name: &str) -> Value {
    json!([{
        "ResourceType": resource_type,
        "Tags": [{ "Key": "Name", "Value": name }]
    }])
}

pub fn join_id(parts: &[&str]) -> String {
    parts.join(&ID_SEPARATOR.to_string())
}

pub fn split_id<const N: usize>(id: &str) -> Result<[&str; N]> {
    let parts: Vec<&str> = id.split(ID_SEPARATOR).collect();
    parts
        .try_into()
        .map_err(|_| CloudError::rejected(id, AwsError::InvalidId(id.to_string()).to_string()))
}

fn strings_at(value: &Value, path: &[&str], key: Option<&str>) -> Vec<String> {
    field(value, path)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match key {
                    Some(key) => item.get(key).and_then(Value::as_str),
                    None => item.as_str(),
                })
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// (to add, to remove)
fn diff_sets(current: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let current: BTreeSet<&String> = current.iter().collect();
    let desired: BTreeSet<&String> = desired.iter().collect();
    (
        desired.difference(&current).map(|s| s.to_string()).collect(),
        current.difference(&desired).map(|s| s.to_string()).collect(),
    )
}

fn endpoint_resource(endpoint: &Value) -> std::result::Result<ProviderResource, AwsError> {
    let id = string_field(endpoint, "vpc endpoint", &["VpcEndpointId"])?;
    let mut resource = ProviderResource::new(id);
    if let Some(dns) = field(endpoint, &["DnsEntries", "0", "DnsName"]) {
        resource = resource.with_output("dns_name", dns.clone());
    }
    Ok(resource)
}

fn instance_resource(instance: &Value) -> std::result::Result<ProviderResource, AwsError> {
    let id = string_field(instance, "instance", &["InstanceId"])?;
    let mut resource = ProviderResource::new(id);
    if let Some(ip) = field(instance, &["PrivateIpAddress"]) {
        resource = resource.with_output("private_ip", ip.clone());
    }
    if let Some(zone) = field(instance, &["Placement", "AvailabilityZone"]) {
        resource = resource.with_output("availability_zone", zone.clone());
    }
    Ok(resource)
}

fn role_resource(role: &Value) -> std::result::Result<ProviderResource, AwsError> {
    let name = string_field(role, "role", &["RoleName"])?;
    let arn = string_field(role, "role", &["Arn"])?;
    Ok(ProviderResource::new(name.clone())
        .with_output("arn", arn)
        .with_output("name", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_readiness_mapping() {
        assert_eq!(
            readiness(ResourceKind::ComputeInstance, "running"),
            Readiness::Ready
        );
        assert_eq!(
            readiness(ResourceKind::ComputeInstance, "pending"),
            Readiness::Pending("pending".to_string())
        );
        assert!(matches!(
            readiness(ResourceKind::ComputeInstance, "terminated"),
            Readiness::Failed(_)
        ));
        assert_eq!(
            readiness(ResourceKind::Gateway, "SHUTDOWN"),
            Readiness::Pending("SHUTDOWN".to_string())
        );
        assert_eq!(readiness(ResourceKind::FileShare, "AVAILABLE"), Readiness::Ready);
        assert_eq!(readiness(ResourceKind::Role, ""), Readiness::Ready);
    }

    #[test]
    fn test_composite_ids() {
        let id = join_id(&["vol-1", "i-1"]);
        assert_eq!(id, "vol-1|i-1");
        let [volume, instance] = split_id::<2>(&id).unwrap();
        assert_eq!((volume, instance), ("vol-1", "i-1"));
        assert!(split_id::<2>("vol-1").is_err());
    }

    #[test]
    fn test_select_cache_disk() {
        let disks = vec![
            json!({ "DiskId": "root", "DiskPath": "/dev/xvda", "DiskAllocationType": "USED" }),
            json!({ "DiskId": "d1", "DiskPath": "/dev/nvme1n1", "DiskNode": "/dev/sdf", "DiskAllocationType": "AVAILABLE" }),
        ];
        assert_eq!(select_cache_disk(&disks, Some("/dev/sdf")).unwrap()["DiskId"], "d1");
        // パスが一致しなくても空きディスクが1つなら使う
        assert_eq!(select_cache_disk(&disks, Some("/dev/sdg")).unwrap()["DiskId"], "d1");

        let allocated = vec![json!({ "DiskId": "d1", "DiskAllocationType": "CACHE STORAGE" })];
        assert_eq!(select_cache_disk(&allocated, None).unwrap()["DiskId"], "d1");

        let none: Vec<Value> = vec![];
        assert!(select_cache_disk(&none, None).is_none());
    }

    #[test]
    fn test_instance_resource_outputs() {
        let instance = json!({
            "InstanceId": "i-0abc",
            "PrivateIpAddress": "10.0.1.25",
            "Placement": { "AvailabilityZone": "eu-west-1a" }
        });
        let resource = instance_resource(&instance).unwrap();
        assert_eq!(resource.id, "i-0abc");
        assert_eq!(resource.outputs["private_ip"], "10.0.1.25");
        assert_eq!(resource.outputs["availability_zone"], "eu-west-1a");
    }

    #[test]
    fn test_client_token_is_truncated() {
        let request = ResourceRequest::new(
            "gateway_instance",
            ResourceKind::ComputeInstance,
            BTreeMap::new(),
            "x".repeat(100),
        );
        assert_eq!(client_token(&request).len(), MAX_CLIENT_TOKEN);
    }

    #[test]
    fn test_diff_sets() {
        let current = vec!["a".to_string(), "b".to_string()];
        let desired = vec!["b".to_string(), "c".to_string()];
        assert_eq!(
            diff_sets(&current, &desired),
            (vec!["c".to_string()], vec!["a".to_string()])
        );
    }

    #[test]
    fn test_gateway_missing() {
        let error = AwsError::CommandFailed {
            operation: "storagegateway describe-gateway-information".to_string(),
            code: Some("InvalidGatewayRequestException".to_string()),
            message: "The specified gateway was not found. ErrorCode: GatewayNotFound".to_string(),
        };
        assert!(gateway_missing(&error));
    }
}
