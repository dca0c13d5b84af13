//! aws CLI wrapper
//!
//! Runs `aws <service> <operation>` as a child process and parses the JSON
//! response.

use crate::error::{AwsError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;

/// aws CLI wrapper
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: String,
    profile: Option<String>,
}

impl AwsCli {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            profile: None,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Check if the aws CLI is installed and has credentials
    pub async fn check_auth(&self) -> Result<CallerIdentity> {
        let which = Command::new("which").arg("aws").output().await?;
        if !which.status.success() {
            return Err(AwsError::CliNotFound);
        }

        let output = self
            .run("sts", "get-caller-identity", &[])
            .await
            .map_err(|e| AwsError::AuthenticationFailed(e.to_string()))?;
        Ok(serde_json::from_value(output)?)
    }

    /// Run one operation and return the parsed JSON response
    ///
    /// Operations without output return `Value::Null`.
    pub async fn run(&self, service: &str, operation: &str, args: &[String]) -> Result<Value> {
        let mut cmd = Command::new("aws");
        cmd.arg(service).arg(operation);
        cmd.args(args);
        cmd.arg("--region").arg(&self.region);
        cmd.arg("--output").arg("json");
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: aws {} {} {}", service, operation, args.join(" "));

        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AwsError::CommandFailed {
                operation: format!("{} {}", service, operation),
                code: parse_error_code(&stderr),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&stdout)?)
    }
}

/// Extract the error code from CLI stderr
///
/// `An error occurred (Throttling) when calling the CreateGateway operation: Rate exceeded`
pub fn parse_error_code(stderr: &str) -> Option<String> {
    let start = stderr.find("An error occurred (")? + "An error occurred (".len();
    let end = stderr[start..].find(')')? + start;
    let code = stderr[start..end].trim();
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

/// Argument list builder
#[derive(Debug, Default)]
pub struct Args(Vec<String>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.0.push(flag.to_string());
        self.0.push(value.into());
        self
    }

    pub fn opt(self, flag: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.arg(flag, value),
            None => self,
        }
    }

    /// A flag followed by several values
    pub fn list(mut self, flag: &str, values: &[String]) -> Self {
        if !values.is_empty() {
            self.0.push(flag.to_string());
            self.0.extend(values.iter().cloned());
        }
        self
    }

    pub fn json(self, flag: &str, value: &Value) -> Self {
        self.arg(flag, value.to_string())
    }

    pub fn flag(mut self, flag: &str) -> Self {
        self.0.push(flag.to_string());
        self
    }

    pub fn build(self) -> Vec<String> {
        self.0
    }
}

/// Response of `sts get-caller-identity`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerIdentity {
    #[serde(rename = "Account")]
    pub account: String,

    #[serde(rename = "Arn")]
    pub arn: String,

    #[serde(rename = "UserId")]
    pub user_id: Option<String>,
}

/// Walk a JSON response by key path, e.g. `["Instances", "0", "InstanceId"]`
pub fn field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| match current {
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        Value::Object(map) => map.get(*key),
        _ => None,
    })
}

/// String field of a JSON response; missing fields are an error
pub fn string_field(value: &Value, operation: &str, path: &[&str]) -> Result<String> {
    field(value, path)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AwsError::UnexpectedResponse {
            operation: operation.to_string(),
            field: path.join("."),
        })
}
