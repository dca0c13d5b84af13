//! AWS provider for gateflow
//!
//! This crate implements the ResourceProvider trait for AWS,
//! provisioning an S3 file gateway and its surrounding resources.
//!
//! # Resources
//!
//! - EC2: security group, interface endpoint, appliance instance, cache volume
//! - IAM: bucket access role and inline policy
//! - Storage Gateway: activation, cache disk, NFS file share
//! - S3 / EventBridge / SNS: upload notifications
//!
//! # Requirements
//!
//! - `aws` CLI must be installed and configured
//! - Authentication is managed through the aws CLI configuration
//!
//! # Example
//!
//! ```ignore
//! use gateflow_cloud_aws::AwsProvider;
//! use gateflow_cloud::ResourceProvider;
//!
//! let provider = AwsProvider::new("eu-west-1");
//!
//! // Check authentication
//! let auth = provider.check_auth().await?;
//! if !auth.authenticated {
//!     panic!("Not authenticated: {:?}", auth.error);
//! }
//! ```

pub mod activation;
pub mod awscli;
pub mod documents;
pub mod error;
pub mod provider;

pub use activation::{ActivationRequest, fetch_activation_key, parse_activation_key};
pub use awscli::{AwsCli, CallerIdentity};
pub use error::{AwsError, ErrorClass, Result};
pub use provider::AwsProvider;
