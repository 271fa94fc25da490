//! AWS provisioning for the monitoring stack.
//!
//! One stack is a fixed topology: a VPC with a single public subnet, one
//! EC2 instance running BugSink, Uptime Kuma, and a Caddy reverse proxy
//! via docker compose, an Elastic IP, two Secrets Manager secrets, an IAM
//! instance role, and two Route 53 A records. The `create`, `destroy`,
//! and `list` subcommands operate on that topology as a unit.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

mod create;
pub use create::create;
mod destroy;
pub use destroy::destroy;
mod list;
pub use list::list;
pub mod ec2;
pub mod iam;
pub mod route53;
pub mod secrets;
pub mod services;

pub const CREATE_CMD: &str = "create";
pub const DESTROY_CMD: &str = "destroy";
pub const LIST_CMD: &str = "list";

/// Tag key applied to every taggable resource, valued by the stack name
pub const STACK_TAG_KEY: &str = "stack";

/// File created in the stack directory once a deployment completes
pub const CREATED_FILE_NAME: &str = "created";

/// File created in the stack directory once a deployment is destroyed
pub const DESTROYED_FILE_NAME: &str = "destroyed";

/// File in the stack directory holding deployment metadata
pub const METADATA_FILE_NAME: &str = "metadata.yaml";

/// File in the stack directory holding the stack's exported outputs
pub const OUTPUTS_FILE_NAME: &str = "outputs.yaml";

/// Default EC2 instance type for the monitoring instance
pub const DEFAULT_INSTANCE_TYPE: &str = "t3.small";

/// Default root volume size (GiB)
pub const DEFAULT_STORAGE_SIZE: i32 = 80;

/// Default root volume class
pub const DEFAULT_STORAGE_CLASS: &str = "gp3";

fn default_instance_type() -> String {
    DEFAULT_INSTANCE_TYPE.to_string()
}

fn default_storage_size() -> i32 {
    DEFAULT_STORAGE_SIZE
}

fn default_storage_class() -> String {
    DEFAULT_STORAGE_CLASS.to_string()
}

/// Stack configuration loaded from the `--config` YAML file.
///
/// The required fields identify the stack, the target region, and the DNS
/// names to publish. Instance sizing can be overridden; everything else
/// about the topology is fixed.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    /// Stack name, used to namespace resource names, tags, and outputs
    pub stack: String,
    /// AWS region to deploy into
    pub region: String,
    /// Route 53 hosted zone id holding the root domain
    pub zone_id: String,
    /// Root domain name (e.g. `example.com`)
    pub domain: String,
    /// Subdomain label for the BugSink service (e.g. `bugsink`)
    pub bugsink_subdomain: String,
    /// Subdomain label for the Uptime Kuma service (e.g. `uptime`)
    pub uptime_subdomain: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default = "default_storage_size")]
    pub storage_size: i32,
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
}

impl Config {
    /// Validates that every required field is present and non-empty.
    ///
    /// Runs before any AWS client is constructed; the error names each
    /// missing field.
    pub fn validate(&self) -> Result<(), Error> {
        let mut missing = Vec::new();
        for (field, value) in [
            ("stack", &self.stack),
            ("region", &self.region),
            ("zone_id", &self.zone_id),
            ("domain", &self.domain),
            ("bugsink_subdomain", &self.bugsink_subdomain),
            ("uptime_subdomain", &self.uptime_subdomain),
        ] {
            if value.trim().is_empty() {
                missing.push(format!("{field} is required"));
            }
        }
        if self.storage_size < 1 {
            missing.push("storage_size must be at least 1".to_string());
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig(missing))
        }
    }

    /// Full domain name served by BugSink
    pub fn bugsink_fqdn(&self) -> String {
        format!("{}.{}", self.bugsink_subdomain, self.domain)
    }

    /// Full domain name served by Uptime Kuma
    pub fn uptime_fqdn(&self) -> String {
        format!("{}.{}", self.uptime_subdomain, self.domain)
    }
}

/// Metadata persisted when a deployment starts, consumed by `list`
#[derive(Serialize, Deserialize, Clone)]
pub struct Metadata {
    pub stack: String,
    pub created_at: u64,
    pub region: String,
    pub domain: String,
}

/// Outputs produced by a completed deployment
#[derive(Clone)]
pub struct Outputs {
    pub instance_id: String,
    pub static_address: String,
    pub bugsink_domain: String,
    pub uptime_domain: String,
}

impl Outputs {
    /// Renders the outputs as an export map namespaced by the stack name
    pub fn exports(&self, stack: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (export_name(stack, "InstanceId"), self.instance_id.clone()),
            (
                export_name(stack, "StaticAddress"),
                self.static_address.clone(),
            ),
            (
                export_name(stack, "BugsinkDomainName"),
                self.bugsink_domain.clone(),
            ),
            (
                export_name(stack, "UptimeDomainName"),
                self.uptime_domain.clone(),
            ),
        ])
    }
}

/// Namespaces an output export name by stack name
pub fn export_name(stack: &str, output: &str) -> String {
    format!("{stack}-{output}")
}

/// Returns the deployer's metadata directory (or a stack's subdirectory)
pub fn deployer_directory(stack: Option<&str>) -> PathBuf {
    let base = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
        .join(".monitoring_deployer");
    match stack {
        Some(stack) => base.join(stack),
        None => base,
    }
}

/// Errors that can occur when deploying or destroying a stack
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("aws ec2: {0}")]
    AwsEc2(#[from] Box<aws_sdk_ec2::Error>),
    #[error("aws iam: {0}")]
    AwsIam(#[from] Box<aws_sdk_iam::Error>),
    #[error("aws route53: {0}")]
    AwsRoute53(#[from] Box<aws_sdk_route53::Error>),
    #[error("aws secrets manager: {0}")]
    AwsSecretsManager(#[from] Box<aws_sdk_secretsmanager::Error>),
    #[error("aws request: {0}")]
    AwsBuild(#[from] aws_sdk_route53::error::BuildError),
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    #[error("invalid instance type: {0}")]
    InvalidInstanceType(String),
    #[error("invalid storage class: {0}")]
    InvalidStorageClass(String),
    #[error("no machine image found matching: {0}")]
    MachineImageNotFound(String),
    #[error("no available zone reported by the region")]
    NoAvailabilityZone,
    #[error("hosted zone {0} not found")]
    ZoneNotFound(String),
    #[error("hosted zone {zone_id} serves {zone_name}, not {domain}")]
    ZoneMismatch {
        zone_id: String,
        zone_name: String,
        domain: String,
    },
    #[error("secret store returned no value for {0}")]
    SecretValueMissing(&'static str),
    #[error("generated password violates the character policy")]
    PasswordPolicyViolation,
    #[error("stack {0} has already been destroyed")]
    StackAlreadyDestroyed(String),
    #[error("timed out waiting for {0}")]
    WaitTimeout(&'static str),
}

impl From<aws_sdk_ec2::Error> for Error {
    fn from(err: aws_sdk_ec2::Error) -> Self {
        Self::AwsEc2(Box::new(err))
    }
}

impl From<aws_sdk_iam::Error> for Error {
    fn from(err: aws_sdk_iam::Error) -> Self {
        Self::AwsIam(Box::new(err))
    }
}

impl From<aws_sdk_route53::Error> for Error {
    fn from(err: aws_sdk_route53::Error) -> Self {
        Self::AwsRoute53(Box::new(err))
    }
}

impl From<aws_sdk_secretsmanager::Error> for Error {
    fn from(err: aws_sdk_secretsmanager::Error) -> Self {
        Self::AwsSecretsManager(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            stack: "monitoring".to_string(),
            region: "us-east-1".to_string(),
            zone_id: "Z0123456789ABCDEFGHIJ".to_string(),
            domain: "example.com".to_string(),
            bugsink_subdomain: "bugsink".to_string(),
            uptime_subdomain: "uptime".to_string(),
            instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            storage_size: DEFAULT_STORAGE_SIZE,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn missing_zone_id_names_the_field() {
        let mut config = config();
        config.zone_id = String::new();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("zone_id is required"));
    }

    #[test]
    fn all_missing_fields_are_reported() {
        let mut config = config();
        config.domain = String::new();
        config.uptime_subdomain = "  ".to_string();
        let Err(Error::InvalidConfig(missing)) = config.validate() else {
            panic!("expected invalid config");
        };
        assert_eq!(missing.len(), 2);
        assert!(missing[0].contains("domain"));
        assert!(missing[1].contains("uptime_subdomain"));
    }

    #[test]
    fn zero_storage_rejected() {
        let mut config = config();
        config.storage_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_domains_join_subdomain_and_domain() {
        let config = config();
        assert_eq!(config.bugsink_fqdn(), "bugsink.example.com");
        assert_eq!(config.uptime_fqdn(), "uptime.example.com");
    }

    #[test]
    fn exports_are_namespaced_by_stack() {
        let outputs = Outputs {
            instance_id: "i-0abc".to_string(),
            static_address: "198.51.100.7".to_string(),
            bugsink_domain: "bugsink.example.com".to_string(),
            uptime_domain: "uptime.example.com".to_string(),
        };
        let exports = outputs.exports("monitoring");
        assert_eq!(exports["monitoring-InstanceId"], "i-0abc");
        assert_eq!(exports["monitoring-BugsinkDomainName"], "bugsink.example.com");
        assert_eq!(exports["monitoring-UptimeDomainName"], "uptime.example.com");
    }

    #[test]
    fn config_defaults_apply() {
        let config: Config = serde_yaml::from_str(
            r#"
stack: monitoring
region: us-east-1
zone_id: Z0123456789ABCDEFGHIJ
domain: example.com
bugsink_subdomain: bugsink
uptime_subdomain: uptime
"#,
        )
        .unwrap();
        assert_eq!(config.instance_type, DEFAULT_INSTANCE_TYPE);
        assert_eq!(config.storage_size, DEFAULT_STORAGE_SIZE);
        assert_eq!(config.storage_class, DEFAULT_STORAGE_CLASS);
    }
}
