//! AWS IAM wrappers for the instance's execution identity: a role trusted
//! by EC2, session management via SSM, and read access to exactly the
//! stack's two secrets.

use crate::aws::Error;
use aws_config::BehaviorVersion;
pub use aws_config::Region;
use aws_sdk_iam::{config::retry::ReconnectMode, Client as IamClient};
use std::time::Duration;
use tracing::{debug, info};

/// Managed policy granting SSM session management to the instance
pub const SSM_MANAGED_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore";

/// Name of the inline policy granting read access to the stack's secrets
pub const READ_SECRETS_POLICY_NAME: &str = "read-secrets";

/// IAM role name for a stack
pub fn role_name(stack: &str) -> String {
    format!("{stack}-instance-role")
}

/// Instance profile name for a stack
pub fn instance_profile_name(stack: &str) -> String {
    format!("{stack}-instance-profile")
}

/// Creates an IAM client (IAM is a global service; the region only selects
/// the endpoint)
pub async fn create_client(region: Region) -> IamClient {
    let retry = aws_config::retry::RetryConfig::adaptive()
        .with_max_attempts(u32::MAX)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30))
        .with_reconnect_mode(ReconnectMode::ReconnectOnTransientError);
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(retry)
        .load()
        .await;
    IamClient::new(&config)
}

/// Trust policy allowing EC2 to assume the role
pub fn trust_policy() -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ec2.amazonaws.com" },
            "Action": "sts:AssumeRole",
        }],
    })
    .to_string()
}

/// Policy granting read access to exactly the given secret ARNs
pub fn read_secrets_policy(secret_arns: &[&str]) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": [
                "secretsmanager:GetSecretValue",
                "secretsmanager:DescribeSecret",
            ],
            "Resource": secret_arns,
        }],
    })
    .to_string()
}

/// Finds or creates the instance role and profile, granting SSM session
/// management and read access to the stack's secrets. Returns the
/// instance profile name.
pub async fn ensure_instance_role(
    client: &IamClient,
    stack: &str,
    secret_arns: &[&str],
) -> Result<String, Error> {
    let role = role_name(stack);
    match client
        .create_role()
        .role_name(&role)
        .assume_role_policy_document(trust_policy())
        .description("Execution role for the monitoring instance")
        .send()
        .await
    {
        Ok(_) => info!(role = role.as_str(), "created role"),
        Err(err) => {
            let service_err = err.into_service_error();
            if !service_err.is_entity_already_exists_exception() {
                return Err(aws_sdk_iam::Error::from(service_err).into());
            }
            debug!(role = role.as_str(), "role already exists");
        }
    }

    // Both grants are idempotent: attach is a no-op when already attached,
    // put overwrites the inline policy in place
    client
        .attach_role_policy()
        .role_name(&role)
        .policy_arn(SSM_MANAGED_POLICY_ARN)
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    client
        .put_role_policy()
        .role_name(&role)
        .policy_name(READ_SECRETS_POLICY_NAME)
        .policy_document(read_secrets_policy(secret_arns))
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;

    let profile = instance_profile_name(stack);
    match client
        .create_instance_profile()
        .instance_profile_name(&profile)
        .send()
        .await
    {
        Ok(_) => info!(profile = profile.as_str(), "created instance profile"),
        Err(err) => {
            let service_err = err.into_service_error();
            if !service_err.is_entity_already_exists_exception() {
                return Err(aws_sdk_iam::Error::from(service_err).into());
            }
            debug!(profile = profile.as_str(), "instance profile already exists");
        }
    }

    let existing = client
        .get_instance_profile()
        .instance_profile_name(&profile)
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    let has_role = existing
        .instance_profile()
        .map(|p| p.roles().iter().any(|r| r.role_name() == role))
        .unwrap_or(false);
    if !has_role {
        client
            .add_role_to_instance_profile()
            .instance_profile_name(&profile)
            .role_name(&role)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)?;
    }
    Ok(profile)
}

/// Deletes the instance profile and role (no-op for missing pieces)
pub async fn delete_instance_role(client: &IamClient, stack: &str) -> Result<(), Error> {
    let role = role_name(stack);
    let profile = instance_profile_name(stack);

    if let Err(err) = client
        .remove_role_from_instance_profile()
        .instance_profile_name(&profile)
        .role_name(&role)
        .send()
        .await
    {
        let service_err = err.into_service_error();
        if !service_err.is_no_such_entity_exception() {
            return Err(aws_sdk_iam::Error::from(service_err).into());
        }
    }
    if let Err(err) = client
        .delete_instance_profile()
        .instance_profile_name(&profile)
        .send()
        .await
    {
        let service_err = err.into_service_error();
        if !service_err.is_no_such_entity_exception() {
            return Err(aws_sdk_iam::Error::from(service_err).into());
        }
    }
    if let Err(err) = client
        .detach_role_policy()
        .role_name(&role)
        .policy_arn(SSM_MANAGED_POLICY_ARN)
        .send()
        .await
    {
        let service_err = err.into_service_error();
        if !service_err.is_no_such_entity_exception() {
            return Err(aws_sdk_iam::Error::from(service_err).into());
        }
    }
    if let Err(err) = client
        .delete_role_policy()
        .role_name(&role)
        .policy_name(READ_SECRETS_POLICY_NAME)
        .send()
        .await
    {
        let service_err = err.into_service_error();
        if !service_err.is_no_such_entity_exception() {
            return Err(aws_sdk_iam::Error::from(service_err).into());
        }
    }
    match client.delete_role().role_name(&role).send().await {
        Ok(_) => {
            info!(role = role.as_str(), "deleted role");
            Ok(())
        }
        Err(err) => {
            let service_err = err.into_service_error();
            if service_err.is_no_such_entity_exception() {
                return Ok(());
            }
            Err(aws_sdk_iam::Error::from(service_err).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_policy_trusts_ec2() {
        let parsed: serde_json::Value = serde_json::from_str(&trust_policy()).unwrap();
        assert_eq!(
            parsed["Statement"][0]["Principal"]["Service"],
            "ec2.amazonaws.com"
        );
        assert_eq!(parsed["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[test]
    fn read_policy_scopes_to_given_arns() {
        let arns = [
            "arn:aws:secretsmanager:us-east-1:123456789012:secret:a",
            "arn:aws:secretsmanager:us-east-1:123456789012:secret:b",
        ];
        let parsed: serde_json::Value =
            serde_json::from_str(&read_secrets_policy(&arns)).unwrap();
        let statement = &parsed["Statement"][0];
        assert_eq!(statement["Resource"].as_array().unwrap().len(), 2);
        assert!(statement["Action"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("secretsmanager:GetSecretValue")));
    }

    #[test]
    fn names_are_namespaced_by_stack() {
        assert_eq!(role_name("monitoring"), "monitoring-instance-role");
        assert_eq!(
            instance_profile_name("monitoring"),
            "monitoring-instance-profile"
        );
    }
}
