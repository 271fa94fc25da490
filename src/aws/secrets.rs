//! AWS Secrets Manager wrappers for the stack's generated credentials.
//!
//! Values are generated server-side by `GetRandomPassword`, transit this
//! process once wrapped in [`Zeroizing`], and are never logged or
//! persisted. Only the secret name and ARN leave this module.

use crate::aws::{Error, STACK_TAG_KEY};
use aws_config::BehaviorVersion;
pub use aws_config::Region;
use aws_sdk_secretsmanager::{
    config::retry::ReconnectMode, types::Tag, Client as SecretsClient,
};
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Characters excluded from generated values: shell metacharacters and
/// quoting-sensitive symbols, since the boot script interpolates secrets
/// into shell variables and a compose file
pub const EXCLUDED_CHARACTERS: &str = r#" %+~`#$&*()|[]{}:;<>?!'/"\"#;

/// Length of the generated database/admin password
pub const DB_PASSWORD_LENGTH: i64 = 32;

/// Length of the generated application signing key
pub const SIGNING_KEY_LENGTH: i64 = 50;

/// Fixed username merged into the credentials secret
pub const DB_USERNAME: &str = "admin";

/// A created secret, identified by name and ARN (never by value)
#[derive(Clone)]
pub struct SecretHandle {
    pub name: String,
    pub arn: String,
}

/// Name of the credentials secret for a stack
pub fn credentials_secret_name(stack: &str) -> String {
    format!("{stack}/bugsink/credentials")
}

/// Name of the signing-key secret for a stack
pub fn signing_key_secret_name(stack: &str) -> String {
    format!("{stack}/bugsink/signing-key")
}

/// Creates a Secrets Manager client for the specified AWS region
pub async fn create_client(region: Region) -> SecretsClient {
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
    SecretsClient::new(&config)
}

/// Checks a generated value against the character policy: minimum length,
/// no excluded characters, no embedded whitespace
pub fn password_conforms(value: &str, min_length: usize) -> bool {
    value.len() >= min_length
        && !value
            .chars()
            .any(|c| c.is_whitespace() || EXCLUDED_CHARACTERS.contains(c))
}

/// Generates a random value of the given length via the secret store
pub async fn random_password(
    client: &SecretsClient,
    length: i64,
) -> Result<Zeroizing<String>, Error> {
    let response = client
        .get_random_password()
        .password_length(length)
        .exclude_characters(EXCLUDED_CHARACTERS)
        .include_space(false)
        .send()
        .await
        .map_err(aws_sdk_secretsmanager::Error::from)?;
    let value = Zeroizing::new(
        response
            .random_password()
            .ok_or(Error::SecretValueMissing("random password"))?
            .to_string(),
    );
    if !password_conforms(&value, length as usize) {
        return Err(Error::PasswordPolicyViolation);
    }
    Ok(value)
}

/// Renders the credentials secret document, merging the fixed username
/// with the generated password
pub fn credentials_document(password: &str) -> Result<Zeroizing<String>, Error> {
    let document = serde_json::to_string(&serde_json::json!({
        "username": DB_USERNAME,
        "password": password,
    }))?;
    Ok(Zeroizing::new(document))
}

/// Creates a secret with the given value, or returns the existing one's
/// ARN untouched if it already exists
pub async fn ensure_secret(
    client: &SecretsClient,
    stack: &str,
    name: &str,
    description: &str,
    value: &str,
) -> Result<SecretHandle, Error> {
    match client
        .create_secret()
        .name(name)
        .description(description)
        .secret_string(value)
        .tags(Tag::builder().key(STACK_TAG_KEY).value(stack).build())
        .send()
        .await
    {
        Ok(response) => {
            let arn = response
                .arn()
                .ok_or(Error::SecretValueMissing("secret arn"))?
                .to_string();
            info!(name, "created secret");
            Ok(SecretHandle {
                name: name.to_string(),
                arn,
            })
        }
        Err(err) => {
            let service_err = err.into_service_error();
            if !service_err.is_resource_exists_exception() {
                return Err(aws_sdk_secretsmanager::Error::from(service_err).into());
            }
            let existing = client
                .describe_secret()
                .secret_id(name)
                .send()
                .await
                .map_err(aws_sdk_secretsmanager::Error::from)?;
            let arn = existing
                .arn()
                .ok_or(Error::SecretValueMissing("secret arn"))?
                .to_string();
            debug!(name, "secret already exists");
            Ok(SecretHandle {
                name: name.to_string(),
                arn,
            })
        }
    }
}

/// Deletes a secret without a recovery window (no-op if absent)
pub async fn delete_secret(client: &SecretsClient, name: &str) -> Result<(), Error> {
    match client
        .delete_secret()
        .secret_id(name)
        .force_delete_without_recovery(true)
        .send()
        .await
    {
        Ok(_) => {
            info!(name, "deleted secret");
            Ok(())
        }
        Err(err) => {
            let service_err = err.into_service_error();
            if service_err.is_resource_not_found_exception() {
                return Ok(());
            }
            Err(aws_sdk_secretsmanager::Error::from(service_err).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conforming_password_accepted() {
        assert!(password_conforms("a-Zz09_=.,^@", 8));
    }

    #[test]
    fn each_excluded_character_rejected() {
        for c in EXCLUDED_CHARACTERS.chars() {
            let value = format!("abcdefg{c}");
            assert!(!password_conforms(&value, 8), "accepted {c:?}");
        }
    }

    #[test]
    fn whitespace_rejected() {
        assert!(!password_conforms("abcd\tefgh", 8));
        assert!(!password_conforms("abcd efgh", 8));
        assert!(!password_conforms("abcd\nefgh", 8));
    }

    #[test]
    fn short_value_rejected() {
        assert!(!password_conforms("abc", 8));
    }

    #[test]
    fn credentials_document_merges_username_and_password() {
        let document = credentials_document("sup3r-s3cret").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&document).unwrap();
        assert_eq!(parsed["username"], DB_USERNAME);
        assert_eq!(parsed["password"], "sup3r-s3cret");
    }

    #[test]
    fn secret_names_are_namespaced_by_stack() {
        assert_eq!(
            credentials_secret_name("monitoring"),
            "monitoring/bugsink/credentials"
        );
        assert_eq!(
            signing_key_secret_name("monitoring"),
            "monitoring/bugsink/signing-key"
        );
    }
}
