//! AWS Route 53 wrappers: resolve the hosted zone and publish the stack's
//! address records.
//!
//! Both A records are written in a single change batch so the static
//! address can never be published for one subdomain and not the other.
//! UPSERT gives update-in-place semantics and makes re-runs no-ops.

use crate::aws::Error;
use aws_config::BehaviorVersion;
pub use aws_config::Region;
use aws_sdk_route53::{
    config::retry::ReconnectMode,
    types::{Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType},
    Client as Route53Client,
};
use std::time::Duration;
use tracing::{debug, info};

/// TTL for published address records (seconds)
pub const RECORD_TTL: i64 = 300;

/// A resolved hosted zone
pub struct ZoneHandle {
    pub id: String,
    pub name: String,
}

/// Creates a Route 53 client (Route 53 is a global service)
pub async fn create_client(region: Region) -> Route53Client {
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
    Route53Client::new(&config)
}

/// Strips the trailing dot Route 53 appends to zone and record names
pub fn normalized(name: &str) -> &str {
    name.trim_end_matches('.')
}

/// Resolves the hosted zone by id and verifies it serves the configured
/// domain
pub async fn resolve_zone(
    client: &Route53Client,
    zone_id: &str,
    domain: &str,
) -> Result<ZoneHandle, Error> {
    let response = client
        .get_hosted_zone()
        .id(zone_id)
        .send()
        .await
        .map_err(aws_sdk_route53::Error::from)?;
    let zone = response
        .hosted_zone()
        .ok_or_else(|| Error::ZoneNotFound(zone_id.to_string()))?;
    let zone_name = normalized(zone.name()).to_string();
    if zone_name != domain {
        return Err(Error::ZoneMismatch {
            zone_id: zone_id.to_string(),
            zone_name,
            domain: domain.to_string(),
        });
    }
    debug!(zone = zone_id, name = zone_name.as_str(), "resolved hosted zone");
    Ok(ZoneHandle {
        id: zone_id.to_string(),
        name: zone_name,
    })
}

fn address_record(fqdn: &str, address: &str) -> Result<ResourceRecordSet, Error> {
    Ok(ResourceRecordSet::builder()
        .name(fqdn)
        .r#type(RrType::A)
        .ttl(RECORD_TTL)
        .resource_records(ResourceRecord::builder().value(address).build()?)
        .build()?)
}

/// Upserts A records for all given names, each targeting the static
/// address, in one change batch annotated with the backing instance
pub async fn upsert_address_records(
    client: &Route53Client,
    zone: &ZoneHandle,
    fqdns: &[&str],
    address: &str,
    instance_id: &str,
) -> Result<(), Error> {
    let mut batch = ChangeBatch::builder().comment(format!(
        "A records for {} pointing to instance {instance_id}",
        fqdns.join(", ")
    ));
    for fqdn in fqdns {
        batch = batch.changes(
            Change::builder()
                .action(ChangeAction::Upsert)
                .resource_record_set(address_record(fqdn, address)?)
                .build()?,
        );
    }
    client
        .change_resource_record_sets()
        .hosted_zone_id(&zone.id)
        .change_batch(batch.build()?)
        .send()
        .await
        .map_err(aws_sdk_route53::Error::from)?;
    info!(
        records = ?fqdns,
        address = address,
        "published address records"
    );
    Ok(())
}

/// Deletes the A records for the given names, if present
pub async fn delete_address_records(
    client: &Route53Client,
    zone_id: &str,
    fqdns: &[&str],
) -> Result<(), Error> {
    let mut changes = Vec::new();
    for fqdn in fqdns {
        let response = client
            .list_resource_record_sets()
            .hosted_zone_id(zone_id)
            .start_record_name(*fqdn)
            .start_record_type(RrType::A)
            .max_items(1)
            .send()
            .await
            .map_err(aws_sdk_route53::Error::from)?;
        let Some(record) = response
            .resource_record_sets()
            .iter()
            .find(|r| normalized(r.name()) == *fqdn && *r.r#type() == RrType::A)
        else {
            continue;
        };
        changes.push(
            Change::builder()
                .action(ChangeAction::Delete)
                .resource_record_set(record.clone())
                .build()?,
        );
    }
    if changes.is_empty() {
        return Ok(());
    }
    client
        .change_resource_record_sets()
        .hosted_zone_id(zone_id)
        .change_batch(ChangeBatch::builder().set_changes(Some(changes)).build()?)
        .send()
        .await
        .map_err(aws_sdk_route53::Error::from)?;
    info!(records = ?fqdns, "deleted address records");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_strips_trailing_dot() {
        assert_eq!(normalized("example.com."), "example.com");
        assert_eq!(normalized("example.com"), "example.com");
    }

    #[test]
    fn address_record_targets_the_static_address() {
        let record = address_record("bugsink.example.com", "198.51.100.7").unwrap();
        assert_eq!(record.name(), "bugsink.example.com");
        assert_eq!(*record.r#type(), RrType::A);
        assert_eq!(record.ttl(), Some(RECORD_TTL));
        assert_eq!(
            record.resource_records()[0].value(),
            "198.51.100.7"
        );
    }
}
