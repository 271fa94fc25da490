//! `destroy` subcommand

use crate::aws::{
    deployer_directory,
    ec2::{self, Region},
    iam, route53, secrets, Config, Error, DESTROYED_FILE_NAME,
};
use std::{fs::File, path::PathBuf};
use tracing::{info, warn};

/// Destroys every resource belonging to a stack, in reverse dependency
/// order: DNS records, static address, instance, security group, identity,
/// secrets, network.
///
/// Resources are discovered by the stack tag (or stack-derived name), so
/// destroy works on partially created stacks; anything already gone is
/// skipped.
pub async fn destroy(config_path: &PathBuf) -> Result<(), Error> {
    let config: Config = {
        let config_file = File::open(config_path)?;
        serde_yaml::from_reader(config_file)?
    };
    config.validate()?;
    let stack = &config.stack;
    info!(stack = stack.as_str(), "loaded configuration");

    let stack_directory = deployer_directory(Some(stack));
    if stack_directory.join(DESTROYED_FILE_NAME).exists() {
        return Err(Error::StackAlreadyDestroyed(stack.clone()));
    }

    let region = Region::new(config.region.clone());
    let ec2_client = ec2::create_client(region.clone()).await;
    let iam_client = iam::create_client(region.clone()).await;
    let secrets_client = secrets::create_client(region.clone()).await;
    let route53_client = route53::create_client(region.clone()).await;

    let bugsink_fqdn = config.bugsink_fqdn();
    let uptime_fqdn = config.uptime_fqdn();
    match route53::delete_address_records(
        &route53_client,
        &config.zone_id,
        &[&bugsink_fqdn, &uptime_fqdn],
    )
    .await
    {
        Err(Error::AwsRoute53(err))
            if matches!(err.as_ref(), aws_sdk_route53::Error::NoSuchHostedZone(_)) =>
        {
            warn!(zone = config.zone_id.as_str(), "hosted zone not found, skipping records");
        }
        result => result?,
    }

    ec2::release_elastic_ip(&ec2_client, stack).await?;
    if ec2::terminate_instance(&ec2_client, stack).await?.is_none() {
        info!("no instance to terminate");
    }
    ec2::delete_security_groups(&ec2_client, stack).await?;
    iam::delete_instance_role(&iam_client, stack).await?;
    secrets::delete_secret(&secrets_client, &secrets::credentials_secret_name(stack)).await?;
    secrets::delete_secret(&secrets_client, &secrets::signing_key_secret_name(stack)).await?;
    ec2::delete_network(&ec2_client, stack).await?;

    std::fs::create_dir_all(&stack_directory)?;
    File::create(stack_directory.join(DESTROYED_FILE_NAME))?;
    info!(stack = stack.as_str(), "destroy complete");
    Ok(())
}
