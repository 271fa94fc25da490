//! `create` subcommand

use crate::aws::{
    deployer_directory,
    ec2::{self, LaunchSpec, Region},
    iam, route53, secrets,
    services::{self, UserDataParams},
    Config, Error, Metadata, Outputs, CREATED_FILE_NAME, DESTROYED_FILE_NAME, METADATA_FILE_NAME,
    OUTPUTS_FILE_NAME,
};
use futures::future::try_join;
use std::{fs::File, path::PathBuf};
use tracing::info;

/// Provisions the monitoring stack: network, secrets, identity, instance,
/// static address, and DNS records, in dependency order.
///
/// Every step finds the resource by tag or name before creating it, so
/// re-running with unchanged configuration produces no changes.
pub async fn create(config_path: &PathBuf) -> Result<(), Error> {
    // Load and validate configuration before touching any AWS API
    let config: Config = {
        let config_file = File::open(config_path)?;
        serde_yaml::from_reader(config_file)?
    };
    config.validate()?;
    let stack = &config.stack;
    let bugsink_fqdn = config.bugsink_fqdn();
    let uptime_fqdn = config.uptime_fqdn();
    info!(stack = stack.as_str(), "loaded configuration");

    // Persist deployment metadata early so a failed run is still visible
    let stack_directory = deployer_directory(Some(stack));
    std::fs::create_dir_all(&stack_directory)?;
    let destroyed_file = stack_directory.join(DESTROYED_FILE_NAME);
    if destroyed_file.exists() {
        std::fs::remove_file(&destroyed_file)?;
    }
    let metadata = Metadata {
        stack: stack.clone(),
        created_at: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs(),
        region: config.region.clone(),
        domain: config.domain.clone(),
    };
    let metadata_file = File::create(stack_directory.join(METADATA_FILE_NAME))?;
    serde_yaml::to_writer(metadata_file, &metadata)?;

    let region = Region::new(config.region.clone());
    let ec2_client = ec2::create_client(region.clone()).await;
    let iam_client = iam::create_client(region.clone()).await;
    let secrets_client = secrets::create_client(region.clone()).await;
    let route53_client = route53::create_client(region.clone()).await;
    info!(region = config.region.as_str(), "created AWS clients");

    // Network: VPC with one public subnet in one AZ, no NAT gateway
    let vpc_id = ec2::ensure_vpc(&ec2_client, stack).await?;
    let igw_id = ec2::ensure_internet_gateway(&ec2_client, &vpc_id, stack).await?;
    let route_table_id = ec2::ensure_route_table(&ec2_client, &vpc_id, &igw_id, stack).await?;
    let subnet_id = ec2::ensure_subnet(&ec2_client, &vpc_id, &route_table_id, stack).await?;
    info!(
        vpc = vpc_id.as_str(),
        subnet = subnet_id.as_str(),
        "network ready"
    );

    // Secrets: generated credentials and signing key, created independently
    let (credentials, signing) = try_join(
        async {
            let password =
                secrets::random_password(&secrets_client, secrets::DB_PASSWORD_LENGTH).await?;
            let document = secrets::credentials_document(&password)?;
            secrets::ensure_secret(
                &secrets_client,
                stack,
                &secrets::credentials_secret_name(stack),
                "BugSink database and application credentials",
                &document,
            )
            .await
        },
        async {
            let signing_key =
                secrets::random_password(&secrets_client, secrets::SIGNING_KEY_LENGTH).await?;
            secrets::ensure_secret(
                &secrets_client,
                stack,
                &secrets::signing_key_secret_name(stack),
                "Signing key for the BugSink application",
                &signing_key,
            )
            .await
        },
    )
    .await?;
    info!(
        credentials = credentials.name.as_str(),
        signing = signing.name.as_str(),
        "secrets ready"
    );

    // Identity: SSM session management plus read access to both secrets
    let instance_profile =
        iam::ensure_instance_role(&iam_client, stack, &[&credentials.arn, &signing.arn]).await?;
    info!(profile = instance_profile.as_str(), "instance role ready");

    let security_group_id = ec2::ensure_security_group_web(&ec2_client, &vpc_id, stack).await?;
    info!(sg = security_group_id.as_str(), "security group ready");

    let image = ec2::find_machine_image(&ec2_client).await?;
    info!(ami = image.image_id.as_str(), "resolved machine image");

    let user_data = services::instance_user_data(&UserDataParams {
        region: &config.region,
        db_secret_arn: &credentials.arn,
        signing_secret_arn: &signing.arn,
        bugsink_fqdn: &bugsink_fqdn,
        uptime_fqdn: &uptime_fqdn,
    });
    let instance_id = ec2::ensure_instance(
        &ec2_client,
        stack,
        &LaunchSpec {
            image: &image,
            instance_type: &config.instance_type,
            storage_size: config.storage_size,
            storage_class: &config.storage_class,
            subnet_id: &subnet_id,
            security_group_id: &security_group_id,
            instance_profile: &instance_profile,
            user_data: &user_data,
        },
    )
    .await?;
    ec2::wait_for_instance_running(&ec2_client, &instance_id).await?;
    info!(instance = instance_id.as_str(), "instance running");

    // Static address, bound 1:1 to the instance
    let (allocation_id, static_address) = ec2::ensure_elastic_ip(&ec2_client, stack).await?;
    ec2::associate_elastic_ip(&ec2_client, &allocation_id, &instance_id).await?;
    info!(address = static_address.as_str(), "static address bound");

    // DNS: both records in one batch, targeting the static address
    let zone = route53::resolve_zone(&route53_client, &config.zone_id, &config.domain).await?;
    route53::upsert_address_records(
        &route53_client,
        &zone,
        &[&bugsink_fqdn, &uptime_fqdn],
        &static_address,
        &instance_id,
    )
    .await?;

    // Record outputs and mark the deployment complete
    let outputs = Outputs {
        instance_id: instance_id.clone(),
        static_address: static_address.clone(),
        bugsink_domain: bugsink_fqdn.clone(),
        uptime_domain: uptime_fqdn.clone(),
    };
    let outputs_file = File::create(stack_directory.join(OUTPUTS_FILE_NAME))?;
    serde_yaml::to_writer(outputs_file, &outputs.exports(stack))?;
    File::create(stack_directory.join(CREATED_FILE_NAME))?;

    info!(
        instance = instance_id.as_str(),
        bugsink = format!("https://{bugsink_fqdn}").as_str(),
        uptime = format!("https://{uptime_fqdn}").as_str(),
        credentials_secret = credentials.arn.as_str(),
        "deployment complete"
    );
    Ok(())
}
