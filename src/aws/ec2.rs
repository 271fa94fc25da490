//! AWS EC2 SDK wrappers: network, machine image, instance, and static
//! address management.
//!
//! Every `ensure_*` function looks the resource up by its stack tag before
//! creating it, so a re-run against an already-provisioned stack is a
//! no-op.

use crate::aws::{Error, STACK_TAG_KEY};
use aws_config::BehaviorVersion;
pub use aws_config::Region;
use aws_sdk_ec2::{
    config::retry::ReconnectMode,
    error::ProvideErrorMetadata,
    types::{
        AttributeBooleanValue, BlockDeviceMapping, DomainType, EbsBlockDevice, Filter,
        IamInstanceProfileSpecification, InstanceStateName, InstanceType, IpPermission, IpRange,
        ResourceType, Tag, TagSpecification, VolumeType,
    },
    Client as Ec2Client,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

/// Name of the Ubuntu 24.04 image, resolved at deploy time.
///
/// A name query (not a pinned AMI id) means the exact image build can
/// drift between deployments.
pub const UBUNTU_IMAGE_NAME: &str =
    "ubuntu/images/hvm-ssd-gp3/ubuntu-noble-24.04-amd64-server-20250610";

/// Canonical's AWS account id (publisher of official Ubuntu images)
pub const CANONICAL_OWNER_ID: &str = "099720109477";

/// CIDR of the stack's VPC
pub const VPC_CIDR: &str = "10.0.0.0/16";

/// CIDR of the single public subnet
pub const SUBNET_CIDR: &str = "10.0.0.0/24";

/// Maximum number of polling attempts for instance state changes
const MAX_POLL_ATTEMPTS: usize = 60;

/// Maximum number of launch attempts while the instance profile propagates
const MAX_LAUNCH_ATTEMPTS: usize = 10;

/// Interval between retries
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A machine image resolved by name lookup
pub struct MachineImage {
    pub image_id: String,
    pub root_device_name: String,
}

/// Creates an EC2 client for the specified AWS region
pub async fn create_client(region: Region) -> Ec2Client {
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
    Ec2Client::new(&config)
}

/// Filter matching resources tagged with the stack name
fn stack_filter(stack: &str) -> Filter {
    Filter::builder()
        .name(format!("tag:{STACK_TAG_KEY}"))
        .values(stack)
        .build()
}

/// Tags applied to every resource created for the stack
fn tag_specification(resource_type: ResourceType, stack: &str, name: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key(STACK_TAG_KEY).value(stack).build())
        .tags(Tag::builder().key("Name").value(name).build())
        .build()
}

/// Finds or creates the stack's VPC (DNS support and hostnames enabled)
pub async fn ensure_vpc(client: &Ec2Client, stack: &str) -> Result<String, Error> {
    let existing = client
        .describe_vpcs()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    if let Some(vpc) = existing.vpcs().first() {
        let vpc_id = vpc.vpc_id().unwrap().to_string();
        debug!(vpc = vpc_id.as_str(), "vpc already exists");
        return Ok(vpc_id);
    }

    let created = client
        .create_vpc()
        .cidr_block(VPC_CIDR)
        .tag_specifications(tag_specification(
            ResourceType::Vpc,
            stack,
            &format!("{stack}-vpc"),
        ))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let vpc_id = created.vpc().unwrap().vpc_id().unwrap().to_string();

    // Public DNS names for the instance require both attributes
    client
        .modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_support(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    client
        .modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(vpc_id)
}

/// Finds or creates the internet gateway and attaches it to the VPC
pub async fn ensure_internet_gateway(
    client: &Ec2Client,
    vpc_id: &str,
    stack: &str,
) -> Result<String, Error> {
    let existing = client
        .describe_internet_gateways()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    if let Some(igw) = existing.internet_gateways().first() {
        let igw_id = igw.internet_gateway_id().unwrap().to_string();
        let attached = igw
            .attachments()
            .iter()
            .any(|a| a.vpc_id() == Some(vpc_id));
        if !attached {
            client
                .attach_internet_gateway()
                .internet_gateway_id(&igw_id)
                .vpc_id(vpc_id)
                .send()
                .await
                .map_err(aws_sdk_ec2::Error::from)?;
        }
        debug!(igw = igw_id.as_str(), "internet gateway already exists");
        return Ok(igw_id);
    }

    let created = client
        .create_internet_gateway()
        .tag_specifications(tag_specification(
            ResourceType::InternetGateway,
            stack,
            &format!("{stack}-igw"),
        ))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let igw_id = created
        .internet_gateway()
        .unwrap()
        .internet_gateway_id()
        .unwrap()
        .to_string();
    client
        .attach_internet_gateway()
        .internet_gateway_id(&igw_id)
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(igw_id)
}

/// Finds or creates the public route table (default route via the IGW)
pub async fn ensure_route_table(
    client: &Ec2Client,
    vpc_id: &str,
    igw_id: &str,
    stack: &str,
) -> Result<String, Error> {
    let existing = client
        .describe_route_tables()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    if let Some(route_table) = existing.route_tables().first() {
        let route_table_id = route_table.route_table_id().unwrap().to_string();
        debug!(
            route_table = route_table_id.as_str(),
            "route table already exists"
        );
        return Ok(route_table_id);
    }

    let created = client
        .create_route_table()
        .vpc_id(vpc_id)
        .tag_specifications(tag_specification(
            ResourceType::RouteTable,
            stack,
            &format!("{stack}-public"),
        ))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let route_table_id = created
        .route_table()
        .unwrap()
        .route_table_id()
        .unwrap()
        .to_string();
    client
        .create_route()
        .route_table_id(&route_table_id)
        .destination_cidr_block("0.0.0.0/0")
        .gateway_id(igw_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(route_table_id)
}

/// Finds or creates the single public subnet in the region's first
/// availability zone, mapped to the public route table
pub async fn ensure_subnet(
    client: &Ec2Client,
    vpc_id: &str,
    route_table_id: &str,
    stack: &str,
) -> Result<String, Error> {
    let existing = client
        .describe_subnets()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    if let Some(subnet) = existing.subnets().first() {
        let subnet_id = subnet.subnet_id().unwrap().to_string();
        debug!(subnet = subnet_id.as_str(), "subnet already exists");
        return Ok(subnet_id);
    }

    let zones = client
        .describe_availability_zones()
        .filters(
            Filter::builder()
                .name("state")
                .values("available")
                .build(),
        )
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let az = zones
        .availability_zones()
        .first()
        .and_then(|z| z.zone_name())
        .map(str::to_string)
        .ok_or(Error::NoAvailabilityZone)?;
    info!(az = az.as_str(), "selected availability zone");

    let created = client
        .create_subnet()
        .vpc_id(vpc_id)
        .cidr_block(SUBNET_CIDR)
        .availability_zone(&az)
        .tag_specifications(tag_specification(
            ResourceType::Subnet,
            stack,
            &format!("{stack}-public"),
        ))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let subnet_id = created.subnet().unwrap().subnet_id().unwrap().to_string();
    client
        .modify_subnet_attribute()
        .subnet_id(&subnet_id)
        .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    client
        .associate_route_table()
        .route_table_id(route_table_id)
        .subnet_id(&subnet_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(subnet_id)
}

/// Finds or creates the web security group: TCP 80 and 443 open to any
/// IPv4 address (ACME HTTP-01 challenges and public HTTPS access)
pub async fn ensure_security_group_web(
    client: &Ec2Client,
    vpc_id: &str,
    stack: &str,
) -> Result<String, Error> {
    let existing = client
        .describe_security_groups()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    if let Some(sg) = existing.security_groups().first() {
        let sg_id = sg.group_id().unwrap().to_string();
        debug!(sg = sg_id.as_str(), "security group already exists");
        return Ok(sg_id);
    }

    let created = client
        .create_security_group()
        .group_name(format!("{stack}-web"))
        .description("Inbound HTTP/HTTPS for BugSink and Uptime Kuma")
        .vpc_id(vpc_id)
        .tag_specifications(tag_specification(
            ResourceType::SecurityGroup,
            stack,
            &format!("{stack}-web"),
        ))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let sg_id = created.group_id().unwrap().to_string();
    client
        .authorize_security_group_ingress()
        .group_id(&sg_id)
        .ip_permissions(
            IpPermission::builder()
                .ip_protocol("tcp")
                .from_port(80)
                .to_port(80)
                .ip_ranges(
                    IpRange::builder()
                        .cidr_ip("0.0.0.0/0")
                        .description("Let's Encrypt HTTP-01 challenge")
                        .build(),
                )
                .build(),
        )
        .ip_permissions(
            IpPermission::builder()
                .ip_protocol("tcp")
                .from_port(443)
                .to_port(443)
                .ip_ranges(
                    IpRange::builder()
                        .cidr_ip("0.0.0.0/0")
                        .description("Public HTTPS access")
                        .build(),
                )
                .build(),
        )
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(sg_id)
}

/// Resolves the Ubuntu machine image by name, newest build first
pub async fn find_machine_image(client: &Ec2Client) -> Result<MachineImage, Error> {
    let response = client
        .describe_images()
        .owners(CANONICAL_OWNER_ID)
        .filters(Filter::builder().name("name").values(UBUNTU_IMAGE_NAME).build())
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let mut images = response.images().to_vec();
    images.sort_by(|a, b| b.creation_date().cmp(&a.creation_date()));
    let image = images
        .first()
        .ok_or_else(|| Error::MachineImageNotFound(UBUNTU_IMAGE_NAME.to_string()))?;
    Ok(MachineImage {
        image_id: image.image_id().unwrap().to_string(),
        root_device_name: image.root_device_name().unwrap().to_string(),
    })
}

/// Parameters for launching the monitoring instance
pub struct LaunchSpec<'a> {
    pub image: &'a MachineImage,
    pub instance_type: &'a str,
    pub storage_size: i32,
    pub storage_class: &'a str,
    pub subnet_id: &'a str,
    pub security_group_id: &'a str,
    pub instance_profile: &'a str,
    pub user_data: &'a str,
}

/// Finds the stack's instance (pending or running), if any
pub async fn find_instance(client: &Ec2Client, stack: &str) -> Result<Option<String>, Error> {
    let response = client
        .describe_instances()
        .filters(stack_filter(stack))
        .filters(
            Filter::builder()
                .name("instance-state-name")
                .values("pending")
                .values("running")
                .build(),
        )
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    for reservation in response.reservations() {
        if let Some(instance) = reservation.instances().first() {
            return Ok(Some(instance.instance_id().unwrap().to_string()));
        }
    }
    Ok(None)
}

/// Finds or launches the monitoring instance.
///
/// Launching retries while the freshly created instance profile propagates
/// to EC2 (surfaced as `InvalidParameterValue`).
pub async fn ensure_instance(
    client: &Ec2Client,
    stack: &str,
    spec: &LaunchSpec<'_>,
) -> Result<String, Error> {
    if let Some(instance_id) = find_instance(client, stack).await? {
        debug!(instance = instance_id.as_str(), "instance already exists");
        return Ok(instance_id);
    }

    let instance_type = InstanceType::try_parse(spec.instance_type)
        .map_err(|_| Error::InvalidInstanceType(spec.instance_type.to_string()))?;
    let volume_type = VolumeType::try_parse(spec.storage_class)
        .map_err(|_| Error::InvalidStorageClass(spec.storage_class.to_string()))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = client
            .run_instances()
            .image_id(&spec.image.image_id)
            .instance_type(instance_type.clone())
            .min_count(1)
            .max_count(1)
            .subnet_id(spec.subnet_id)
            .security_group_ids(spec.security_group_id)
            .iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(spec.instance_profile)
                    .build(),
            )
            .user_data(BASE64.encode(spec.user_data))
            .block_device_mappings(
                BlockDeviceMapping::builder()
                    .device_name(&spec.image.root_device_name)
                    .ebs(
                        EbsBlockDevice::builder()
                            .volume_size(spec.storage_size)
                            .volume_type(volume_type.clone())
                            .delete_on_termination(true)
                            .build(),
                    )
                    .build(),
            )
            .tag_specifications(tag_specification(
                ResourceType::Instance,
                stack,
                &format!("{stack}-monitoring"),
            ))
            .send()
            .await;
        match result {
            Ok(response) => {
                let instance_id = response
                    .instances()
                    .first()
                    .and_then(|i| i.instance_id())
                    .unwrap()
                    .to_string();
                return Ok(instance_id);
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.code() == Some("InvalidParameterValue")
                    && attempt < MAX_LAUNCH_ATTEMPTS
                {
                    // Instance profile not yet visible to EC2
                    debug!(attempt, "launch rejected, retrying");
                    sleep(RETRY_INTERVAL).await;
                    continue;
                }
                return Err(aws_sdk_ec2::Error::from(service_err).into());
            }
        }
    }
}

/// Polls until the instance reports the `running` state
pub async fn wait_for_instance_running(
    client: &Ec2Client,
    instance_id: &str,
) -> Result<(), Error> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        let response = client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        let state = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .and_then(|i| i.state())
            .and_then(|s| s.name());
        if state == Some(&InstanceStateName::Running) {
            return Ok(());
        }
        sleep(RETRY_INTERVAL).await;
    }
    Err(Error::WaitTimeout("instance to reach running state"))
}

/// Finds or allocates the stack's Elastic IP, returning its allocation id
/// and public address
pub async fn ensure_elastic_ip(
    client: &Ec2Client,
    stack: &str,
) -> Result<(String, String), Error> {
    let existing = client
        .describe_addresses()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    if let Some(address) = existing.addresses().first() {
        let allocation_id = address.allocation_id().unwrap().to_string();
        let public_ip = address.public_ip().unwrap().to_string();
        debug!(ip = public_ip.as_str(), "elastic ip already allocated");
        return Ok((allocation_id, public_ip));
    }

    let allocated = client
        .allocate_address()
        .domain(DomainType::Vpc)
        .tag_specifications(tag_specification(
            ResourceType::ElasticIp,
            stack,
            &format!("{stack}-eip"),
        ))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok((
        allocated.allocation_id().unwrap().to_string(),
        allocated.public_ip().unwrap().to_string(),
    ))
}

/// Binds the Elastic IP to the instance (no-op if already bound)
pub async fn associate_elastic_ip(
    client: &Ec2Client,
    allocation_id: &str,
    instance_id: &str,
) -> Result<(), Error> {
    let response = client
        .describe_addresses()
        .allocation_ids(allocation_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    if let Some(address) = response.addresses().first() {
        if address.instance_id() == Some(instance_id) {
            debug!(instance = instance_id, "elastic ip already associated");
            return Ok(());
        }
    }
    client
        .associate_address()
        .allocation_id(allocation_id)
        .instance_id(instance_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(())
}

/// Terminates the stack's instance (if any) and waits for it to disappear
pub async fn terminate_instance(client: &Ec2Client, stack: &str) -> Result<Option<String>, Error> {
    let response = client
        .describe_instances()
        .filters(stack_filter(stack))
        .filters(
            Filter::builder()
                .name("instance-state-name")
                .values("pending")
                .values("running")
                .values("stopping")
                .values("stopped")
                .build(),
        )
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let Some(instance_id) = response
        .reservations()
        .first()
        .and_then(|r| r.instances().first())
        .and_then(|i| i.instance_id())
        .map(str::to_string)
    else {
        return Ok(None);
    };

    client
        .terminate_instances()
        .instance_ids(&instance_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    info!(instance = instance_id.as_str(), "terminating instance");
    for _ in 0..MAX_POLL_ATTEMPTS {
        let response = client
            .describe_instances()
            .instance_ids(&instance_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        let state = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .and_then(|i| i.state())
            .and_then(|s| s.name());
        if state == Some(&InstanceStateName::Terminated) {
            return Ok(Some(instance_id));
        }
        sleep(RETRY_INTERVAL).await;
    }
    Err(Error::WaitTimeout("instance to terminate"))
}

/// Releases the stack's Elastic IP, disassociating it first if bound
pub async fn release_elastic_ip(client: &Ec2Client, stack: &str) -> Result<(), Error> {
    let response = client
        .describe_addresses()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let Some(address) = response.addresses().first() else {
        return Ok(());
    };
    if let Some(association_id) = address.association_id() {
        client
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
    }
    if let Some(allocation_id) = address.allocation_id() {
        client
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        info!(ip = address.public_ip().unwrap_or_default(), "released elastic ip");
    }
    Ok(())
}

/// Deletes the stack's security groups, retrying while the terminated
/// instance's network interfaces detach
pub async fn delete_security_groups(client: &Ec2Client, stack: &str) -> Result<(), Error> {
    let response = client
        .describe_security_groups()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    for sg in response.security_groups() {
        let sg_id = sg.group_id().unwrap();
        let mut deleted = false;
        for _ in 0..MAX_POLL_ATTEMPTS {
            match client.delete_security_group().group_id(sg_id).send().await {
                Ok(_) => {
                    info!(sg = sg_id, "deleted security group");
                    deleted = true;
                    break;
                }
                Err(err) => {
                    let service_err = err.into_service_error();
                    match service_err.code() {
                        Some("DependencyViolation") => sleep(RETRY_INTERVAL).await,
                        Some("InvalidGroup.NotFound") => {
                            deleted = true;
                            break;
                        }
                        _ => return Err(aws_sdk_ec2::Error::from(service_err).into()),
                    }
                }
            }
        }
        if !deleted {
            return Err(Error::WaitTimeout("security group to become deletable"));
        }
    }
    Ok(())
}

/// Deletes the stack's network: subnet, route table, internet gateway, VPC
pub async fn delete_network(client: &Ec2Client, stack: &str) -> Result<(), Error> {
    let vpcs = client
        .describe_vpcs()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let Some(vpc_id) = vpcs
        .vpcs()
        .first()
        .and_then(|v| v.vpc_id())
        .map(str::to_string)
    else {
        return Ok(());
    };

    let subnets = client
        .describe_subnets()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    for subnet in subnets.subnets() {
        client
            .delete_subnet()
            .subnet_id(subnet.subnet_id().unwrap())
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
    }

    let route_tables = client
        .describe_route_tables()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    for route_table in route_tables.route_tables() {
        client
            .delete_route_table()
            .route_table_id(route_table.route_table_id().unwrap())
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
    }

    let igws = client
        .describe_internet_gateways()
        .filters(stack_filter(stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    for igw in igws.internet_gateways() {
        let igw_id = igw.internet_gateway_id().unwrap();
        if igw.attachments().iter().any(|a| a.vpc_id() == Some(vpc_id.as_str())) {
            client
                .detach_internet_gateway()
                .internet_gateway_id(igw_id)
                .vpc_id(&vpc_id)
                .send()
                .await
                .map_err(aws_sdk_ec2::Error::from)?;
        }
        client
            .delete_internet_gateway()
            .internet_gateway_id(igw_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
    }

    client
        .delete_vpc()
        .vpc_id(&vpc_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    info!(vpc = vpc_id.as_str(), "deleted network");
    Ok(())
}
