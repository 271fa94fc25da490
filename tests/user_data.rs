//! End-to-end shape of the rendered boot script for a realistic
//! configuration: the compose stack, the baked-in values, and the operator
//! summary.

use monitoring_deployer::aws::{
    services::{instance_user_data, UserDataParams, APP_SERVICE_NAME},
    Config,
};

fn config() -> Config {
    serde_yaml::from_str(
        r#"
stack: monitoring
region: us-east-1
zone_id: Z0123456789ABCDEFGHIJ
domain: example.com
bugsink_subdomain: bugsink
uptime_subdomain: uptime
"#,
    )
    .unwrap()
}

fn render(config: &Config) -> String {
    instance_user_data(&UserDataParams {
        region: &config.region,
        db_secret_arn: "arn:aws:secretsmanager:us-east-1:123456789012:secret:monitoring/bugsink/credentials-AbCdEf",
        signing_secret_arn: "arn:aws:secretsmanager:us-east-1:123456789012:secret:monitoring/bugsink/signing-key-GhIjKl",
        bugsink_fqdn: &config.bugsink_fqdn(),
        uptime_fqdn: &config.uptime_fqdn(),
    })
}

#[test]
fn script_serves_both_subdomains_of_the_configured_domain() {
    let config = config();
    let script = render(&config);
    assert!(script.contains("https://bugsink.example.com"));
    assert!(script.contains("https://uptime.example.com"));
    assert!(script.contains("caddy: bugsink.example.com"));
    assert!(script.contains("caddy: uptime.example.com"));
}

#[test]
fn script_provisions_the_full_stack_in_order() {
    let script = render(&config());
    let steps = [
        "exec > >(tee -a /home/ubuntu/user-data.log)",
        "apt-get upgrade -y",
        "sudo ./aws/install",
        "docker-compose-plugin",
        "sudo usermod -aG docker ubuntu",
        "sudo mkdir -p /srv/caddy /srv/bugsink /srv/uptime",
        "aws secretsmanager get-secret-value",
        "cat > docker-compose.yml",
        "envsubst < docker-compose.yml",
        "docker compose up -d",
        "systemctl enable appmonitoring.service",
        "unset DB_PASSWORD",
    ];
    let mut cursor = 0;
    for step in steps {
        let position = script[cursor..]
            .find(step)
            .unwrap_or_else(|| panic!("step missing or out of order: {step}"));
        cursor += position + step.len();
    }
}

#[test]
fn script_fetches_secrets_by_the_granted_references() {
    let config = config();
    let script = render(&config);
    assert!(script.contains(
        "DB_SECRET_ARN=arn:aws:secretsmanager:us-east-1:123456789012:secret:monitoring/bugsink/credentials-AbCdEf"
    ));
    assert!(script.contains(
        "SIGNING_SECRET_ARN=arn:aws:secretsmanager:us-east-1:123456789012:secret:monitoring/bugsink/signing-key-GhIjKl"
    ));
    assert!(script.contains("export AWS_DEFAULT_REGION=$REGION"));
    assert!(script.contains("REGION=us-east-1"));
}

#[test]
fn summary_points_the_operator_at_the_secret_not_the_value() {
    let script = render(&config());
    assert!(script.contains("Secret ARN: arn:aws:secretsmanager"));
    assert!(script.contains("Password: (stored in secret)"));
    // the summary runs after the secret variables are unset
    let unset = script.find("unset DB_PASSWORD").unwrap();
    let summary = script.find("Login credentials are stored").unwrap();
    assert!(unset < summary);
}

#[test]
fn boot_service_restarts_the_same_compose_stack() {
    let script = render(&config());
    assert!(script.contains(&format!(
        "/etc/systemd/system/{APP_SERVICE_NAME}.service"
    )));
    assert!(script.contains("WorkingDirectory=/home/ubuntu"));
    assert!(script.contains("Requires=docker.service"));
}
