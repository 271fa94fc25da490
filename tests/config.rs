//! Configuration loading and validation, exercised the way the CLI does
//! it: a YAML file on disk, parsed and validated before any client is
//! built.

use monitoring_deployer::aws::{
    Config, Error, DEFAULT_INSTANCE_TYPE, DEFAULT_STORAGE_CLASS, DEFAULT_STORAGE_SIZE,
};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn load(file: &NamedTempFile) -> Result<Config, serde_yaml::Error> {
    serde_yaml::from_reader(std::fs::File::open(file.path()).unwrap())
}

const COMPLETE: &str = r#"
stack: monitoring
region: us-east-1
zone_id: Z0123456789ABCDEFGHIJ
domain: example.com
bugsink_subdomain: bugsink
uptime_subdomain: uptime
"#;

#[test]
fn complete_config_loads_and_validates() {
    let file = write_config(COMPLETE);
    let config = load(&file).unwrap();
    config.validate().unwrap();
    assert_eq!(config.bugsink_fqdn(), "bugsink.example.com");
    assert_eq!(config.uptime_fqdn(), "uptime.example.com");
}

#[test]
fn omitted_zone_id_fails_before_any_client_is_built() {
    let file = write_config(
        r#"
stack: monitoring
region: us-east-1
domain: example.com
bugsink_subdomain: bugsink
uptime_subdomain: uptime
"#,
    );
    let err = load(&file).unwrap_err();
    assert!(err.to_string().contains("zone_id"));
}

#[test]
fn empty_zone_id_aborts_naming_the_field() {
    let file = write_config(
        r#"
stack: monitoring
region: us-east-1
zone_id: ""
domain: example.com
bugsink_subdomain: bugsink
uptime_subdomain: uptime
"#,
    );
    let config = load(&file).unwrap();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(err.to_string().contains("zone_id is required"));
}

#[test]
fn sizing_defaults_apply_without_overrides() {
    let file = write_config(COMPLETE);
    let config = load(&file).unwrap();
    assert_eq!(config.instance_type, DEFAULT_INSTANCE_TYPE);
    assert_eq!(config.storage_size, DEFAULT_STORAGE_SIZE);
    assert_eq!(config.storage_class, DEFAULT_STORAGE_CLASS);
}

#[test]
fn storage_override_changes_only_the_volume_size() {
    let file = write_config(&format!("{COMPLETE}storage_size: 200\n"));
    let config = load(&file).unwrap();
    config.validate().unwrap();
    assert_eq!(config.storage_size, 200);

    // Everything else stays at the same value as the un-overridden config
    let base = load(&write_config(COMPLETE)).unwrap();
    assert_eq!(config.stack, base.stack);
    assert_eq!(config.zone_id, base.zone_id);
    assert_eq!(config.domain, base.domain);
    assert_eq!(config.bugsink_subdomain, base.bugsink_subdomain);
    assert_eq!(config.uptime_subdomain, base.uptime_subdomain);
    assert_eq!(config.instance_type, base.instance_type);
    assert_eq!(config.storage_class, base.storage_class);
}
