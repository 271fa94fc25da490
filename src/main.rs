//! Monitoring stack deployer CLI

use clap::{Arg, ArgAction, Command};
use monitoring_deployer::aws;
use std::path::PathBuf;
use tracing::error;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Entrypoint for the monitoring stack deployer CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("monitoring-deployer")
        .version(crate_version())
        .about("Deploy a BugSink and Uptime Kuma monitoring stack behind a Caddy reverse proxy on AWS.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(aws::CREATE_CMD)
                .about("Provision the network, secrets, instance, static address, and DNS records from a YAML configuration file.")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .help("Path to YAML config file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(aws::DESTROY_CMD)
                .about("Destroy all resources associated with a stack.")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .required(true)
                        .help("Path to YAML config file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(aws::LIST_CMD)
                .about("List all active stacks (created but not destroyed)."),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    match matches.subcommand() {
        Some((aws::CREATE_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            if let Err(e) = aws::create(config_path).await {
                error!(error=?e, "failed to create monitoring stack");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((aws::DESTROY_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            if let Err(e) = aws::destroy(config_path).await {
                error!(error=?e, "failed to destroy monitoring stack");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((aws::LIST_CMD, _)) => {
            if let Err(e) = aws::list() {
                error!(error=?e, "failed to list stacks");
            } else {
                return std::process::ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    std::process::ExitCode::FAILURE
}
