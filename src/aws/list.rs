//! `list` subcommand

use crate::aws::{
    deployer_directory, Error, Metadata, CREATED_FILE_NAME, DESTROYED_FILE_NAME,
    METADATA_FILE_NAME,
};
use std::fs::{self, File};
use tracing::info;

/// Lists all active stacks (created but not destroyed)
pub fn list() -> Result<(), Error> {
    // Check if deployer directory exists
    let deployer_dir = deployer_directory(None);
    if !deployer_dir.exists() {
        info!("no stacks found");
        return Ok(());
    }

    // Collect active stacks
    let mut active = Vec::new();
    for entry in fs::read_dir(&deployer_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        // Skip incomplete or destroyed stacks
        let created = path.join(CREATED_FILE_NAME);
        let destroyed = path.join(DESTROYED_FILE_NAME);
        if !created.exists() || destroyed.exists() {
            continue;
        }

        // Load metadata if available, otherwise use directory name as stack
        let metadata_path = path.join(METADATA_FILE_NAME);
        if metadata_path.exists() {
            let file = File::open(&metadata_path)?;
            active.push(serde_yaml::from_reader::<_, Metadata>(file)?);
        } else {
            let Some(stack) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            active.push(Metadata {
                stack: stack.to_string(),
                created_at: 0,
                region: "unknown".to_string(),
                domain: "unknown".to_string(),
            });
        }
    }

    // Display results sorted by creation time (newest first)
    if active.is_empty() {
        info!("no active stacks");
    } else {
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for stack in &active {
            info!(
                stack = stack.stack.as_str(),
                created_at = stack.created_at,
                region = stack.region.as_str(),
                domain = stack.domain.as_str(),
            );
        }
    }
    Ok(())
}
