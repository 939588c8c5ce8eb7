//! Configuration validation

use super::*;
use anyhow::Result;
use std::path::Path;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_job(&config.job)?;
    validate_container(&config.container)?;
    validate_launch(&config.launch)?;
    validate_storage(&config.storage)?;
    validate_runtime(&config.runtime)?;
    validate_cluster(&config.cluster)?;

    Ok(())
}

/// Validate job settings
pub fn validate_job(job: &JobConfig) -> Result<()> {
    if job.num_containers == 0 {
        anyhow::bail!("Cannot run with no containers");
    }
    if job.listen_port == 0 {
        anyhow::bail!("listen_port must be non-zero");
    }
    Ok(())
}

/// Validate per-container resources
pub fn validate_container(container: &ContainerConfig) -> Result<()> {
    if container.memory_mb == 0 {
        anyhow::bail!("container memory_mb must be at least 1");
    }
    if container.vcores == 0 {
        anyhow::bail!("container vcores must be at least 1");
    }
    Ok(())
}

/// Validate launch settings
pub fn validate_launch(launch: &LaunchConfig) -> Result<()> {
    if launch.script_path.as_os_str().is_empty() {
        anyhow::bail!("Launch script path is empty");
    }
    if launch.shell_command.trim().is_empty() {
        anyhow::bail!("shell_command is empty");
    }
    if launch.script_name.trim().is_empty() || launch.script_name.contains('/') {
        anyhow::bail!("script_name must be a plain file name, got {:?}", launch.script_name);
    }
    if launch.env.keys().any(|k| k.trim().is_empty()) {
        anyhow::bail!("Environment overrides contain an empty key");
    }
    Ok(())
}

/// Validate shared storage settings
pub fn validate_storage(storage: &StorageConfig) -> Result<()> {
    if storage.root.as_os_str().is_empty() {
        anyhow::bail!("storage root is empty");
    }
    if Path::new(&storage.path_prefix).is_absolute() {
        anyhow::bail!("path_prefix must be relative to the storage root, got {:?}", storage.path_prefix);
    }
    Ok(())
}

/// Validate runtime timings
pub fn validate_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.launch_join_timeout_ms == 0 {
        anyhow::bail!("launch_join_timeout_ms must be greater than 0");
    }
    if runtime.heartbeat_interval_ms == 0 {
        anyhow::bail!("heartbeat_interval_ms must be greater than 0");
    }
    Ok(())
}

/// Validate the local cluster description
pub fn validate_cluster(cluster: &ClusterConfig) -> Result<()> {
    if cluster.nodes.is_empty() {
        anyhow::bail!("cluster must have at least one node");
    }
    for (i, node) in cluster.nodes.iter().enumerate() {
        if node.host.trim().is_empty() {
            anyhow::bail!("cluster node {} has an empty host", i);
        }
    }
    Ok(())
}
